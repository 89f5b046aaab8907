use crate::db::Database;
use crate::error::AppError;
use crate::models::{FieldError, User};
use bcrypt::{hash, verify};
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

const USERNAME_MIN_CHARS: usize = 3;
const USERNAME_MAX_CHARS: usize = 50;
const PASSWORD_MIN_CHARS: usize = 6;
// bcrypt only reads the first 72 bytes of its input.
const PASSWORD_MAX_BYTES: usize = 72;

/// Registers accounts and checks passwords against the user table.
///
/// All methods block (SQLite and bcrypt); handlers call them through
/// `web::block`.
pub struct CredentialStore {
    db: Database,
    bcrypt_cost: u32,
    dummy_hash: String,
}

impl CredentialStore {
    pub fn new(db: Database, bcrypt_cost: u32) -> Result<Self, AppError> {
        // Compared against when the username is unknown, so a miss costs as
        // much as a wrong password.
        let dummy_hash = hash("stockroom-placeholder", bcrypt_cost)?;
        Ok(Self {
            db,
            bcrypt_cost,
            dummy_hash,
        })
    }

    pub fn register(&self, username: &str, password: &str) -> Result<User, AppError> {
        let username = validate_registration(username, password)?;

        let user = User {
            id: Uuid::new_v4(),
            username,
            password_hash: hash(password, self.bcrypt_cost)?,
            created_at: Utc::now(),
        };
        self.db.insert_user(&user)?;

        info!(user_id = %user.id, username = %user.username, "registered user");
        Ok(user)
    }

    /// Fails with `InvalidCredentials` whether the account is missing or the
    /// password is wrong.
    pub fn verify(&self, username: &str, password: &str) -> Result<User, AppError> {
        match self.db.find_user_by_username(username.trim())? {
            Some(user) => {
                if verify(password, &user.password_hash)? {
                    Ok(user)
                } else {
                    Err(AppError::InvalidCredentials)
                }
            }
            None => {
                let _ = verify(password, &self.dummy_hash);
                Err(AppError::InvalidCredentials)
            }
        }
    }

    pub fn ping(&self) -> Result<(), AppError> {
        self.db.ping().map_err(AppError::from)
    }
}

/// Checks both fields and reports every failure at once. Returns the trimmed
/// username that gets stored.
pub fn validate_registration(username: &str, password: &str) -> Result<String, AppError> {
    let mut errors = Vec::new();
    let username = username.trim();

    if username.is_empty() {
        errors.push(FieldError::new("username", "Username is required"));
    } else if username.chars().count() < USERNAME_MIN_CHARS {
        errors.push(FieldError::new(
            "username",
            "Username must be at least 3 characters long",
        ));
    } else if username.chars().count() > USERNAME_MAX_CHARS {
        errors.push(FieldError::new(
            "username",
            "Username must be at most 50 characters long",
        ));
    } else if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        errors.push(FieldError::new(
            "username",
            "Username can only contain letters, numbers, and underscores",
        ));
    }

    if password.is_empty() {
        errors.push(FieldError::new("password", "Password is required"));
    } else if password.chars().count() < PASSWORD_MIN_CHARS {
        errors.push(FieldError::new(
            "password",
            "Password must be at least 6 characters long",
        ));
    } else if password.len() > PASSWORD_MAX_BYTES {
        errors.push(FieldError::new(
            "password",
            "Password must be at most 72 bytes long",
        ));
    }

    if errors.is_empty() {
        Ok(username.to_string())
    } else {
        Err(AppError::Validation(errors))
    }
}
