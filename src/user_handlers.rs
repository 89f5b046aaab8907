use crate::auth::{AuthenticatedUser, TokenService};
use crate::credentials::CredentialStore;
use crate::error::AppError;
use crate::models::{
    AuthResponse, LoginRequest, RegisterRequest, SessionResponse, SessionUser, UserResponse,
};
use actix_web::{post, web, HttpResponse};
use chrono::DateTime;
use tracing::info;

#[post("/register")]
pub async fn register(
    body: web::Json<RegisterRequest>,
    store: web::Data<CredentialStore>,
    tokens: web::Data<TokenService>,
) -> Result<HttpResponse, AppError> {
    let RegisterRequest { username, password } = body.into_inner();
    let user = web::block(move || store.register(&username, &password)).await??;
    let token = tokens.issue(&user)?;

    Ok(HttpResponse::Created().json(AuthResponse {
        user: UserResponse::from(&user),
        token,
    }))
}

#[post("/login")]
pub async fn login(
    body: web::Json<LoginRequest>,
    store: web::Data<CredentialStore>,
    tokens: web::Data<TokenService>,
) -> Result<HttpResponse, AppError> {
    let LoginRequest { username, password } = body.into_inner();
    let user = web::block(move || store.verify(&username, &password)).await??;
    let token = tokens.issue(&user)?;

    info!(user_id = %user.id, "user logged in");
    Ok(HttpResponse::Ok().json(AuthResponse {
        user: UserResponse::from(&user),
        token,
    }))
}

/// Echoes the identity the guard attached. Must be mounted behind
/// `require_bearer`.
pub async fn me(AuthenticatedUser(claims): AuthenticatedUser) -> Result<HttpResponse, AppError> {
    let expires_at = DateTime::from_timestamp(claims.exp, 0)
        .ok_or_else(|| AppError::Internal(format!("exp {} out of range", claims.exp)))?;

    Ok(HttpResponse::Ok().json(SessionResponse {
        user: SessionUser {
            id: claims.sub,
            username: claims.username,
        },
        expires_at,
    }))
}
