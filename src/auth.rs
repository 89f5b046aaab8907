use crate::error::AppError;
use crate::models::{Claims, User};
use actix_web::{
    body::MessageBody,
    dev::{Payload, ServiceRequest, ServiceResponse},
    http::header::Header,
    middleware::Next,
    web, FromRequest, HttpMessage, HttpRequest,
};
use actix_web_httpauth::headers::authorization::{Authorization, Bearer};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{
    decode, encode, Algorithm, DecodingKey, EncodingKey, Header as JwtHeader, Validation,
};
use std::future::{ready, Ready};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Why the guard turned a request away. Logged, never sent to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("missing token")]
    MissingToken,

    #[error("invalid token")]
    InvalidSignature,

    #[error("expired token")]
    Expired,
}

/// Issues and verifies HS256 bearer tokens. Built once from the startup
/// config and shared read-only between workers.
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl TokenService {
    pub fn new(secret: &str, ttl_hours: i64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is compared in verify_at, after the signature holds.
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            ttl: Duration::hours(ttl_hours),
        }
    }

    pub fn issue(&self, user: &User) -> Result<String, AppError> {
        self.issue_at(user, Utc::now())
    }

    pub fn issue_at(&self, user: &User, now: DateTime<Utc>) -> Result<String, AppError> {
        let claims = Claims {
            sub: user.id,
            username: user.username.clone(),
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
            jti: Uuid::new_v4(),
        };

        debug!(user_id = %user.id, exp = claims.exp, "issuing token");

        encode(&JwtHeader::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AppError::Internal(format!("failed to sign token: {e}")))
    }

    pub fn verify(&self, token: &str) -> Result<Claims, Rejection> {
        self.verify_at(token, Utc::now())
    }

    /// Checks the signature first; the embedded `exp` is only read once the
    /// token is known to be ours. A token is valid strictly before `exp`.
    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<Claims, Rejection> {
        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|_| Rejection::InvalidSignature)?
            .claims;

        if now.timestamp() >= claims.exp {
            return Err(Rejection::Expired);
        }
        Ok(claims)
    }
}

fn bearer_token(req: &ServiceRequest) -> Option<String> {
    Authorization::<Bearer>::parse(req)
        .ok()
        .map(|auth| auth.into_scheme().token().to_string())
}

/// Route guard for protected scopes. On success the verified claims go into
/// the request extensions for `AuthenticatedUser`; on failure the request
/// ends here with a 401 and the wrapped service never runs.
pub async fn require_bearer(
    req: ServiceRequest,
    next: Next<impl MessageBody + 'static>,
) -> Result<ServiceResponse<impl MessageBody>, actix_web::Error> {
    let Some(tokens) = req.app_data::<web::Data<TokenService>>().cloned() else {
        let err = AppError::Internal("token service not registered".to_string());
        return Ok(req.error_response(err).map_into_right_body());
    };

    let outcome = match bearer_token(&req) {
        Some(token) => tokens.verify(&token),
        None => Err(Rejection::MissingToken),
    };

    match outcome {
        Ok(claims) => {
            req.extensions_mut().insert(claims);
            next.call(req).await.map(ServiceResponse::map_into_left_body)
        }
        Err(reason) => {
            warn!(%reason, path = %req.path(), "rejected request");
            Ok(req
                .error_response(AppError::Unauthorized(reason))
                .map_into_right_body())
        }
    }
}

/// Identity of the caller, available to handlers behind `require_bearer`.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub Claims);

impl FromRequest for AuthenticatedUser {
    type Error = AppError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(
            req.extensions()
                .get::<Claims>()
                .cloned()
                .map(AuthenticatedUser)
                .ok_or(AppError::Unauthorized(Rejection::MissingToken)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::StatusCode, middleware::from_fn, test as actix_test, App, HttpResponse};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const SECRET: &str = "test-secret-key-12345";

    fn test_user() -> User {
        User {
            id: Uuid::new_v4(),
            username: "alice".to_string(),
            password_hash: "hash".to_string(),
            created_at: Utc::now(),
        }
    }

    /// Flips one character inside the signature segment.
    fn tamper(token: &str) -> String {
        let (head, signature) = token.rsplit_once('.').unwrap();
        let mut sig: Vec<char> = signature.chars().collect();
        sig[0] = if sig[0] == 'A' { 'B' } else { 'A' };
        format!("{head}.{}", sig.into_iter().collect::<String>())
    }

    #[test]
    fn test_issue_and_verify() {
        let tokens = TokenService::new(SECRET, 24);
        let user = test_user();
        let now = Utc::now();

        let token = tokens.issue_at(&user, now).unwrap();
        let claims = tokens.verify_at(&token, now).unwrap();

        assert_eq!(claims.sub, user.id);
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.iat, now.timestamp());
        assert_eq!(claims.exp, (now + Duration::hours(24)).timestamp());
    }

    #[test]
    fn test_token_expires_at_exp() {
        let tokens = TokenService::new(SECRET, 1);
        let issued = Utc::now();
        let token = tokens.issue_at(&test_user(), issued).unwrap();

        let just_before = issued + Duration::hours(1) - Duration::seconds(1);
        assert!(tokens.verify_at(&token, just_before).is_ok());

        let at_expiry = issued + Duration::hours(1);
        assert_eq!(tokens.verify_at(&token, at_expiry), Err(Rejection::Expired));
        assert_eq!(
            tokens.verify_at(&token, issued + Duration::days(3)),
            Err(Rejection::Expired)
        );
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let tokens = TokenService::new(SECRET, 24);
        let token = tokens.issue(&test_user()).unwrap();

        assert_eq!(tokens.verify(&tamper(&token)), Err(Rejection::InvalidSignature));
    }

    #[test]
    fn test_signature_checked_before_expiry() {
        // An expired token with a broken signature is reported as invalid,
        // since its exp cannot be trusted.
        let tokens = TokenService::new(SECRET, 1);
        let issued = Utc::now() - Duration::days(2);
        let token = tokens.issue_at(&test_user(), issued).unwrap();

        assert_eq!(tokens.verify(&token), Err(Rejection::Expired));
        assert_eq!(tokens.verify(&tamper(&token)), Err(Rejection::InvalidSignature));
    }

    #[test]
    fn test_different_secrets_reject() {
        let issuer = TokenService::new("secret1", 24);
        let verifier = TokenService::new("secret2", 24);
        let token = issuer.issue(&test_user()).unwrap();

        assert_eq!(verifier.verify(&token), Err(Rejection::InvalidSignature));
    }

    #[test]
    fn test_garbage_rejected() {
        let tokens = TokenService::new(SECRET, 24);
        for token in ["", "invalid.token.here", "a.b", "not a jwt"] {
            assert_eq!(tokens.verify(token), Err(Rejection::InvalidSignature));
        }
    }

    #[test]
    fn test_tokens_are_not_idempotent() {
        let tokens = TokenService::new(SECRET, 24);
        let user = test_user();
        let now = Utc::now();

        let first = tokens.issue_at(&user, now).unwrap();
        let same_instant = tokens.issue_at(&user, now).unwrap();
        let later = tokens.issue_at(&user, now + Duration::seconds(5)).unwrap();

        assert_ne!(first, same_instant);
        assert_ne!(first, later);
    }

    async fn whoami(user: AuthenticatedUser, hits: web::Data<Arc<AtomicUsize>>) -> HttpResponse {
        hits.fetch_add(1, Ordering::SeqCst);
        HttpResponse::Ok().body(user.0.username)
    }

    macro_rules! guarded_app {
        ($tokens:expr, $hits:expr) => {
            actix_test::init_service(
                App::new()
                    .app_data($tokens.clone())
                    .app_data(web::Data::new($hits.clone()))
                    .service(
                        web::scope("/protected")
                            .wrap(from_fn(require_bearer))
                            .route("", web::get().to(whoami)),
                    ),
            )
            .await
        };
    }

    #[actix_web::test]
    async fn test_guard_rejects_missing_token_before_handler() {
        let tokens = web::Data::new(TokenService::new(SECRET, 24));
        let hits = Arc::new(AtomicUsize::new(0));
        let app = guarded_app!(tokens, hits);

        let req = actix_test::TestRequest::get().uri("/protected").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let req = actix_test::TestRequest::get()
            .uri("/protected")
            .insert_header(("Authorization", "Basic YWxpY2U6c2VjcmV0"))
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[actix_web::test]
    async fn test_guard_rejects_bad_tokens() {
        let tokens = web::Data::new(TokenService::new(SECRET, 1));
        let hits = Arc::new(AtomicUsize::new(0));
        let app = guarded_app!(tokens, hits);

        let user = test_user();
        let valid = tokens.issue(&user).unwrap();
        let expired = tokens
            .issue_at(&user, Utc::now() - Duration::hours(2))
            .unwrap();

        for token in [tamper(&valid), expired, "garbage".to_string()] {
            let req = actix_test::TestRequest::get()
                .uri("/protected")
                .insert_header(("Authorization", format!("Bearer {token}")))
                .to_request();
            let resp = actix_test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

            let body: serde_json::Value = actix_test::read_body_json(resp).await;
            assert_eq!(body["error"], "Unauthorized");
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[actix_web::test]
    async fn test_guard_attaches_identity() {
        let tokens = web::Data::new(TokenService::new(SECRET, 24));
        let hits = Arc::new(AtomicUsize::new(0));
        let app = guarded_app!(tokens, hits);

        let token = tokens.issue(&test_user()).unwrap();
        let req = actix_test::TestRequest::get()
            .uri("/protected")
            .insert_header(("Authorization", format!("Bearer {token}")))
            .to_request();
        let body = actix_test::call_and_read_body(&app, req).await;

        assert_eq!(body, "alice");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[actix_web::test]
    async fn test_extractor_without_guard_is_unauthorized() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(hits.clone()))
                .route("/open", web::get().to(whoami)),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/open").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
