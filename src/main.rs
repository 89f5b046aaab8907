mod auth;
mod config;
mod credentials;
mod db;
mod error;
mod models;
mod user_handlers;

use crate::auth::{require_bearer, TokenService};
use crate::config::Config;
use crate::credentials::CredentialStore;
use crate::db::Database;
use crate::error::AppError;
use crate::models::FieldError;
use actix_cors::Cors;
use actix_web::{
    get, http::header, middleware::from_fn, middleware::Logger, web, App, HttpResponse,
    HttpServer, Responder,
};
use serde_json::json;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[get("/")]
async fn index() -> impl Responder {
    HttpResponse::Ok().body("Server is ready")
}

/// Simple health check
#[get("/health")]
async fn health() -> impl Responder {
    HttpResponse::Ok().body("OK")
}

/// Reports whether the credential store answers a query
#[get("/dbcheck")]
async fn dbcheck(store: web::Data<CredentialStore>) -> impl Responder {
    match web::block(move || store.ping()).await {
        Ok(Ok(())) => HttpResponse::Ok().json(json!({
            "connected": true,
            "message": "Database is connected",
        })),
        _ => HttpResponse::InternalServerError().json(json!({
            "connected": false,
            "message": "Database is not connected",
        })),
    }
}

/// Fallback for guarded scopes with nothing mounted at the requested path
async fn not_found() -> impl Responder {
    HttpResponse::NotFound().json(json!({ "error": "Not found" }))
}

/// Cross-origin policy for the browser frontend. A `*` entry allows any
/// origin; otherwise only the listed ones.
fn cors(origins: &[String]) -> Cors {
    let cors = Cors::default()
        .allowed_methods(vec!["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"])
        .allowed_headers(vec![
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
        ])
        .max_age(3600);

    if origins.iter().any(|origin| origin == "*") {
        cors.allow_any_origin()
    } else {
        origins
            .iter()
            .fold(cors, |cors, origin| cors.allowed_origin(origin))
    }
}

/// Mounts every route. Shared state is registered by the caller.
fn routes(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(|err, req| {
        warn!(error = %err, path = %req.path(), "malformed request body");
        AppError::Validation(vec![FieldError::new(
            "body",
            "Request body must be JSON with username and password",
        )])
        .into()
    }))
    .service(index)
    .service(health)
    .service(dbcheck)
    .service(
        web::scope("/api/auth")
            .service(user_handlers::register)
            .service(user_handlers::login)
            .service(
                web::resource("/me")
                    .wrap(from_fn(require_bearer))
                    .route(web::get().to(user_handlers::me)),
            ),
    )
    .service(
        web::scope("/api/products")
            .wrap(from_fn(require_bearer))
            .default_service(web::to(not_found)),
    );
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().map_err(|e| {
        error!(error = %e, "invalid configuration");
        std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
    })?;

    let db = Database::open(&config.database_url).map_err(|e| {
        error!(error = %e, url = %config.database_url, "failed to open database");
        std::io::Error::other(e)
    })?;
    match db.count_users() {
        Ok(users) => info!(users, url = %config.database_url, "credential store ready"),
        Err(e) => warn!(error = %e, "could not count users"),
    }
    let store = CredentialStore::new(db, config.bcrypt_cost).map_err(std::io::Error::other)?;

    let store = web::Data::new(store);
    let tokens = web::Data::new(TokenService::new(&config.jwt_secret, config.token_ttl_hours));

    let addr = config.bind_addr();
    let cors_origins = config.cors_allowed_origins.clone();
    info!(%addr, ttl_hours = config.token_ttl_hours, origins = ?cors_origins, "listening");

    HttpServer::new(move || {
        App::new()
            .wrap(cors(&cors_origins))
            .wrap(Logger::default())
            .app_data(store.clone())
            .app_data(tokens.clone())
            .configure(routes)
    })
    .bind(addr)?
    .run()
    .await
}
