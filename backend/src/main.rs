mod auth;
mod config;
mod pipeline;
mod routes;
mod storage;
mod users;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use auth::jwt::JwtService;
use auth::middleware::AuthMiddleware;
use config::AppConfig;
use pipeline::classifier::TorchClassifier;
use pipeline::font::FontSet;
use pipeline::overlay::OverlayRenderer;
use pipeline::Pipeline;
use routes::{configure_routes, UploadLimit};
use std::env;
use std::io::Error;
use std::sync::Arc;
use storage::overlay_store::OverlayStore;
use users::repository::UserRepository;

fn startup_error(what: &str, e: impl std::fmt::Debug) -> Error {
    log::error!("{}: {:?}", what, e);
    Error::other(format!("{}: {:?}", what, e))
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    if let Ok(current_dir) = env::current_dir() {
        log::info!("Current working directory: {}", current_dir.display());
    } else {
        log::error!("Failed to get the current working directory.");
    }

    let config = AppConfig::from_env().map_err(|e| startup_error("Invalid configuration", e))?;

    let classifier = TorchClassifier::load(&config.classifier)
        .map_err(|e| startup_error("Model loading failed", e))?;

    let fonts = FontSet::load(&config.overlay.bold_font, &config.overlay.regular_font);
    if fonts.bold.is_builtin() || fonts.regular.is_builtin() {
        log::warn!("Overlay annotations will use the built-in bitmap font");
    }
    let renderer = OverlayRenderer::new(config.overlay.clone(), fonts);
    let pipeline = Pipeline::new(Arc::new(classifier), renderer);

    let store = OverlayStore::new(&config.upload_dir)
        .map_err(|e| startup_error("Upload directory unavailable", e))?;
    log::info!("Storing overlays in {}", store.root().display());

    let users = match &config.users_file {
        Some(path) => UserRepository::open(path.clone())
            .map_err(|e| startup_error("Failed to open user store", e))?,
        None => {
            log::warn!("USERS_FILE not set, accounts are kept in memory only");
            UserRepository::in_memory()
        }
    };

    let jwt_service = JwtService::new(&config.jwt_secret);
    let auth_middleware = AuthMiddleware::new(jwt_service.clone());
    let upload_limit = UploadLimit(config.max_upload_bytes);
    let static_dir = config.static_dir.clone();

    log::info!("Starting server on {}", config.bind_address);

    HttpServer::new(move || {
        App::new()
            .wrap(auth_middleware.clone())
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allowed_methods(vec!["GET", "POST", "OPTIONS"])
                    .allowed_headers(vec![
                        actix_web::http::header::AUTHORIZATION,
                        actix_web::http::header::ACCEPT,
                        actix_web::http::header::CONTENT_TYPE,
                    ])
                    .max_age(3600),
            )
            .app_data(web::Data::new(pipeline.clone()))
            .app_data(web::Data::new(store.clone()))
            .app_data(web::Data::new(upload_limit))
            .app_data(web::Data::new(users.clone()))
            .app_data(web::Data::new(jwt_service.clone()))
            .configure(|cfg| configure_routes(cfg, static_dir.clone()))
    })
    .bind(&config.bind_address)?
    .run()
    .await
}
