use actix_files::{Files, NamedFile};
use actix_multipart::{Multipart, MultipartError};
use actix_web::{web, Error, HttpRequest, HttpResponse};
use futures::TryStreamExt;
use log::{error, info, warn};
use rand::seq::IndexedRandom;
use shared::{to_percent, DashboardResponse, ErrorResponse, PredictionResponse};
use std::path::PathBuf;

use crate::auth;
use crate::auth::middleware::AuthenticatedUser;
use crate::pipeline::classifier::ClassifierError;
use crate::pipeline::preprocess::{decode_file, PreprocessError};
use crate::pipeline::Pipeline;
use crate::storage::overlay_store::{OverlayStore, ScratchUpload, StorageError};
use crate::users::repository::UserRepository;

pub const IMAGE_FIELD: &str = "image";

pub const QUOTES: [&str; 4] = [
    "\"AI will be as common in healthcare as the stethoscope.\" - Robert Pearl",
    "\"The greatest opportunity of AI is restoring the human touch.\" - Eric Topol",
    "\"AI enhances physicians' focus on personalized care.\" - Steven Lin",
    "\"AI is the key to unlocking personalized medicine.\" - Healthcare 2018",
];

/// Upper bound on the bytes accepted for one uploaded image.
#[derive(Debug, Clone, Copy)]
pub struct UploadLimit(pub usize);

#[derive(Debug, thiserror::Error)]
enum PredictError {
    #[error(transparent)]
    Decode(#[from] PreprocessError),
    #[error(transparent)]
    Inference(#[from] ClassifierError),
}

pub fn configure_routes(cfg: &mut web::ServiceConfig, static_dir: PathBuf) {
    cfg.service(web::resource("/").route(web::get().to(index)))
        .service(web::resource("/health").route(web::get().to(health)))
        .service(web::resource("/predict").route(web::post().to(predict)))
        .service(web::resource("/dashboard").route(web::get().to(dashboard)))
        .service(web::resource("/uploads/{filename}").route(web::get().to(serve_overlay)))
        .service(
            web::scope("/auth")
                .route("/register", web::post().to(auth::routes::register))
                .route("/login", web::post().to(auth::routes::login))
                .route("/logout", web::post().to(auth::routes::logout))
                .route("/me", web::get().to(auth::routes::me)),
        )
        .service(Files::new("/static", static_dir).index_file("index.html"));
}

async fn index() -> HttpResponse {
    HttpResponse::Found()
        .insert_header(("Location", "/static/"))
        .finish()
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({"status": "ok"}))
}

#[derive(Debug, thiserror::Error)]
enum UploadError {
    #[error("Malformed multipart body: {0}")]
    Multipart(#[from] MultipartError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Streams the `image` field into a scratch file. Other fields are drained and
/// ignored.
async fn receive_upload(
    payload: &mut Multipart,
    store: &OverlayStore,
    limit: usize,
) -> Result<Option<ScratchUpload>, UploadError> {
    let mut upload = None;
    while let Some(mut field) = payload.try_next().await? {
        if field.name() != Some(IMAGE_FIELD) || upload.is_some() {
            while field.try_next().await?.is_some() {}
            continue;
        }

        let extension = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .and_then(OverlayStore::upload_extension);
        let mut scratch = store.scratch_file(extension.as_deref())?;
        while let Some(chunk) = field.try_next().await? {
            scratch.append(&chunk, limit)?;
        }
        if !scratch.is_empty() {
            scratch.flush()?;
            upload = Some(scratch);
        }
    }
    Ok(upload)
}

async fn predict(
    user: AuthenticatedUser,
    pipeline: web::Data<Pipeline>,
    store: web::Data<OverlayStore>,
    limit: web::Data<UploadLimit>,
    mut payload: Multipart,
) -> Result<HttpResponse, Error> {
    let upload = match receive_upload(&mut payload, &store, limit.0).await {
        Ok(Some(upload)) => upload,
        Ok(None) => {
            return Ok(HttpResponse::BadRequest().json(ErrorResponse::new("No image uploaded")));
        }
        Err(UploadError::Multipart(e)) => {
            warn!("Malformed upload from {}: {}", user.0, e);
            return Ok(HttpResponse::BadRequest().json(ErrorResponse::new("Malformed upload")));
        }
        Err(UploadError::Storage(StorageError::FileTooLarge)) => {
            warn!("Upload from {} exceeds {} bytes", user.0, limit.0);
            return Ok(HttpResponse::PayloadTooLarge().json(ErrorResponse::new("Image too large")));
        }
        Err(e) => {
            error!("Failed to store upload: {:?}", e);
            return Ok(HttpResponse::InternalServerError().json(ErrorResponse::new("Failed to store upload")));
        }
    };
    info!("Received {} byte upload from {}", upload.len(), user.0);

    let pipeline = pipeline.into_inner();
    let store = store.into_inner();
    let outcome = web::block(move || {
        let image = decode_file(upload.path())?;
        let analysis = pipeline.analyze(&image)?;
        let overlay_file = analysis.overlay.as_ref().and_then(|overlay| {
            match store.save(&overlay.image, upload.extension()) {
                Ok(filename) => Some(filename),
                Err(e) => {
                    warn!("Failed to save overlay: {:?}", e);
                    None
                }
            }
        });
        Ok::<_, PredictError>((analysis, overlay_file))
    })
    .await?;

    match outcome {
        Ok((analysis, overlay_file)) => Ok(HttpResponse::Ok().json(PredictionResponse {
            label: analysis.prediction.label,
            confidence: to_percent(analysis.prediction.confidence),
            overlay_url: overlay_file.map(|f| format!("/uploads/{}", f)),
            intensity_score: to_percent(analysis.intensity),
        })),
        Err(PredictError::Decode(PreprocessError::Decode(e))) => {
            info!("Rejected undecodable upload: {}", e);
            Ok(HttpResponse::BadRequest().json(ErrorResponse::new("Invalid image")))
        }
        Err(e) => {
            error!("Prediction failed: {:?}", e);
            Ok(HttpResponse::InternalServerError().json(ErrorResponse::new("Prediction failed")))
        }
    }
}

async fn serve_overlay(
    req: HttpRequest,
    store: web::Data<OverlayStore>,
    filename: web::Path<String>,
) -> HttpResponse {
    let not_found = || HttpResponse::NotFound().json(ErrorResponse::new("Not found"));
    let Some(path) = store.path_for(&filename) else {
        return not_found();
    };
    match NamedFile::open_async(&path).await {
        Ok(file) => file.into_response(&req),
        Err(_) => not_found(),
    }
}

async fn dashboard(user: AuthenticatedUser, users: web::Data<UserRepository>) -> HttpResponse {
    let Some(found) = users.get_user_by_id(user.0).await else {
        return HttpResponse::Unauthorized().json(ErrorResponse::new("Please log in."));
    };
    let quote = QUOTES.choose(&mut rand::rng()).copied().unwrap_or_default();
    HttpResponse::Ok().json(DashboardResponse {
        username: found.username,
        quote: quote.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::jwt::JwtService;
    use crate::auth::middleware::AuthMiddleware;
    use crate::auth::models::AuthUser;
    use crate::pipeline::font::FontSet;
    use crate::pipeline::overlay::{OverlayConfig, OverlayRenderer};
    use crate::pipeline::testing::StubClassifier;
    use crate::users::models::User;
    use actix_web::{test, App};
    use image::{ImageFormat, Rgb, RgbImage};
    use shared::Label;
    use std::io::Cursor;
    use std::path::Path;
    use std::sync::Arc;

    const BOUNDARY: &str = "xray-test-boundary";

    struct Fixture {
        dir: tempfile::TempDir,
        jwt: JwtService,
        users: UserRepository,
        user: User,
    }

    impl Fixture {
        async fn new() -> Self {
            let users = UserRepository::in_memory();
            let user = users
                .create_user(User::new(
                    "ana".to_string(),
                    "ana@example.com".to_string(),
                    "unused".to_string(),
                ))
                .await
                .unwrap();
            Self {
                dir: tempfile::tempdir().unwrap(),
                jwt: JwtService::new("secret"),
                users,
                user,
            }
        }

        fn bearer(&self) -> (&'static str, String) {
            let token = self.jwt.generate_token(&AuthUser::from(&self.user)).unwrap();
            ("Authorization", format!("Bearer {}", token))
        }
    }

    macro_rules! app {
        ($fixture:expr, $probability:expr, $conv:expr, $limit:expr) => {
            test::init_service(
                App::new()
                    .wrap(AuthMiddleware::new($fixture.jwt.clone()))
                    .app_data(web::Data::new(Pipeline::new(
                        Arc::new(StubClassifier {
                            probability: $probability,
                            has_conv_stage: $conv,
                        }),
                        OverlayRenderer::new(OverlayConfig::default(), FontSet::builtin()),
                    )))
                    .app_data(web::Data::new(OverlayStore::new($fixture.dir.path()).unwrap()))
                    .app_data(web::Data::new(UploadLimit($limit)))
                    .app_data(web::Data::new($fixture.users.clone()))
                    .app_data(web::Data::new($fixture.jwt.clone()))
                    .configure(|cfg| configure_routes(cfg, $fixture.dir.path().join("static"))),
            )
            .await
        };
    }

    fn png_bytes() -> Vec<u8> {
        let image = RgbImage::from_fn(96, 64, |x, _| Rgb([(x * 2) as u8, 80, 80]));
        let mut out = Vec::new();
        image.write_to(&mut Cursor::new(&mut out), ImageFormat::Png).unwrap();
        out
    }

    fn multipart(field: &str, filename: &str, bytes: &[u8]) -> (String, Vec<u8>) {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        (format!("multipart/form-data; boundary={BOUNDARY}"), body)
    }

    fn predict_request(fixture: &Fixture, field: &str, filename: &str, bytes: &[u8]) -> test::TestRequest {
        let (content_type, body) = multipart(field, filename, bytes);
        test::TestRequest::post()
            .uri("/predict")
            .insert_header(fixture.bearer())
            .insert_header(("Content-Type", content_type))
            .set_payload(body)
    }

    fn leftover_uploads(dir: &Path) -> usize {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("upload_"))
            .count()
    }

    #[actix_web::test]
    async fn pneumonia_prediction_returns_overlay_url() {
        let fixture = Fixture::new().await;
        let app = app!(fixture, 0.93, true, 1 << 20);

        let req = predict_request(&fixture, IMAGE_FIELD, "chest.png", &png_bytes()).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 200);
        let body: PredictionResponse = test::read_body_json(resp).await;
        assert_eq!(body.label, Label::Pneumonia);
        assert_eq!(body.confidence, 93.0);
        assert!((0.0..=100.0).contains(&body.intensity_score));

        let url = body.overlay_url.unwrap();
        assert!(url.starts_with("/uploads/overlay_") && url.ends_with(".png"));
        let resp = test::call_service(&app, test::TestRequest::get().uri(&url).to_request()).await;
        assert_eq!(resp.status(), 200);

        assert_eq!(leftover_uploads(fixture.dir.path()), 0);
    }

    #[actix_web::test]
    async fn missing_conv_stage_gives_null_overlay() {
        let fixture = Fixture::new().await;
        let app = app!(fixture, 0.2, false, 1 << 20);

        let req = predict_request(&fixture, IMAGE_FIELD, "chest.png", &png_bytes()).to_request();
        let body: PredictionResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body.label, Label::Normal);
        assert_eq!(body.confidence, 80.0);
        assert_eq!(body.overlay_url, None);
        assert_eq!(body.intensity_score, 0.0);
    }

    #[actix_web::test]
    async fn upload_errors_map_to_client_statuses() {
        let fixture = Fixture::new().await;
        let app = app!(fixture, 0.93, true, 1 << 20);

        let req = predict_request(&fixture, "attachment", "chest.png", &png_bytes()).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400);
        let body: ErrorResponse = test::read_body_json(resp).await;
        assert_eq!(body.error, "No image uploaded");

        let req = predict_request(&fixture, IMAGE_FIELD, "chest.png", b"definitely not a png").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400);
        let body: ErrorResponse = test::read_body_json(resp).await;
        assert_eq!(body.error, "Invalid image");

        assert_eq!(leftover_uploads(fixture.dir.path()), 0);
    }

    #[actix_web::test]
    async fn oversized_upload_is_rejected() {
        let fixture = Fixture::new().await;
        let app = app!(fixture, 0.93, true, 64);
        let req = predict_request(&fixture, IMAGE_FIELD, "chest.png", &png_bytes()).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 413);
        assert_eq!(leftover_uploads(fixture.dir.path()), 0);
    }

    #[actix_web::test]
    async fn predict_requires_session() {
        let fixture = Fixture::new().await;
        let app = app!(fixture, 0.93, true, 1 << 20);
        let (content_type, body) = multipart(IMAGE_FIELD, "chest.png", &png_bytes());
        let req = test::TestRequest::post()
            .uri("/predict")
            .insert_header(("Content-Type", content_type))
            .set_payload(body)
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), 401);
    }

    #[actix_web::test]
    async fn unknown_overlay_names_are_not_served() {
        let fixture = Fixture::new().await;
        let app = app!(fixture, 0.93, true, 1 << 20);
        for uri in ["/uploads/secret.txt", "/uploads/overlay_00000000-0000-0000-0000-000000000000.png"] {
            let resp = test::call_service(&app, test::TestRequest::get().uri(uri).to_request()).await;
            assert_eq!(resp.status(), 404, "{}", uri);
        }
    }

    #[actix_web::test]
    async fn dashboard_greets_user_with_quote() {
        let fixture = Fixture::new().await;
        let app = app!(fixture, 0.93, true, 1 << 20);
        let req = test::TestRequest::get()
            .uri("/dashboard")
            .insert_header(fixture.bearer())
            .to_request();
        let body: DashboardResponse = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body.username, "ana");
        assert!(QUOTES.contains(&body.quote.as_str()));
    }

    #[actix_web::test]
    async fn health_is_public() {
        let fixture = Fixture::new().await;
        let app = app!(fixture, 0.93, true, 1 << 20);
        let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert_eq!(resp.status(), 200);
    }

    #[actix_web::test]
    async fn truncated_multipart_body_is_rejected() {
        let fixture = Fixture::new().await;
        let app = app!(fixture, 0.93, true, 1 << 20);
        let png = png_bytes();
        let (content_type, mut body) = multipart(IMAGE_FIELD, "chest.png", &png);
        let closing = format!("\r\n--{BOUNDARY}--\r\n").len();
        body.truncate(body.len() - closing - png.len() / 2);

        let req = test::TestRequest::post()
            .uri("/predict")
            .insert_header(fixture.bearer())
            .insert_header(("Content-Type", content_type))
            .set_payload(body)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400);
        let body: ErrorResponse = test::read_body_json(resp).await;
        assert_eq!(body.error, "Malformed upload");
        assert_eq!(leftover_uploads(fixture.dir.path()), 0);
    }
}
