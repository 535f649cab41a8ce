use actix_web::cookie::{Cookie, SameSite};
use actix_web::{web, HttpRequest, HttpResponse, Result};
use log::error;
use shared::{ErrorResponse, LoginRequest, LoginResponse, RegisterRequest, UserProfile};

use crate::users::models::User;
use crate::users::repository::{UserRepository, UserStoreError};

use super::jwt::JwtService;
use super::middleware::{request_token, AuthenticatedUser, SESSION_COOKIE};
use super::models::AuthUser;
use super::password::{hash_password, verify_password};

pub async fn register(
    body: web::Json<RegisterRequest>,
    users: web::Data<UserRepository>,
) -> Result<HttpResponse> {
    let RegisterRequest {
        username,
        email,
        password,
    } = body.into_inner();
    let username = username.trim().to_string();
    let email = email.trim().to_string();
    if username.is_empty() || email.is_empty() || password.is_empty() {
        return Ok(HttpResponse::BadRequest()
            .json(ErrorResponse::new("Username, email and password are required")));
    }

    let password_hash = web::block(move || hash_password(&password)).await?;
    match users.create_user(User::new(username, email, password_hash)).await {
        Ok(user) => Ok(HttpResponse::Created().json(UserProfile::from(&user))),
        Err(UserStoreError::Conflict) => {
            Ok(HttpResponse::Conflict().json(ErrorResponse::new("Username or email already taken.")))
        }
        Err(e) => {
            error!("Failed to create user: {:?}", e);
            Ok(HttpResponse::InternalServerError().json(ErrorResponse::new("Failed to create user")))
        }
    }
}

pub async fn login(
    body: web::Json<LoginRequest>,
    users: web::Data<UserRepository>,
    jwt_service: web::Data<JwtService>,
) -> Result<HttpResponse> {
    let LoginRequest { username, password } = body.into_inner();
    let invalid = || HttpResponse::Unauthorized().json(ErrorResponse::new("Invalid credentials."));

    let Some(user) = users.get_user_by_username(username.trim()).await else {
        log::info!("Login attempt for unknown user {}", username);
        return Ok(invalid());
    };

    let stored = user.password_hash.clone();
    let verified = web::block(move || verify_password(&password, &stored)).await?;
    match verified {
        Ok(true) => {}
        Ok(false) => {
            log::info!("Wrong password for user {}", user.username);
            return Ok(invalid());
        }
        Err(e) => {
            error!("Stored password hash for {} is unusable: {}", user.username, e);
            return Ok(invalid());
        }
    }

    let user = match users.record_login(user.id).await {
        Ok(user) => user,
        Err(e) => {
            error!("Failed to record login for {}: {:?}", user.id, e);
            user
        }
    };

    let token = match jwt_service.generate_token(&AuthUser::from(&user)) {
        Ok(token) => token,
        Err(e) => {
            error!("Failed to issue token for {}: {:?}", user.id, e);
            return Ok(HttpResponse::InternalServerError().json(ErrorResponse::new("Failed to log in")));
        }
    };

    log::info!("Welcome back, {}!", user.username);
    let cookie = Cookie::build(SESSION_COOKIE, token.clone())
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .finish();
    Ok(HttpResponse::Ok().cookie(cookie).json(LoginResponse {
        token,
        user: UserProfile::from(&user),
    }))
}

pub async fn logout(
    req: HttpRequest,
    user: AuthenticatedUser,
    jwt_service: web::Data<JwtService>,
) -> Result<HttpResponse> {
    match request_token(&req).map(|token| jwt_service.revoke(&token)) {
        Ok(Ok(())) => log::info!("User {} logged out", user.0),
        Ok(Err(e)) => log::warn!("Could not revoke token for {}: {}", user.0, e),
        Err(e) => log::warn!("Logout without a readable token for {}: {:?}", user.0, e),
    }
    let mut cookie = Cookie::build(SESSION_COOKIE, "").path("/").finish();
    cookie.make_removal();
    Ok(HttpResponse::Ok()
        .cookie(cookie)
        .json(serde_json::json!({"message": "Logged out."})))
}

pub async fn me(
    user: AuthenticatedUser,
    users: web::Data<UserRepository>,
) -> Result<HttpResponse> {
    match users.get_user_by_id(user.0).await {
        Some(found) => Ok(HttpResponse::Ok().json(UserProfile::from(&found))),
        None => {
            log::warn!("Session refers to unknown user {}", user.0);
            Ok(HttpResponse::Unauthorized().json(ErrorResponse::new("Please log in.")))
        }
    }
}
