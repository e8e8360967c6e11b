use axum::{extract::State, response::IntoResponse, Json};
use chrono::SecondsFormat;
use enroll_core::models::{CreateUserParams, User};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::{HttpAppError, ValidatedJson};
use crate::services::password::hash_password;
use crate::state::AppState;

#[derive(Debug, Deserialize, Validate)]
pub struct CreateUserRequest {
    #[validate(length(min = 1, max = 100, message = "username must be 1 to 100 characters"))]
    pub username: String,
    #[validate(length(min = 1, message = "password must not be empty"))]
    pub password: String,
    #[validate(length(min = 1, max = 255, message = "full_name must be 1 to 255 characters"))]
    pub full_name: String,
    #[validate(email(message = "email must be a valid address"))]
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserResponse {
    pub username: String,
    pub full_name: String,
    pub email: String,
    pub password_changed_at: String,
    pub created_at: String,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            username: user.username,
            full_name: user.full_name,
            email: user.email,
            password_changed_at: user
                .password_changed_at
                .to_rfc3339_opts(SecondsFormat::Secs, true),
            created_at: user.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

pub async fn create_user(
    State(state): State<AppState>,
    ValidatedJson(request): ValidatedJson<CreateUserRequest>,
) -> Result<impl IntoResponse, HttpAppError> {
    request.validate()?;

    let hashed_password = hash_password(&request.password)?;
    let user = state
        .registration
        .register(CreateUserParams {
            username: request.username,
            hashed_password,
            full_name: request.full_name,
            email: request.email,
        })
        .await?;

    Ok(Json(UserResponse::from(user)))
}
