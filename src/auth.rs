//! Bearer-token resolution. Token issuance lives with the external auth
//! service; this module only verifies HS256 tokens signed with the shared
//! `SECRET_KEY` and resolves them to an owner id.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::AppState;
use crate::config::Settings;
use crate::error::ApiError;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
}

/// The authenticated owner extracted from the `Authorization` header.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub Uuid);

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or(ApiError::Unauthorized)?;
        let owner = verify_token(&state.settings, token).ok_or(ApiError::Unauthorized)?;
        Ok(AuthUser(owner))
    }
}

pub fn verify_token(settings: &Settings, token: &str) -> Option<Uuid> {
    let key = DecodingKey::from_secret(settings.secret_key.as_bytes());
    let data =
        jsonwebtoken::decode::<Claims>(token, &key, &Validation::new(Algorithm::HS256)).ok()?;
    data.claims.sub.parse().ok()
}

/// Mint a token for an owner. The core never calls this in request paths;
/// it exists for operator tooling and tests.
pub fn issue_token(settings: &Settings, owner_id: Uuid) -> anyhow::Result<String> {
    let claims = Claims {
        sub: owner_id.to_string(),
        exp: (Utc::now() + chrono::Duration::minutes(settings.access_token_expire_minutes))
            .timestamp(),
    };
    let key = EncodingKey::from_secret(settings.secret_key.as_bytes());
    Ok(jsonwebtoken::encode(&Header::default(), &claims, &key)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(secret: &str) -> Settings {
        Settings {
            database_url: String::new(),
            minio_endpoint: String::new(),
            minio_access_key: String::new(),
            minio_secret_key: String::new(),
            minio_secure: false,
            minio_public_url: None,
            rabbitmq_host: String::new(),
            rabbitmq_port: 5672,
            rabbitmq_user: String::new(),
            rabbitmq_password: String::new(),
            secret_key: secret.to_string(),
            access_token_expire_minutes: 30,
            bind_addr: String::new(),
            gemini_api_key: None,
            ffmpeg_path: "ffmpeg".to_string(),
            clamdscan_path: "clamdscan".to_string(),
        }
    }

    #[test]
    fn issued_tokens_verify_back_to_the_owner() {
        let settings = settings("test-secret");
        let owner = Uuid::new_v4();
        let token = issue_token(&settings, owner).expect("issue token");
        assert_eq!(verify_token(&settings, &token), Some(owner));
    }

    #[test]
    fn tokens_signed_with_another_key_are_rejected() {
        let owner = Uuid::new_v4();
        let token = issue_token(&settings("key-a"), owner).expect("issue token");
        assert_eq!(verify_token(&settings("key-b"), &token), None);
    }

    #[test]
    fn garbage_tokens_are_rejected() {
        assert_eq!(verify_token(&settings("s"), "not-a-jwt"), None);
    }
}
