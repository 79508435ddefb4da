use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::TypedHeader;
use headers::{Authorization, authorization::Bearer};
use sha2::{Digest, Sha256};

use crate::error::ApiError;
use crate::models::AppState;

/// Single-operator API-key auth. The key is presented as a bearer token and
/// only its SHA-256 hex lives in configuration (mint a key with
/// `cargo run --bin genkey`).
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub operator_id: String,
}

pub fn hash_api_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

impl FromRequestParts<AppState> for AuthContext {
    type Rejection = ApiError;

    fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        async move {
            // Extract Authorization: Bearer <key>
            let TypedHeader(authz): TypedHeader<Authorization<Bearer>> =
                TypedHeader::from_request_parts(parts, state)
                    .await
                    .map_err(|_| ApiError::invalid_api_key())?;

            let presented = hash_api_key(authz.token());
            if presented != state.api_key_hash {
                return Err(ApiError::invalid_api_key());
            }

            Ok(AuthContext {
                operator_id: state.operator_id.clone(),
            })
        }
    }
}
