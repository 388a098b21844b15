use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};

use crate::config::JwtConfig;
use crate::domain::UserId;
use crate::error::AppError;

use super::Claims;

/// HS256 token verifier. `jsonwebtoken` compares the recomputed HMAC in
/// constant time.
pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(config: &JwtConfig) -> Self {
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        if let Some(ref issuer) = config.issuer {
            validation.set_issuer(&[issuer]);
        }

        if let Some(ref audience) = config.audience {
            validation.set_audience(&[audience]);
        }

        Self {
            decoding_key,
            validation,
        }
    }

    pub fn validate(&self, token: &str) -> Result<Claims, AppError> {
        let token_data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| AppError::Auth(format!("Invalid token: {}", e)))?;

        Ok(token_data.claims)
    }

    /// Verify a bearer token and return the embedded user id
    pub fn verify(&self, token: &str) -> Option<UserId> {
        match self.validate(token) {
            Ok(claims) => claims.user_id(),
            Err(e) => {
                tracing::debug!(error = %e, "Token rejected");
                None
            }
        }
    }
}
