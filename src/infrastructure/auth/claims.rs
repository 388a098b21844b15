use serde::{Deserialize, Serialize};

use crate::domain::UserId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (numeric user ID, string encoded)
    pub sub: String,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at (Unix timestamp)
    #[serde(default)]
    pub iat: i64,
}

impl Claims {
    pub fn new(user_id: UserId, ttl_seconds: i64) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            sub: user_id.to_string(),
            exp: now + ttl_seconds,
            iat: now,
        }
    }

    /// Parsed user id, `None` for a non-numeric or non-positive subject
    pub fn user_id(&self) -> Option<UserId> {
        self.sub.parse::<UserId>().ok().filter(|id| *id > 0)
    }
}
