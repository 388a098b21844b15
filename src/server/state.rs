use std::sync::Arc;
use std::time::Instant;

use crate::auth::JwtValidator;
use crate::config::Settings;
use crate::hub::Hub;
use crate::websocket::OriginPolicy;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub jwt_validator: Arc<JwtValidator>,
    pub hub: Arc<Hub>,
    pub origins: Arc<OriginPolicy>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(settings: Settings, hub: Arc<Hub>) -> Self {
        let jwt_validator = Arc::new(JwtValidator::new(&settings.jwt));
        let origins = Arc::new(OriginPolicy::new(&settings.server.allowed_origins));

        Self {
            settings: Arc::new(settings),
            jwt_validator,
            hub,
            origins,
            start_time: Instant::now(),
        }
    }
}
