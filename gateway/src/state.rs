use std::sync::Arc;

use sandbox_core::Config;
use sandbox_core::SessionManager;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub config: Arc<Config>,
}
