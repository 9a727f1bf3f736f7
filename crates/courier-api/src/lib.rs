pub mod auth;
pub mod contacts;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod users;

use std::sync::Arc;

use courier_gateway::SessionManager;
use courier_services::auth::AuthService;
use courier_services::message::MessageService;
use courier_services::user::UserService;

use crate::auth::AuthRateLimiter;

/// Everything the REST layer needs, shared behind one `Arc`.
pub struct AppState {
    pub auth: AuthService,
    pub users: UserService,
    pub messages: MessageService,
    pub manager: SessionManager,
    pub jwt_secret: String,
    pub auth_rate_limiter: AuthRateLimiter,
}

pub type SharedState = Arc<AppState>;
