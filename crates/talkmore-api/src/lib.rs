pub mod auth;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod tokens;

pub use auth::{AppState, AppStateInner, LogoutPolicy};
pub use error::{ApiError, ApiResult};
pub use tokens::{AuthMode, TokenService};
