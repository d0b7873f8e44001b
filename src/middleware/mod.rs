pub mod auth;
pub mod host;

pub use auth::authenticate;
pub use host::{resolve_host, HostContext};
