pub mod auth;
pub mod ip_filter;

pub use auth::Caller;
pub use ip_filter::CallbackIpFilterLayer;
