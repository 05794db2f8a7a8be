//! Provider routing: exponential backoff and the role-based fallback cascade.

pub mod provider_router;
pub mod retry;

pub use provider_router::{ModelSpec, ProviderRegistry, ProviderRouter, RoleRoute, RoutingPolicy};
pub use retry::RetryConfig;
