pub mod cache;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod metrics;
pub mod middleware;
pub mod records;
pub mod response;
pub mod server;
pub mod throttle_config;
pub mod throttler;

pub use cache::{Cache, CacheAdapter, CacheBackend, CacheConfig};
pub use config::{FailurePolicy, ServerConfig};
pub use context::RequestContext;
pub use error::{Result, ThrottlerError};
pub use server::create_app;
pub use throttle_config::{ConfigOverride, ThrottleConfig};
pub use throttler::{ThrottleEngine, ThrottleReason, ThrottleResult};
