pub mod argv;
pub mod config;
pub mod error;
pub mod error_payload;
pub mod executor;
pub mod http;
pub mod logging;
pub mod proxy;
pub mod registry;
pub mod security;
pub mod status;

pub use executor::ActionExecutor;
pub use proxy::{ProxyTarget, SessionEnd, SessionReport};
pub use registry::ActionRegistry;
pub use status::StatusReporter;
