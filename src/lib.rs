pub mod backend;
pub mod config;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod server;
pub mod tiers;
pub mod tokens;
pub mod translate;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use proxy::Gateway;
pub use server::{build_router, AppState};
