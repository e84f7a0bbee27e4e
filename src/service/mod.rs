pub use app_error::{AppError, AppResult};
pub use config::{
    MessengerConfig, NamerConfig, NetworkConfig, ReaperConfig, RuntimeConfig, SenderConfig,
    TimeoutConfig,
};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing, TracingGuard};

mod app_error;
mod config;
mod shutdown;
mod tracing_config;
