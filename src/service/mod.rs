pub use app_error::{AppError, AppResult};
pub use config::{ConfigHolder, DeliveryConfig, DeliverySettings, DeliverySnapshot, GeneralConfig};
pub use health::{HealthHandle, HealthRegistry, HealthStatus, LifecycleState};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing};

mod app_error;
mod config;
mod health;
mod shutdown;
mod tracing_config;
