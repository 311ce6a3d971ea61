pub mod loader;
pub mod params;
pub mod traits;
pub mod types;
pub mod validation;

pub use loader::{load_config, load_config_from_string};
pub use params::extract_param;
pub use traits::ComponentConfig;
pub use types::{
    AppConfig, BrokerBlockConfig, ConnectorConfig, DrainPolicy, ErrorPolicyConfig, FlowConfig,
    HealthCheckConfig, InputSelectionConfig, StageConfig, SubscriptionConfig,
};
pub use validation::validate_config;
