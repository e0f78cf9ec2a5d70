pub mod credentials;
pub mod engine;
pub mod params;
pub mod provider_manager;
pub mod provisioning;
pub mod queries;
pub mod reconciliation;
pub mod retry;
pub mod settings;
pub mod store;
pub mod termination;

pub use engine::Engine;
pub use provider_manager::{ProviderFactory, ProviderKey, ProviderRegistry, VendorFactory};
pub use provisioning::ExpandReport;
pub use queries::{InstancePage, InstancesCond};
pub use settings::{EngineSettings, Settings};
