//! This mod holds the library's client-facing API: node configuration and
//! startup, the workload-handler contract, and the submitting client.
mod client;
mod configuration;
mod factory;
mod handler;

pub use client::Client;
pub use client::ClientOptions;
pub use client::InvalidClientOptions;
pub use client::PendingReply;
pub use client::SubmitError;
pub use configuration::ClusterInfo;
pub use configuration::NodeConfig;
pub use configuration::NodeOptions;
pub use factory::start_node;
pub use factory::NodeHandle;
pub use factory::StartNodeError;
pub use handler::WorkloadHandler;

pub(crate) use configuration::NodeOptionsValidated;
