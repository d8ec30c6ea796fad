mod actor;
mod api;
mod net;
mod protocol;
mod quorum;
mod server;

pub use api::start_node;
pub use api::Client;
pub use api::ClientOptions;
pub use api::ClusterInfo;
pub use api::InvalidClientOptions;
pub use api::NodeConfig;
pub use api::NodeHandle;
pub use api::NodeOptions;
pub use api::PendingReply;
pub use api::StartNodeError;
pub use api::SubmitError;
pub use api::WorkloadHandler;
pub use quorum::NodeId;
