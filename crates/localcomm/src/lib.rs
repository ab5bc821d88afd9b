mod endpoint;

pub use endpoint::Endpoint;
pub use localcomm_rpc as rpc;
pub use localcomm_rpc::{Handler, RpcError, ServiceCaller, ServiceHost};
pub use localcomm_shm as shm;
pub use localcomm_utils as utils;
pub use tracing;
