mod error;
pub mod uds;

pub use error::RpcError;
pub use uds::{Handler, ServiceCaller, ServiceHost};
