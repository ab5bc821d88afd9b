use std::{collections::HashMap, time::Duration};

use localcomm_rpc::{Handler, RpcError, ServiceCaller, ServiceHost};
use localcomm_utils::directories::ensure_runtime_dir;

/// Process-wide façade over the transport.
///
/// Owns the host dispatcher for the services this process serves and caches
/// one caller stub per remote service. Several endpoints in one process work
/// fine as long as they register distinct service names; they share the
/// runtime directory safely.
pub struct Endpoint {
    host: ServiceHost,
    callers: HashMap<String, ServiceCaller>,
}

impl Endpoint {
    pub fn new() -> Result<Self, RpcError> {
        ensure_runtime_dir()?;
        Ok(Self { host: ServiceHost::new()?, callers: HashMap::new() })
    }

    /// Registers `handler` under `name` and starts listening for callers.
    /// The handler runs from [`spin`](Self::spin) or
    /// [`spin_once`](Self::spin_once).
    pub fn create_service<H: Handler + 'static>(
        &mut self,
        name: &str,
        handler: H,
    ) -> Result<(), RpcError> {
        self.host.register(name, handler)
    }

    /// Stops serving `name` and removes its socket.
    pub fn remove_service(&mut self, name: &str) -> Result<(), RpcError> {
        self.host.unregister(name)
    }

    /// Returns the caller stub for `name`, creating it on first use. One
    /// cached stub per name suffices: every call opens its own connection.
    pub fn create_service_caller(&mut self, name: &str) -> Result<&ServiceCaller, RpcError> {
        if !self.callers.contains_key(name) {
            let caller = ServiceCaller::new(name)?;
            self.callers.insert(name.to_string(), caller);
        }
        Ok(&self.callers[name])
    }

    /// Serves registered services until interrupted.
    pub fn spin(&mut self) -> Result<(), RpcError> {
        self.host.run_forever()
    }

    /// Serves at most one call, waiting up to `timeout` (`None` waits
    /// forever) for one to arrive. Returns whether a call was served.
    pub fn spin_once(&mut self, timeout: Option<Duration>) -> Result<bool, RpcError> {
        self.host.run_one(timeout)
    }
}
