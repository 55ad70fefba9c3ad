//! Container runtime seam.
//!
//! The controller only asks the runtime to start and stop versioned
//! instances. A started instance is not trusted until the prober says so.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, info};

use edgeshift_core::HostConfig;
use edgeshift_state::Instance;

/// Boxed future returned by [`ContainerRuntime`] implementations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("no image for {hostname} version {version}")]
    UnknownVersion { hostname: String, version: String },

    #[error("failed to start instance: {0}")]
    Start(String),

    #[error("failed to stop instance: {0}")]
    Stop(String),
}

/// A running container as the runtime sees it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceHandle {
    pub hostname: String,
    pub version: String,
    /// Address (`ip:port`) the container listens on.
    pub address: String,
}

impl InstanceHandle {
    /// Handle of a registered instance, if it has been bound to an address.
    pub fn of(instance: &Instance) -> Option<Self> {
        Some(Self {
            hostname: instance.hostname.clone(),
            version: instance.version.clone(),
            address: instance.endpoint.clone()?,
        })
    }
}

/// Starts, stops and lists versioned instances.
pub trait ContainerRuntime: Send + Sync {
    fn start<'a>(
        &'a self,
        hostname: &'a str,
        version: &'a str,
    ) -> BoxFuture<'a, Result<InstanceHandle, RuntimeError>>;

    fn stop<'a>(&'a self, handle: &'a InstanceHandle) -> BoxFuture<'a, Result<(), RuntimeError>>;

    fn list(&self) -> BoxFuture<'_, Result<Vec<InstanceHandle>, RuntimeError>>;
}

/// Runtime backed by a fixed catalog of already-running versions.
///
/// Containers are managed outside edgeshift; "starting" a version resolves
/// its configured address and "stopping" forgets it.
pub struct StaticRuntime {
    catalog: HashMap<(String, String), String>,
    running: Mutex<Vec<InstanceHandle>>,
}

impl StaticRuntime {
    pub fn new() -> Self {
        Self {
            catalog: HashMap::new(),
            running: Mutex::new(Vec::new()),
        }
    }

    pub fn from_hosts(hosts: &[HostConfig]) -> Self {
        let mut runtime = Self::new();
        for host in hosts {
            for v in &host.versions {
                runtime.add(&host.hostname, &v.version, &v.address);
            }
        }
        runtime
    }

    pub fn add(&mut self, hostname: &str, version: &str, address: &str) {
        self.catalog.insert(
            (hostname.to_string(), version.to_string()),
            address.to_string(),
        );
    }

    /// Versions known for a hostname, sorted.
    pub fn versions(&self, hostname: &str) -> Vec<String> {
        let mut versions: Vec<String> = self
            .catalog
            .keys()
            .filter(|(h, _)| h == hostname)
            .map(|(_, v)| v.clone())
            .collect();
        versions.sort();
        versions
    }
}

impl Default for StaticRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime for StaticRuntime {
    fn start<'a>(
        &'a self,
        hostname: &'a str,
        version: &'a str,
    ) -> BoxFuture<'a, Result<InstanceHandle, RuntimeError>> {
        Box::pin(async move {
            let address = self
                .catalog
                .get(&(hostname.to_string(), version.to_string()))
                .cloned()
                .ok_or_else(|| RuntimeError::UnknownVersion {
                    hostname: hostname.to_string(),
                    version: version.to_string(),
                })?;
            let handle = InstanceHandle {
                hostname: hostname.to_string(),
                version: version.to_string(),
                address,
            };
            self.running.lock().expect("runtime lock").push(handle.clone());
            info!(%hostname, %version, address = %handle.address, "instance started");
            Ok(handle)
        })
    }

    fn stop<'a>(&'a self, handle: &'a InstanceHandle) -> BoxFuture<'a, Result<(), RuntimeError>> {
        Box::pin(async move {
            self.running
                .lock()
                .expect("runtime lock")
                .retain(|h| h != handle);
            debug!(hostname = %handle.hostname, version = %handle.version, "instance stopped");
            Ok(())
        })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<InstanceHandle>, RuntimeError>> {
        Box::pin(async move { Ok(self.running.lock().expect("runtime lock").clone()) })
    }
}
