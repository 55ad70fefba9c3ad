//! Certificate coverage.
//!
//! Issuance lives elsewhere; the publisher only needs to know whether TLS
//! material exists for a hostname before routing traffic to it.

use std::collections::HashSet;
use std::sync::RwLock;

use tracing::debug;

/// Answers whether a hostname can be served over TLS.
pub trait CertificateSource: Send + Sync {
    fn covers(&self, hostname: &str) -> bool;
}

/// Known certificate server names, with SNI-style matching.
pub struct CertificateCatalog {
    names: RwLock<HashSet<String>>,
    default_name: RwLock<Option<String>>,
}

impl CertificateCatalog {
    pub fn new() -> Self {
        Self {
            names: RwLock::new(HashSet::new()),
            default_name: RwLock::new(None),
        }
    }

    /// Register a server name (`api.example.com` or `*.example.com`).
    ///
    /// A default certificate is served for any name, so it covers everything.
    pub fn insert(&self, server_name: &str, is_default: bool) {
        if is_default {
            *self.default_name.write().expect("cert lock") = Some(server_name.to_string());
        }
        self.names
            .write()
            .expect("cert lock")
            .insert(server_name.to_string());
        debug!(%server_name, is_default, "certificate registered");
    }

    pub fn remove(&self, server_name: &str) {
        self.names.write().expect("cert lock").remove(server_name);
        let mut default = self.default_name.write().expect("cert lock");
        if default.as_deref() == Some(server_name) {
            *default = None;
        }
    }

    /// The server name whose certificate would be presented for `hostname`.
    pub fn resolve(&self, hostname: &str) -> Option<String> {
        let names = self.names.read().expect("cert lock");

        if names.contains(hostname) {
            return Some(hostname.to_string());
        }

        // *.example.com matches foo.example.com but not a.foo.example.com.
        for pattern in names.iter() {
            if let Some(suffix) = pattern.strip_prefix("*.")
                && let Some(label) = hostname
                    .strip_suffix(suffix)
                    .and_then(|rest| rest.strip_suffix('.'))
                && !label.is_empty()
                && !label.contains('.')
            {
                return Some(pattern.clone());
            }
        }

        self.default_name.read().expect("cert lock").clone()
    }

    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.names.read().expect("cert lock").iter().cloned().collect();
        names.sort();
        names
    }
}

impl Default for CertificateCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl CertificateSource for CertificateCatalog {
    fn covers(&self, hostname: &str) -> bool {
        self.resolve(hostname).is_some()
    }
}
