//! edgeshift-core: shared configuration and value parsing.
//!
//! Holds the `edgeshift.toml` model consumed by the daemon, plus the
//! small parsers every other crate leans on: duration strings
//! (`"500ms"`, `"5s"`, `"2m"`) and public hostname validation.

pub mod config;
pub mod duration;
pub mod hostname;

pub use config::{
    CertificateConfig, ConfigError, EdgeshiftConfig, HealthSection, HostConfig, ProxySection,
    RolloutSection, ServerSection, VersionConfig,
};
pub use duration::parse_duration;
pub use hostname::is_valid_hostname;
