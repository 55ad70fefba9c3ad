//! Public hostname validation.
//!
//! Routing entries and certificates are keyed by hostname; the proxy
//! rejects anything that is not a plain lowercase DNS name.

use std::sync::LazyLock;

use regex::Regex;

static HOSTNAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?(?:\.[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?)*$")
        .expect("hostname regex")
});

/// Whether `name` is a routable hostname (lowercase labels, max 253 chars).
pub fn is_valid_hostname(name: &str) -> bool {
    !name.is_empty() && name.len() <= 253 && HOSTNAME_RE.is_match(name)
}
