//! The session resolver.
//!
//! Wraps host name resolution for the session. Direct sessions use the
//! system resolver; proxied sessions should not resolve locally at all,
//! because DNS queries outside the tunnel leak the probe's activity, so
//! the resolver reports itself as proxied and the HTTP client performs
//! proxy-side resolution instead (`socks5h`).

use std::net::IpAddr;

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{Error, Result};

/// The resolver owned by a bootstrapped session.
pub struct SessionResolver {
    proxy_url: Option<Url>,
}

impl SessionResolver {
    /// Creates the resolver; `proxy_url` marks the session as proxied.
    pub fn new(proxy_url: Option<Url>) -> Self {
        Self { proxy_url }
    }

    /// Returns whether lookups are deferred to the tunnel proxy.
    pub fn is_proxied(&self) -> bool {
        self.proxy_url.is_some()
    }

    /// Resolves `domain` to its IP addresses using the system resolver.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] when `token` is already cancelled or
    /// fires mid-lookup, and [`Error::Io`] when resolution fails or
    /// yields no addresses.
    pub async fn lookup_host(
        &self,
        token: &CancellationToken,
        domain: &str,
    ) -> Result<Vec<IpAddr>> {
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let target = format!("{}:443", domain);
        let addrs = tokio::select! {
            r = tokio::net::lookup_host(target) => r?,
            _ = token.cancelled() => return Err(Error::Cancelled),
        };
        let addrs: Vec<IpAddr> = addrs.map(|sa| sa.ip()).collect();
        if addrs.is_empty() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no addresses for {}", domain),
            )));
        }
        Ok(addrs)
    }
}
