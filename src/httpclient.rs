//! The session HTTP client.
//!
//! Every HTTP round trip a session performs (geolocation lookups, backend
//! API calls) goes through one [`SessionHttpClient`]. The client routes
//! through the tunnel's SOCKS5 proxy when the session has one, otherwise
//! connects directly, and accounts bytes on the shared
//! [`ByteCounter`](crate::bytecounter::ByteCounter).
//!
//! # Proxy Routing
//!
//! When a proxy URL is present we rewrite `socks5` to `socks5h` so that
//! domain names resolve on the proxy side: resolving locally would leak
//! DNS queries outside the tunnel, which defeats circumvention.
//!
//! # Cancellation
//!
//! [`SessionHttpClient::execute`] checks the caller's token before any
//! I/O and aborts the in-flight request when the token fires mid-transfer.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::bytecounter::ByteCounter;
use crate::error::{Error, Result};

/// Configuration for [`SessionHttpClient::new`].
pub struct HttpClientConfig {
    /// Byte counter shared with the rest of the session.
    pub counter: Arc<ByteCounter>,
    /// SOCKS5 proxy to route through, when the tunnel exposes one.
    pub proxy_url: Option<Url>,
    /// User-agent header for every request.
    pub user_agent: String,
}

/// A completed HTTP response with its body fully read.
#[derive(Debug)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// The response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Returns the body as UTF-8 text, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// The HTTP client owned by a bootstrapped session.
pub struct SessionHttpClient {
    inner: reqwest::Client,
    counter: Arc<ByteCounter>,
    user_agent: String,
}

/// Rewrites a `socks5` URL to `socks5h` so names resolve proxy-side.
fn proxy_side_dns(proxy: &Url) -> String {
    let s = proxy.as_str();
    match s.strip_prefix("socks5://") {
        Some(rest) => format!("socks5h://{}", rest),
        None => s.to_string(),
    }
}

impl SessionHttpClient {
    /// Creates the client, wiring the proxy when present.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] if the proxy URL is rejected or the client
    /// cannot be built.
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(60));
        if let Some(proxy) = &config.proxy_url {
            builder = builder.proxy(reqwest::Proxy::all(proxy_side_dns(proxy))?);
        }
        let inner = builder.build()?;
        Ok(Self {
            inner,
            counter: config.counter,
            user_agent: config.user_agent,
        })
    }

    /// Starts building a request with the session user-agent set.
    pub fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.inner
            .request(method, url)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
    }

    /// Executes `builder`, reading the whole response body.
    ///
    /// Accounts request body and response body bytes on the session
    /// counter. Aborts with [`Error::Cancelled`] when `token` is already
    /// cancelled (before any I/O) or fires mid-transfer.
    pub async fn execute(
        &self,
        token: &CancellationToken,
        builder: reqwest::RequestBuilder,
    ) -> Result<HttpResponse> {
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let request = builder.build()?;
        let sent = request
            .body()
            .and_then(|b| b.as_bytes())
            .map(|b| b.len() as u64)
            .unwrap_or(0);
        self.counter
            .count_sent(sent + request.url().as_str().len() as u64);

        let response = tokio::select! {
            r = self.inner.execute(request) => r?,
            _ = token.cancelled() => return Err(Error::Cancelled),
        };
        let status = response.status().as_u16();
        let body = tokio::select! {
            b = response.bytes() => b?,
            _ = token.cancelled() => return Err(Error::Cancelled),
        };
        self.counter.count_received(body.len() as u64);
        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }
}
