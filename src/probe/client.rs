//! HTTP requests through a SOCKS5 listener

use super::result::ProbeErrorKind;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Expected HTTP status for a probe request
#[derive(Debug, Clone)]
pub struct ExpectedStatus {
    pub codes: Vec<u16>,
}

impl ExpectedStatus {
    pub fn new(codes: Vec<u16>) -> Self {
        ExpectedStatus { codes }
    }

    pub fn matches(&self, status: u16) -> bool {
        self.codes.is_empty() || self.codes.contains(&status)
    }
}

impl Default for ExpectedStatus {
    fn default() -> Self {
        ExpectedStatus { codes: vec![200, 204] }
    }
}

/// Issues one timed request to a target through a proxy
#[async_trait]
pub trait ProbeClient: Send + Sync {
    /// Round-trip time of a GET to `target` via the SOCKS5 listener at `proxy`
    async fn fetch(
        &self,
        proxy: SocketAddr,
        target: &str,
        timeout: Duration,
    ) -> std::result::Result<Duration, ProbeErrorKind>;
}

/// [`ProbeClient`] backed by reqwest
#[derive(Debug, Clone, Default)]
pub struct ReqwestProbeClient {
    expected: ExpectedStatus,
}

impl ReqwestProbeClient {
    pub fn new(expected: ExpectedStatus) -> Self {
        ReqwestProbeClient { expected }
    }
}

#[async_trait]
impl ProbeClient for ReqwestProbeClient {
    async fn fetch(
        &self,
        proxy: SocketAddr,
        target: &str,
        timeout: Duration,
    ) -> std::result::Result<Duration, ProbeErrorKind> {
        // socks5h: let the tunnel resolve target names
        let proxy = reqwest::Proxy::all(format!("socks5h://{}", proxy))
            .map_err(|e| ProbeErrorKind::Other(e.to_string()))?;

        // One client per request: no pooled connection may skew the next probe
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(timeout)
            .connect_timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| ProbeErrorKind::Other(e.to_string()))?;

        let start = Instant::now();
        match client.get(target).send().await {
            Ok(response) => {
                let elapsed = start.elapsed();
                let status = response.status().as_u16();
                if self.expected.matches(status) {
                    Ok(elapsed)
                } else {
                    Err(ProbeErrorKind::UnexpectedStatus(status))
                }
            }
            Err(e) if e.is_timeout() => Err(ProbeErrorKind::Timeout),
            Err(e) if e.is_connect() => Err(ProbeErrorKind::Connection),
            Err(e) => Err(ProbeErrorKind::Other(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_status() {
        let expected = ExpectedStatus::new(vec![200, 204]);
        assert!(expected.matches(200));
        assert!(expected.matches(204));
        assert!(!expected.matches(404));
        assert!(ExpectedStatus::new(vec![]).matches(503));
    }

    #[tokio::test]
    async fn test_fetch_through_dead_proxy_fails() {
        // bind then drop to get a port with nothing listening
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = ReqwestProbeClient::default();
        let result = client
            .fetch(addr, "http://example.invalid/generate_204", Duration::from_secs(2))
            .await;
        assert!(result.is_err());
    }
}
