//! Outbound HTTP/SSE transport driver: connectivity probing with anti-SSRF
//! address filtering, signed `post_message`, and `data:`-framed SSE
//! streaming, grounded on `model/network_interface/network_interface.py`'s
//! `NetworkDriver`.

use std::net::IpAddr;
use std::time::Duration;

use async_stream::stream;
use futures::Stream;
use reqwest::redirect::Policy;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::lookup_host;

use crate::kms::Kms;

/// Connectivity probes use a fresh client per call with a strict timeout, no
/// redirects, and no automatic content decoding, so a malicious peer can't
/// smuggle a probe past the address check via a redirect.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("request to {0} failed")]
    Request(String),
    #[error("request failed with status {0}")]
    RequestFailed(u16),
    #[error("refused to dial private/loopback/reserved address for {0}")]
    RefusedAddress(String),
    #[error("malformed url: {0}")]
    BadUrl(String),
    #[error("response body was not valid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// True iff `addr` is loopback, private, link-local, unspecified, or
/// otherwise not a routable public address — the anti-SSRF filter `spec.md`
/// §4.6 requires before issuing a connectivity probe.
fn is_disallowed(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
        }
    }
}

async fn resolve_and_check(url: &url::Url) -> Result<(), TransportError> {
    let host = url
        .host_str()
        .ok_or_else(|| TransportError::BadUrl(url.to_string()))?;

    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_disallowed(ip) {
            return Err(TransportError::RefusedAddress(url.to_string()));
        }
        return Ok(());
    }

    let port = url.port_or_known_default().unwrap_or(80);
    let addrs = lookup_host((host, port))
        .await
        .map_err(|_| TransportError::RefusedAddress(url.to_string()))?;

    let mut saw_any = false;
    for addr in addrs {
        saw_any = true;
        if is_disallowed(addr.ip()) {
            return Err(TransportError::RefusedAddress(url.to_string()));
        }
    }

    if !saw_any {
        return Err(TransportError::RefusedAddress(url.to_string()));
    }

    Ok(())
}

/// Outbound HTTP/SSE operations a connecting peer is reached through.
pub struct Transport {
    client: Client,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport {
    pub fn new() -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("default reqwest client always builds"),
        }
    }

    /// Resolve `url`'s host and refuse loopback/private/reserved/link-local
    /// addresses before issuing a 2s-timeout, no-redirect, identity-encoding
    /// GET. Success iff HTTP 200.
    pub async fn check_connectivity(&self, url: &str) -> bool {
        let Ok(parsed) = url::Url::parse(url) else {
            return false;
        };
        if resolve_and_check(&parsed).await.is_err() {
            return false;
        }

        let probe = match Client::builder()
            .timeout(PROBE_TIMEOUT)
            .connect_timeout(PROBE_TIMEOUT)
            .redirect(Policy::none())
            .no_gzip()
            .no_brotli()
            .no_deflate()
            .build()
        {
            Ok(client) => client,
            Err(_) => return false,
        };

        matches!(probe.get(parsed).send().await, Ok(resp) if resp.status().is_success())
    }

    pub async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T, TransportError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|_| TransportError::Request(url.to_string()))?;
        self.parse_or_fail(response).await
    }

    pub async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: &str,
        payload: &B,
        headers: Vec<(&str, String)>,
    ) -> Result<T, TransportError> {
        let mut request = self.client.post(url).json(payload);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request
            .send()
            .await
            .map_err(|_| TransportError::Request(url.to_string()))?;
        self.parse_or_fail(response).await
    }

    async fn parse_or_fail<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, TransportError> {
        if !response.status().is_success() {
            return Err(TransportError::RequestFailed(response.status().as_u16()));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|_| TransportError::Request("reading response body".to_string()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Open a line-based SSE stream, yielding each `data: ...` payload with
    /// its prefix stripped. Non-`data:` lines (e.g. `event: ping`) are
    /// skipped here; callers that care about event type read the raw line
    /// themselves via [`Transport::stream_raw`].
    pub fn stream(
        &self,
        url: String,
        payload: serde_json::Value,
        headers: Vec<(String, String)>,
    ) -> impl Stream<Item = Result<String, TransportError>> {
        let client = self.client.clone();
        stream! {
            let mut request = client.post(&url).json(&payload);
            for (name, value) in headers {
                request = request.header(name, value);
            }
            let response = match request.send().await {
                Ok(r) => r,
                Err(_) => {
                    yield Err(TransportError::Request(url));
                    return;
                }
            };
            if !response.status().is_success() {
                yield Err(TransportError::RequestFailed(response.status().as_u16()));
                return;
            }

            let mut buf = String::new();
            let mut body = response;
            loop {
                match body.chunk().await {
                    Ok(Some(chunk)) => {
                        buf.push_str(&String::from_utf8_lossy(&chunk));
                        while let Some(pos) = buf.find('\n') {
                            let line = buf[..pos].trim_end_matches('\r').to_string();
                            buf.drain(..=pos);
                            if let Some(data) = line.strip_prefix("data:") {
                                yield Ok(data.trim_start().to_string());
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {
                        yield Err(TransportError::Request("stream interrupted".to_string()));
                        break;
                    }
                }
            }
        }
    }

    /// POST a signed envelope to `url`, setting `Message-Signature` to
    /// `sign_payload(envelope_json, network_id)`. Signing happens over the
    /// exact bytes that are then transmitted as the body.
    pub async fn post_message(
        &self,
        url: &str,
        envelope_json: &str,
        network_id: &str,
        kms: &dyn Kms,
    ) -> Result<(), TransportError> {
        let signature = kms
            .sign_payload(envelope_json, network_id)
            .await
            .map_err(|_| TransportError::Request(url.to_string()))?;

        let response = self
            .client
            .post(url)
            .header("Message-Signature", signature)
            .header("Content-Type", "application/json")
            .body(envelope_json.to_string())
            .send()
            .await
            .map_err(|_| TransportError::Request(url.to_string()))?;

        if !response.status().is_success() {
            return Err(TransportError::RequestFailed(response.status().as_u16()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refuses_loopback_without_dialing() {
        let transport = Transport::new();
        assert!(!transport.check_connectivity("http://127.0.0.1:9999/probe").await);
    }

    #[tokio::test]
    async fn refuses_private_address_without_dialing() {
        let transport = Transport::new();
        assert!(!transport.check_connectivity("http://10.0.0.5/probe").await);
    }

    #[tokio::test]
    async fn refuses_link_local_address() {
        let transport = Transport::new();
        assert!(!transport.check_connectivity("http://169.254.1.1/probe").await);
    }

    #[tokio::test]
    async fn refuses_unparseable_url() {
        let transport = Transport::new();
        assert!(!transport.check_connectivity("not a url").await);
    }

    #[test]
    fn disallowed_address_classification() {
        assert!(is_disallowed("127.0.0.1".parse().unwrap()));
        assert!(is_disallowed("10.1.2.3".parse().unwrap()));
        assert!(is_disallowed("192.168.1.1".parse().unwrap()));
        assert!(is_disallowed("169.254.0.1".parse().unwrap()));
        assert!(is_disallowed("::1".parse().unwrap()));
        assert!(!is_disallowed("93.184.216.34".parse().unwrap()));
    }
}
