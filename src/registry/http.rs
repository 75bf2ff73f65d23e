//! JSON-over-HTTP registry client
//!
//! Unary calls are plain JSON requests with a per-request timeout. Change
//! events arrive on a long-lived newline-delimited JSON stream that a
//! background pump task reads, parses, and fans out on a broadcast channel;
//! the pump reconnects with jittered backoff whenever the stream drops.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Url;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::Error;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::Result;

use super::{Endpoint, Registry, RegistryEvent, ServiceRecord};

/// Connect timeout for the registry HTTP client (generous for a local
/// control plane, short enough to fail fast when it is gone)
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Buffered events per subscriber before a slow consumer starts lagging
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Registry client speaking JSON over HTTP
pub struct HttpRegistry {
    http: reqwest::Client,
    base: Url,
    request_timeout: Duration,
    events_tx: broadcast::Sender<RegistryEvent>,
}

impl HttpRegistry {
    /// Build a client for the registry at `config.registry_url`
    pub fn new(config: &Config) -> Result<Self> {
        let base = Url::parse(&config.registry_url).map_err(|e| {
            Error::registry(
                "configure",
                format!("invalid registry URL {}: {e}", config.registry_url),
            )
        })?;
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| Error::registry("configure", e))?;
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            http,
            base,
            request_timeout: config.request_timeout(),
            events_tx,
        })
    }

    /// Start the background task that consumes the registry event stream.
    ///
    /// The task reconnects forever with jittered backoff and only exits
    /// when `cancel` fires.
    pub fn spawn_event_pump(self: &Arc<Self>, cancel: &CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let retry = RetryConfig::infinite();
            let result = tokio::select! {
                _ = cancel.cancelled() => Ok(()),
                result = retry_with_backoff(&retry, "registry_events", || {
                    registry.stream_events(&cancel)
                }) => result,
            };
            if let Err(error) = result {
                error!(%error, "registry event pump stopped");
            }
            debug!("registry event pump exited");
        })
    }

    /// Consume the event stream until it drops or `cancel` fires.
    ///
    /// Returns `Ok` only on cancellation; every other exit (including a
    /// clean server-side close) is an error so the retry loop reconnects.
    async fn stream_events(&self, cancel: &CancellationToken) -> Result<()> {
        const OPERATION: &str = "stream_events";

        let url = self.endpoint(OPERATION, &["events"])?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::registry(OPERATION, e))?
            .error_for_status()
            .map_err(|e| Error::registry(OPERATION, e))?;

        info!("subscribed to registry event stream");
        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    buffer.extend_from_slice(&bytes);
                    for line in drain_lines(&mut buffer) {
                        self.dispatch_line(&line);
                    }
                }
                Some(Err(e)) => return Err(Error::registry(OPERATION, e)),
                None => {
                    return Err(Error::registry(OPERATION, "event stream closed by server"));
                }
            }
        }
    }

    /// Parse one NDJSON line and fan it out to subscribers
    fn dispatch_line(&self, line: &[u8]) {
        if line.iter().all(u8::is_ascii_whitespace) {
            return;
        }
        match serde_json::from_slice::<RegistryEvent>(line) {
            Ok(event) => {
                debug!(?event, "registry event");
                // send fails only when nobody is subscribed yet
                let _ = self.events_tx.send(event);
            }
            Err(error) => warn!(%error, "dropping malformed registry event"),
        }
    }

    /// Build `{base}/api/v1/{segments...}` with proper segment encoding
    fn endpoint(&self, operation: &'static str, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|()| Error::registry(operation, "registry URL cannot be a base"))?;
            path.pop_if_empty();
            path.extend(["api", "v1"]);
            path.extend(segments);
        }
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        segments: &[&str],
    ) -> Result<T> {
        let url = self.endpoint(operation, segments)?;
        let response = self
            .http
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| Error::registry(operation, e))?
            .error_for_status()
            .map_err(|e| Error::registry(operation, e))?;
        response
            .json()
            .await
            .map_err(|e| Error::registry(operation, e))
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn ready(&self) -> bool {
        let url = match self.endpoint("ready", &["readyz"]) {
            Ok(url) => url,
            Err(_) => return false,
        };
        match self.http.get(url).timeout(self.request_timeout).send().await {
            Ok(response) => response.status().is_success(),
            Err(error) => {
                debug!(%error, "registry readiness probe failed");
                false
            }
        }
    }

    async fn get_namespaces(&self) -> Result<Vec<String>> {
        self.get_json("get_namespaces", &["namespaces"]).await
    }

    async fn get_services_in_namespace(&self, namespace: &str) -> Result<Vec<String>> {
        self.get_json(
            "get_services_in_namespace",
            &["namespaces", namespace, "services"],
        )
        .await
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<ServiceRecord> {
        self.get_json("get_service", &["namespaces", namespace, "services", name])
            .await
    }

    async fn set_service_lb_endpoints(
        &self,
        namespace: &str,
        name: &str,
        endpoints: &[Endpoint],
    ) -> Result<()> {
        const OPERATION: &str = "set_service_lb_endpoints";

        let url = self.endpoint(
            OPERATION,
            &["namespaces", namespace, "services", name, "load-balancers"],
        )?;
        self.http
            .put(url)
            .timeout(self.request_timeout)
            .json(&endpoints)
            .send()
            .await
            .map_err(|e| Error::registry(OPERATION, e))?
            .error_for_status()
            .map_err(|e| Error::registry(OPERATION, e))?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events_tx.subscribe()
    }
}

/// Split complete lines out of `buffer`, leaving any partial trailing line
/// in place for the next chunk
fn drain_lines(buffer: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
        let mut line: Vec<u8> = buffer.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        lines.push(line);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ResourceRef;

    fn test_registry() -> HttpRegistry {
        HttpRegistry::new(&Config::for_testing()).unwrap()
    }

    // =========================================================================
    // URL building
    // =========================================================================

    #[test]
    fn endpoint_joins_segments_under_api_v1() {
        let registry = test_registry();
        let url = registry
            .endpoint("get_service", &["namespaces", "team-a", "services", "checkout"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://registry.test:7770/api/v1/namespaces/team-a/services/checkout"
        );
    }

    #[test]
    fn endpoint_encodes_awkward_segment_characters() {
        let registry = test_registry();
        let url = registry
            .endpoint("get_services_in_namespace", &["namespaces", "team a", "services"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://registry.test:7770/api/v1/namespaces/team%20a/services"
        );
    }

    // =========================================================================
    // NDJSON framing
    // =========================================================================

    #[test]
    fn drain_lines_handles_partial_chunks() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(b"{\"a\":1}\n{\"b\"");
        let lines = drain_lines(&mut buffer);
        assert_eq!(lines, vec![b"{\"a\":1}".to_vec()]);
        assert_eq!(buffer, b"{\"b\"".to_vec());

        buffer.extend_from_slice(b":2}\r\n");
        let lines = drain_lines(&mut buffer);
        assert_eq!(lines, vec![b"{\"b\":2}".to_vec()]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn dispatch_delivers_parsed_events_to_subscribers() {
        let registry = test_registry();
        let mut rx = registry.subscribe();

        registry.dispatch_line(
            br#"{"type":"configuration_changed","resource":{"type":"service","namespace":"team-a","name":"checkout"}}"#,
        );

        let event = rx.try_recv().unwrap();
        assert_eq!(
            event,
            RegistryEvent::ConfigurationChanged {
                resource: ResourceRef {
                    kind: "service".to_string(),
                    namespace: "team-a".to_string(),
                    name: "checkout".to_string(),
                },
            }
        );
    }

    #[test]
    fn dispatch_skips_malformed_and_blank_lines() {
        let registry = test_registry();
        let mut rx = registry.subscribe();

        registry.dispatch_line(b"not json at all");
        registry.dispatch_line(b"   ");
        registry.dispatch_line(b"");

        assert!(rx.try_recv().is_err());
    }
}
