//! Service registration.
//!
//! The server announces itself to a Consul agent at start-up and withdraws at
//! the beginning of the drain, so the registry stops routing traffic before
//! the listener goes away. Registry calls are best effort: every failure is
//! returned as [`Error::Registry`] for the caller to log, never to abort on.

use crate::server::config::RegistryConfig;
use core::time::Duration;
use inferd_core::{Error, Result};
use serde::Serialize;
use std::{
    net::{IpAddr, Ipv4Addr, UdpSocket},
    sync::Arc,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Identity a server instance registers under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRegistration {
    pub id: String,
    pub name: String,
    pub address: IpAddr,
    pub port: u16,
    pub tags: Vec<String>,
}

impl ServiceRegistration {
    /// Derives the service id as `{name}-{address}-{port}`.
    pub fn new(name: impl Into<String>, address: IpAddr, port: u16) -> Self {
        let name = name.into();
        Self {
            id: format!("{name}-{address}-{port}"),
            tags: vec![name.clone()],
            name,
            address,
            port,
        }
    }

    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// A registry the server announces itself to.
#[tonic::async_trait]
pub trait ServiceRegistry: Send + Sync + 'static {
    async fn register(&self, registration: &ServiceRegistration) -> Result<()>;

    async fn deregister(&self, service_id: &str) -> Result<()>;
}

/// Registry used when registration is switched off.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledRegistry;

#[tonic::async_trait]
impl ServiceRegistry for DisabledRegistry {
    async fn register(&self, registration: &ServiceRegistration) -> Result<()> {
        tracing::debug!("Registry disabled, not registering {}", registration.id);
        Ok(())
    }

    async fn deregister(&self, _service_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Consul agent HTTP API client.
#[derive(Debug, Clone)]
pub struct ConsulRegistry {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentService<'a> {
    #[serde(rename = "ID")]
    id: &'a str,
    name: &'a str,
    tags: &'a [String],
    address: String,
    port: u16,
    check: AgentCheck,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentCheck {
    #[serde(rename = "GRPC")]
    grpc: String,
    #[serde(rename = "GRPCUseTLS")]
    grpc_use_tls: bool,
    interval: &'static str,
    timeout: &'static str,
    deregister_critical_service_after: &'static str,
}

impl<'a> AgentService<'a> {
    fn from_registration(registration: &'a ServiceRegistration) -> Self {
        Self {
            id: &registration.id,
            name: &registration.name,
            tags: &registration.tags,
            address: registration.address.to_string(),
            port: registration.port,
            check: AgentCheck {
                grpc: format!("{}:{}", registration.address, registration.port),
                grpc_use_tls: false,
                interval: "10s",
                timeout: "3s",
                deregister_critical_service_after: "1m",
            },
        }
    }
}

impl ConsulRegistry {
    /// Client for the agent at `address` (`host:port`, scheme optional).
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be constructed.
    pub fn new(address: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::registry(format!("http client: {e}")))?;

        let base_url = if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address.trim_end_matches('/'))
        };

        Ok(Self { client, base_url })
    }

    async fn put(&self, path: &str, body: Option<&AgentService<'_>>) -> Result<()> {
        let url = format!("{}{path}", self.base_url);
        let request = self.client.put(&url);
        let request = match body {
            Some(body) => request.json(body),
            None => request,
        };

        let response = request
            .send()
            .await
            .map_err(|e| Error::registry(format!("PUT {url}: {e}")))?;

        response
            .error_for_status()
            .map(drop)
            .map_err(|e| Error::registry(format!("PUT {url}: {e}")))
    }
}

#[tonic::async_trait]
impl ServiceRegistry for ConsulRegistry {
    async fn register(&self, registration: &ServiceRegistration) -> Result<()> {
        let body = AgentService::from_registration(registration);
        self.put("/v1/agent/service/register", Some(&body)).await
    }

    async fn deregister(&self, service_id: &str) -> Result<()> {
        self.put(&format!("/v1/agent/service/deregister/{service_id}"), None)
            .await
    }
}

/// Builds the registry selected by `config`.
///
/// # Errors
///
/// Fails if the Consul client cannot be constructed.
pub fn registry_from_config(config: &RegistryConfig) -> Result<Arc<dyn ServiceRegistry>> {
    if !config.enabled {
        return Ok(Arc::new(DisabledRegistry));
    }
    Ok(Arc::new(ConsulRegistry::new(&config.consul_address)?))
}

/// Address other hosts can reach this one on.
///
/// Uses the source address the kernel picks for an outbound route; nothing
/// is sent. Falls back to loopback when there is no route.
pub fn detect_advertise_ip() -> IpAddr {
    let route = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
        Ok(socket.local_addr()?.ip())
    };

    match route() {
        Ok(ip) if !ip.is_unspecified() => ip,
        Ok(_) | Err(_) => {
            tracing::warn!("Could not detect an outbound address, advertising 127.0.0.1");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        sync::oneshot,
    };

    fn registration() -> ServiceRegistration {
        ServiceRegistration::new("llm-inference", "10.0.0.7".parse().unwrap(), 8083)
            .with_tags(["llm-inference", "production", "grpc"])
    }

    #[test]
    fn service_id_is_name_address_port() {
        let reg = ServiceRegistration::new("svc", "192.168.1.2".parse().unwrap(), 9000);
        assert_eq!(reg.id, "svc-192.168.1.2-9000");
        assert_eq!(reg.tags, vec!["svc".to_string()]);
    }

    #[test]
    fn agent_payload_uses_consul_field_names() {
        let reg = registration();
        let json = serde_json::to_value(AgentService::from_registration(&reg)).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "ID": "llm-inference-10.0.0.7-8083",
                "Name": "llm-inference",
                "Tags": ["llm-inference", "production", "grpc"],
                "Address": "10.0.0.7",
                "Port": 8083,
                "Check": {
                    "GRPC": "10.0.0.7:8083",
                    "GRPCUseTLS": false,
                    "Interval": "10s",
                    "Timeout": "3s",
                    "DeregisterCriticalServiceAfter": "1m"
                }
            })
        );
    }

    /// Serves one HTTP request with `status`, returning the raw request head.
    async fn one_shot_agent(status: &'static str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 16 * 1024];
            let mut read = 0;
            loop {
                let n = socket.read(&mut buf[read..]).await.unwrap();
                read += n;
                let text = String::from_utf8_lossy(&buf[..read]).to_string();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let body_len = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length")
                                .then(|| v.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if read >= head_end + 4 + body_len || n == 0 {
                        let _ = tx.send(text);
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
            socket.write_all(response.as_bytes()).await.unwrap();
        });

        (addr, rx)
    }

    #[tokio::test]
    async fn register_puts_service_definition() {
        let (addr, request) = one_shot_agent("200 OK").await;
        let registry = ConsulRegistry::new(&addr).unwrap();

        registry.register(&registration()).await.unwrap();

        let request = request.await.unwrap();
        assert!(request.starts_with("PUT /v1/agent/service/register HTTP/1.1"));
        assert!(request.contains(r#""ID":"llm-inference-10.0.0.7-8083""#));
    }

    #[tokio::test]
    async fn deregister_puts_service_id() {
        let (addr, request) = one_shot_agent("200 OK").await;
        let registry = ConsulRegistry::new(&format!("http://{addr}/")).unwrap();

        registry.deregister("svc-1.2.3.4-80").await.unwrap();

        let request = request.await.unwrap();
        assert!(request.starts_with("PUT /v1/agent/service/deregister/svc-1.2.3.4-80 HTTP/1.1"));
    }

    #[tokio::test]
    async fn non_success_status_is_registry_error() {
        let (addr, _request) = one_shot_agent("500 Internal Server Error").await;
        let registry = ConsulRegistry::new(&addr).unwrap();

        let err = registry.register(&registration()).await.unwrap_err();
        assert!(matches!(err, Error::Registry { .. }));
    }

    #[tokio::test]
    async fn unreachable_agent_is_registry_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let registry = ConsulRegistry::new(&addr).unwrap();
        let err = registry.deregister("x").await.unwrap_err();
        assert!(matches!(err, Error::Registry { .. }));
    }

    #[test]
    fn advertise_ip_is_never_unspecified() {
        assert!(!detect_advertise_ip().is_unspecified());
    }
}
