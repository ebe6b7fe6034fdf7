//! MQTT hub transport.
//!
//! The hub publishes lifecycle events on `{prefix}/hub`; each agent
//! publishes on `{prefix}/agent/{client_id}`. Payloads are the JSON
//! messages from `crate::protocol`.
//!
//! Security defaults:
//! - Broker must be loopback unless `allow_remote` is set.
//! - TLS is opt-in via `mqtts://`; CA and client materials require it.

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{Client, Connection, Event, Incoming, MqttOptions};
use rumqttc::Transport;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::{closed, HubConnection, HubDelivery, HubPublisher, HubTransport};
use crate::config::HubSettings;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// Parse `host:port`, `[v6]:port`, or a `mqtt://`/`mqtts://` URL.
pub fn parse_mqtt_endpoint(addr: &str, tls_override: bool) -> Result<MqttEndpoint> {
    let mut use_tls = tls_override;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported hub scheme: {}", other)),
        }
        remainder = rest.trim_end_matches('/');
    }

    let (host, port) = split_host_port(remainder)?;
    Ok(MqttEndpoint {
        host,
        port,
        use_tls,
    })
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid hub address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing hub port in {}", addr))?;
        let port: u16 = port.parse().context("invalid hub port")?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing hub port in {}", addr))?;
    if host.is_empty() {
        return Err(anyhow!("missing hub host in {}", addr));
    }
    let port: u16 = port.parse().context("invalid hub port")?;
    Ok((host.to_string(), port))
}

pub fn validate_loopback_addr(endpoint: &MqttEndpoint, original: &str) -> Result<()> {
    let host = endpoint.host.as_str();
    if host == "localhost" || host == "127.0.0.1" || host == "::1" {
        return Ok(());
    }
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        if ip.is_loopback() {
            return Ok(());
        }
    }
    Err(anyhow!(
        "hub broker must be loopback: {} (set hub.allow_remote or KIOSK_ALLOW_REMOTE=1 to override)",
        original
    ))
}

/// PEM materials for the broker connection.
#[derive(Clone, Debug, Default)]
pub struct TlsMaterials {
    /// `None` uses the default root store.
    pub ca: Option<Vec<u8>>,
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
}

impl TlsMaterials {
    pub fn load(
        ca_path: Option<&Path>,
        client_cert_path: Option<&Path>,
        client_key_path: Option<&Path>,
    ) -> Result<Self> {
        let ca = match ca_path {
            Some(path) => Some(
                std::fs::read(path)
                    .with_context(|| format!("failed to read hub TLS CA {}", path.display()))?,
            ),
            None => None,
        };

        let client_auth = match (client_cert_path, client_key_path) {
            (Some(cert_path), Some(key_path)) => {
                let cert = std::fs::read(cert_path).with_context(|| {
                    format!("failed to read hub TLS client cert {}", cert_path.display())
                })?;
                let key = std::fs::read(key_path).with_context(|| {
                    format!("failed to read hub TLS client key {}", key_path.display())
                })?;
                Some((cert, key))
            }
            (None, None) => None,
            (Some(_), None) => return Err(anyhow!("hub TLS client certificate provided without key")),
            (None, Some(_)) => return Err(anyhow!("hub TLS client key provided without certificate")),
        };

        Ok(Self { ca, client_auth })
    }

    pub fn is_configured(&self) -> bool {
        self.ca.is_some() || self.client_auth.is_some()
    }
}

fn build_transport(endpoint: &MqttEndpoint, tls: &TlsMaterials) -> Result<Transport> {
    if !endpoint.use_tls {
        if tls.is_configured() {
            return Err(anyhow!(
                "hub TLS materials provided but TLS is disabled (use an mqtts:// address)"
            ));
        }
        return Ok(Transport::tcp());
    }

    if !tls.is_configured() {
        return Ok(Transport::tls_with_default_config());
    }

    let ca = tls.ca.clone().ok_or_else(|| {
        anyhow!("hub TLS CA certificate is required when providing client certificates")
    })?;
    Ok(Transport::tls(ca, tls.client_auth.clone(), None))
}

pub struct MqttTransport {
    original: String,
    endpoint: MqttEndpoint,
    tls: TlsMaterials,
    client_id: String,
    username: Option<String>,
    password: Option<String>,
    inbound_topic: String,
    outbound_topic: String,
}

impl MqttTransport {
    /// Validate the hub settings up front so misconfiguration fails at startup
    /// rather than inside the reconnect loop.
    pub fn from_settings(settings: &HubSettings, default_client_id: &str) -> Result<Self> {
        let endpoint = parse_mqtt_endpoint(&settings.addr, false)?;
        if !settings.allow_remote {
            validate_loopback_addr(&endpoint, &settings.addr)?;
        }
        let tls = TlsMaterials::load(
            settings.ca_path.as_deref(),
            settings.client_cert_path.as_deref(),
            settings.client_key_path.as_deref(),
        )?;
        // Surface TLS misconfiguration now.
        build_transport(&endpoint, &tls)?;

        let client_id = settings
            .client_id
            .clone()
            .unwrap_or_else(|| default_client_id.to_string());
        let prefix = settings.topic_prefix.trim_end_matches('/');
        Ok(Self {
            original: settings.addr.clone(),
            inbound_topic: format!("{}/hub", prefix),
            outbound_topic: format!("{}/agent/{}", prefix, client_id),
            endpoint,
            tls,
            client_id,
            username: settings.username.clone(),
            password: settings.password.clone(),
        })
    }

    pub fn inbound_topic(&self) -> &str {
        &self.inbound_topic
    }

    pub fn outbound_topic(&self) -> &str {
        &self.outbound_topic
    }
}

impl HubTransport for MqttTransport {
    fn connect(&self) -> Result<(Box<dyn HubConnection>, Arc<dyn HubPublisher>)> {
        let mut options = MqttOptions::new(&self.client_id, &self.endpoint.host, self.endpoint.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        if let Some(user) = self.username.as_deref() {
            options.set_credentials(user, self.password.as_deref().unwrap_or_default());
        }
        options.set_transport(build_transport(&self.endpoint, &self.tls)?);

        let (client, connection) = Client::new(options, 10);
        log::debug!(
            "hub: mqtt session for {} (TLS: {}, auth: {})",
            self.client_id,
            self.endpoint.use_tls,
            self.username.is_some()
        );
        let inbound = MqttConnection {
            client: client.clone(),
            connection,
            topic: self.inbound_topic.clone(),
        };
        let publisher = MqttPublisher {
            client,
            topic: self.outbound_topic.clone(),
        };
        Ok((Box::new(inbound), Arc::new(publisher)))
    }

    fn describe(&self) -> String {
        self.original.clone()
    }
}

struct MqttConnection {
    client: Client,
    connection: Connection,
    topic: String,
}

impl HubConnection for MqttConnection {
    fn recv(&mut self) -> Result<HubDelivery> {
        loop {
            let event = self.connection.iter().next().ok_or_else(closed)?;
            match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    self.client
                        .try_subscribe(self.topic.as_str(), QoS::AtLeastOnce)
                        .context("failed to subscribe to hub topic")?;
                    return Ok(HubDelivery::Connected);
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let topic = String::from_utf8_lossy(&publish.topic);
                    if topic != self.topic {
                        log::debug!("hub: ignoring message on {}", topic);
                        continue;
                    }
                    return Ok(HubDelivery::Payload(
                        String::from_utf8_lossy(&publish.payload).into_owned(),
                    ));
                }
                Ok(Event::Incoming(Incoming::Disconnect(_))) => {
                    return Err(anyhow!("broker sent disconnect"));
                }
                Ok(_) => {}
                Err(e) => return Err(anyhow!("mqtt connection error: {}", e)),
            }
        }
    }
}

struct MqttPublisher {
    client: Client,
    topic: String,
}

impl HubPublisher for MqttPublisher {
    fn publish(&self, payload: &str) -> Result<()> {
        self.client
            .try_publish(
                self.topic.as_str(),
                QoS::AtLeastOnce,
                false,
                payload.as_bytes().to_vec(),
            )
            .context("mqtt publish failed")?;
        Ok(())
    }

    fn close(&self) {
        if let Err(e) = self.client.try_disconnect() {
            log::debug!("hub: disconnect failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;

    fn settings(addr: &str) -> HubSettings {
        HubSettings {
            addr: addr.to_string(),
            topic_prefix: "kiosk/".to_string(),
            client_id: None,
            allow_remote: false,
            username: None,
            password: None,
            ca_path: None,
            client_cert_path: None,
            client_key_path: None,
            reconnect: RetryPolicy::default(),
        }
    }

    #[test]
    fn parse_endpoint_plain() {
        let endpoint = parse_mqtt_endpoint("127.0.0.1:1883", false).unwrap();
        assert_eq!(endpoint.host, "127.0.0.1");
        assert_eq!(endpoint.port, 1883);
        assert!(!endpoint.use_tls);
    }

    #[test]
    fn parse_endpoint_mqtts_scheme() {
        let endpoint = parse_mqtt_endpoint("mqtts://localhost:8883", false).unwrap();
        assert_eq!(endpoint.host, "localhost");
        assert_eq!(endpoint.port, 8883);
        assert!(endpoint.use_tls);
    }

    #[test]
    fn parse_endpoint_ipv6() {
        let endpoint = parse_mqtt_endpoint("[::1]:1883", false).unwrap();
        assert_eq!(endpoint.host, "::1");
        assert_eq!(endpoint.port, 1883);
    }

    #[test]
    fn parse_endpoint_rejects_bad_input() {
        assert!(parse_mqtt_endpoint("ws://localhost:1883", false).is_err());
        assert!(parse_mqtt_endpoint("localhost", false).is_err());
        assert!(parse_mqtt_endpoint(":1883", false).is_err());
        assert!(parse_mqtt_endpoint("localhost:http", false).is_err());
    }

    #[test]
    fn loopback_accepts_local_hosts() {
        for addr in ["localhost:1883", "127.0.0.1:1883", "127.0.0.2:1883", "[::1]:1883"] {
            let endpoint = parse_mqtt_endpoint(addr, false).unwrap();
            assert!(validate_loopback_addr(&endpoint, addr).is_ok(), "{}", addr);
        }
    }

    #[test]
    fn loopback_rejects_remote_hosts() {
        let endpoint = parse_mqtt_endpoint("192.168.1.10:1883", false).unwrap();
        let err = validate_loopback_addr(&endpoint, "192.168.1.10:1883").unwrap_err();
        assert!(err.to_string().contains("loopback"));
    }

    #[test]
    fn remote_broker_needs_opt_in() {
        let mut hub = settings("hub.local:1883");
        assert!(MqttTransport::from_settings(&hub, "vision").is_err());
        hub.allow_remote = true;
        assert!(MqttTransport::from_settings(&hub, "vision").is_ok());
    }

    #[test]
    fn topics_follow_prefix_and_client_id() {
        let transport = MqttTransport::from_settings(&settings("localhost:1883"), "vision").unwrap();
        assert_eq!(transport.inbound_topic(), "kiosk/hub");
        assert_eq!(transport.outbound_topic(), "kiosk/agent/vision");
    }

    #[test]
    fn client_cert_requires_key() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("client.pem");
        std::fs::write(&cert, b"cert").unwrap();
        let err = TlsMaterials::load(None, Some(&cert), None).unwrap_err();
        assert!(err.to_string().contains("without key"));
    }

    #[test]
    fn tls_materials_require_tls_scheme() {
        let endpoint = parse_mqtt_endpoint("localhost:1883", false).unwrap();
        let tls = TlsMaterials {
            ca: Some(b"ca".to_vec()),
            client_auth: None,
        };
        assert!(build_transport(&endpoint, &tls).is_err());
        let endpoint = parse_mqtt_endpoint("mqtts://localhost:8883", false).unwrap();
        assert!(build_transport(&endpoint, &TlsMaterials::default()).is_ok());
    }
}
