//! MQTT notifier.
//!
//! QoS 1 publishes over rumqttc's blocking v5 client. The connection event loop
//! runs on its own thread for the life of the notifier: connection errors are
//! logged and the next poll reconnects after `RETRY_DELAY`. Publishing never
//! blocks; a full request queue is a publish error.
//!
//! A retained `online` is published to the availability topic on connect and a
//! retained `offline` on close; the broker publishes the same `offline` as last
//! will if the device disappears.

use anyhow::{anyhow, Context, Result};
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};
use rumqttc::{Outgoing, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::{Notifier, Topics};
use crate::pipeline::sleep_unless_stopped;

const PAYLOAD_ONLINE: &str = "online";
const PAYLOAD_OFFLINE: &str = "offline";
const REQUEST_QUEUE: usize = 64;
const RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct MqttSettings {
    /// `host:port`, optionally prefixed with `mqtt://`, `tcp://`, `mqtts://` or `ssl://`.
    pub broker_addr: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
struct MqttEndpoint {
    host: String,
    port: u16,
    use_tls: bool,
}

pub struct MqttNotifier {
    client: Client,
    connection_handle: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    availability_topic: String,
    closed: bool,
}

impl MqttNotifier {
    pub fn connect(settings: &MqttSettings, topics: &Topics) -> Result<Self> {
        let endpoint = parse_mqtt_endpoint(&settings.broker_addr)?;
        let mut options = MqttOptions::new(&settings.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        if let Some(user) = settings.username.as_deref() {
            options.set_credentials(user, settings.password.as_deref().unwrap_or_default());
        }
        options.set_last_will(LastWill::new(
            &topics.availability,
            PAYLOAD_OFFLINE.as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
            None,
        ));
        options.set_transport(if endpoint.use_tls {
            Transport::tls_with_default_config()
        } else {
            Transport::tcp()
        });

        let (client, connection) = Client::new(options, REQUEST_QUEUE);
        let shutdown = Arc::new(AtomicBool::new(false));
        let connection_handle = spawn_event_loop(connection, shutdown.clone())?;
        log::info!(
            "MQTT notifier connecting to {}:{} (TLS: {}, auth: {})",
            endpoint.host,
            endpoint.port,
            endpoint.use_tls,
            settings.username.is_some()
        );

        let notifier = Self {
            client,
            connection_handle: Some(connection_handle),
            shutdown,
            availability_topic: topics.availability.clone(),
            closed: false,
        };
        notifier.publish_bytes(&topics.availability, PAYLOAD_ONLINE.as_bytes(), true)?;
        Ok(notifier)
    }

    fn publish_bytes(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, retain, payload.to_vec())
            .with_context(|| format!("publish to {}", topic))?;
        Ok(())
    }
}

/// Drive the connection until `shutdown` is raised. rumqttc reconnects on the
/// poll after an error, so errors only pause the loop.
fn spawn_event_loop(mut connection: Connection, shutdown: Arc<AtomicBool>) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("ppe-mqtt".to_string())
        .spawn(move || {
            for event in connection.iter() {
                match event {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        if shutdown.load(Ordering::SeqCst) {
                            break;
                        }
                        log::warn!(
                            "MQTT connection error: {}; retrying in {}s",
                            e,
                            RETRY_DELAY.as_secs()
                        );
                        sleep_unless_stopped(RETRY_DELAY, &shutdown);
                        if shutdown.load(Ordering::SeqCst) {
                            break;
                        }
                    }
                }
            }
            log::debug!("MQTT event loop finished");
        })
        .map_err(|e| anyhow!("spawn MQTT event loop: {}", e))
}

impl Notifier for MqttNotifier {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn publish(&mut self, topic: &str, message: &serde_json::Value) -> Result<()> {
        if self.closed {
            return Err(anyhow!("MQTT notifier is closed"));
        }
        let payload = serde_json::to_vec(message).context("serialize MQTT payload")?;
        self.publish_bytes(topic, &payload, false)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.shutdown.store(true, Ordering::SeqCst);
        if let Err(e) = self.publish_bytes(&self.availability_topic, PAYLOAD_OFFLINE.as_bytes(), true) {
            log::warn!("failed to publish MQTT offline availability: {:#}", e);
        }
        if let Err(e) = self.client.try_disconnect() {
            log::warn!("MQTT disconnect failed: {}", e);
        }
        if let Some(handle) = self.connection_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MqttNotifier {
    fn drop(&mut self) {
        self.close();
    }
}

fn parse_mqtt_endpoint(addr: &str) -> Result<MqttEndpoint> {
    let mut use_tls = false;
    let mut remainder = addr.trim();

    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => use_tls = true,
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }

    let (host, port) = split_host_port(remainder)?;
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
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
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let port: u16 = port.parse().context("invalid MQTT port")?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    let port: u16 = port.parse().context("invalid MQTT port")?;
    Ok((host.to_string(), port))
}
