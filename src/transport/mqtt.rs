//! MQTT connection, control subscription and JPEG publisher.
//!
//! One `MqttLink` per process. Its event-loop thread keeps the session alive,
//! re-subscribes to the control topic on every ConnAck and applies control
//! messages to the shared `OutputSelector`. `MqttPublisher` shares the client
//! handle and encodes frames as JPEG before queueing them.

use anyhow::{Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, Incoming, MqttOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::endpoint::{build_transport, MqttEndpoint, TlsMaterials};
use crate::config::MqttSettings;
use crate::frame::ComposedFrame;
use crate::output::{Channel, ControlMessage, OutputSelector};
use crate::publish::{ChannelTopics, FramePublisher};

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 10;
const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);
const CONTROL_QOS: QoS = QoS::AtMostOnce;
const IMAGE_QOS: QoS = QoS::AtMostOnce;

pub struct MqttLink {
    client: Client,
    topics: ChannelTopics,
    shutdown: Arc<AtomicBool>,
    event_loop: Option<JoinHandle<()>>,
}

impl MqttLink {
    /// Connect to the broker in the background and start listening for control
    /// messages on `topics.control`.
    pub fn connect(
        settings: &MqttSettings,
        topics: ChannelTopics,
        selector: Arc<OutputSelector>,
    ) -> Result<Self> {
        let endpoint = MqttEndpoint::from_settings(settings)?;
        let tls = TlsMaterials::from_settings(settings)?;

        let mut options = MqttOptions::new(&settings.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_start(true);
        if let Some(user) = settings.username.as_deref() {
            options.set_credentials(user, settings.password.as_deref().unwrap_or_default());
        }
        options.set_transport(build_transport(&endpoint, &tls)?);

        let (client, connection) = Client::new(options, REQUEST_CAPACITY);
        let shutdown = Arc::new(AtomicBool::new(false));

        let event_loop = EventLoop {
            client: client.clone(),
            control_topic: topics.control.clone(),
            selector,
            shutdown: Arc::clone(&shutdown),
        };
        let handle = std::thread::Builder::new()
            .name("camfeed-mqtt".to_string())
            .spawn(move || event_loop.run(connection))
            .context("spawn MQTT event loop")?;

        log::info!(
            "MQTT client {} -> {}:{} (TLS: {}, auth: {})",
            settings.client_id,
            endpoint.host,
            endpoint.port,
            endpoint.use_tls,
            settings.username.is_some()
        );

        Ok(Self {
            client,
            topics,
            shutdown,
            event_loop: Some(handle),
        })
    }

    /// Frame publisher sharing this link's client.
    pub fn publisher(&self, jpeg_quality: u8) -> MqttPublisher {
        MqttPublisher {
            client: self.client.clone(),
            topics: self.topics.clone(),
            jpeg_quality,
        }
    }

    pub fn disconnect(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::Release);
        let result = self.client.disconnect().context("send MQTT disconnect");
        if let Some(handle) = self.event_loop.take() {
            let _ = handle.join();
        }
        result
    }
}

struct EventLoop {
    client: Client,
    control_topic: String,
    selector: Arc<OutputSelector>,
    shutdown: Arc<AtomicBool>,
}

impl EventLoop {
    fn run(self, mut connection: Connection) {
        for event in connection.iter() {
            match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    log::info!("MQTT connected; subscribing to {}", self.control_topic);
                    // Clean sessions drop subscriptions, so subscribe on every connect.
                    if let Err(err) = self
                        .client
                        .try_subscribe(self.control_topic.clone(), CONTROL_QOS)
                    {
                        log::warn!("MQTT subscribe to {} failed: {}", self.control_topic, err);
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    handle_control(
                        &publish.topic,
                        &publish.payload,
                        &self.control_topic,
                        &self.selector,
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    if self.shutdown.load(Ordering::Acquire) {
                        break;
                    }
                    log::warn!("MQTT connection error: {}; reconnecting", err);
                    if self.sleep_unless_shutdown(RECONNECT_DELAY) {
                        break;
                    }
                }
            }
        }
        log::debug!("MQTT event loop exited");
    }

    /// Returns true if shutdown was requested while sleeping.
    fn sleep_unless_shutdown(&self, total: Duration) -> bool {
        let mut slept = Duration::ZERO;
        while slept < total {
            if self.shutdown.load(Ordering::Acquire) {
                return true;
            }
            std::thread::sleep(SHUTDOWN_POLL);
            slept += SHUTDOWN_POLL;
        }
        self.shutdown.load(Ordering::Acquire)
    }
}

/// Apply a control message if `topic` is the control topic.
///
/// Returns true if the selector was updated. Malformed payloads are logged and
/// leave the selection unchanged.
fn handle_control(
    topic: &[u8],
    payload: &[u8],
    control_topic: &str,
    selector: &OutputSelector,
) -> bool {
    if topic != control_topic.as_bytes() {
        log::debug!(
            "ignoring message on unexpected topic {}",
            String::from_utf8_lossy(topic)
        );
        return false;
    }
    match ControlMessage::parse(payload) {
        Ok(msg) => {
            selector.apply(&msg);
            true
        }
        Err(err) => {
            log::warn!("ignoring control message: {:#}", err);
            false
        }
    }
}

/// Publishes composed frames as JPEG, QoS 0, not retained.
#[derive(Clone)]
pub struct MqttPublisher {
    client: Client,
    topics: ChannelTopics,
    jpeg_quality: u8,
}

impl FramePublisher for MqttPublisher {
    fn publish(&self, channel: Channel, frame: &ComposedFrame) -> Result<()> {
        let topic = self.topics.image(channel);
        let payload = frame.encode_jpeg(self.jpeg_quality)?;
        // Never block the tick thread; a full request queue drops the frame.
        self.client
            .try_publish(topic, IMAGE_QOS, false, payload)
            .with_context(|| format!("queue frame for {}", topic))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputSelection;

    const CONTROL: &str = "cameras/main_navigation/camera_control";

    #[test]
    fn control_message_updates_selection() {
        let selector = OutputSelector::default();
        let payload = br#"{"enable_large_broadcast": true, "enable_small_broadcast": true}"#;
        assert!(handle_control(CONTROL.as_bytes(), payload, CONTROL, &selector));
        assert_eq!(selector.snapshot(), OutputSelection::Both);

        let payload = br#"{"enable_large_broadcast": false, "enable_small_broadcast": false}"#;
        assert!(handle_control(CONTROL.as_bytes(), payload, CONTROL, &selector));
        assert_eq!(selector.snapshot(), OutputSelection::None);
    }

    #[test]
    fn malformed_control_message_is_ignored() {
        let selector = OutputSelector::new(OutputSelection::Large);
        assert!(!handle_control(CONTROL.as_bytes(), b"not json", CONTROL, &selector));
        assert!(!handle_control(
            CONTROL.as_bytes(),
            br#"{"enable_large_broadcast": "yes"}"#,
            CONTROL,
            &selector
        ));
        assert_eq!(selector.snapshot(), OutputSelection::Large);
    }

    #[test]
    fn other_topics_are_ignored() {
        let selector = OutputSelector::default();
        let payload = br#"{"enable_large_broadcast": true}"#;
        assert!(!handle_control(b"cameras/other/camera_control", payload, CONTROL, &selector));
        assert_eq!(selector.snapshot(), OutputSelection::Small);
    }

    #[test]
    fn control_and_images_are_fire_and_forget() {
        assert_eq!(CONTROL_QOS, QoS::AtMostOnce);
        assert_eq!(IMAGE_QOS, QoS::AtMostOnce);
    }

    #[test]
    fn remote_broker_requires_opt_in() {
        let settings = MqttSettings {
            broker_addr: "10.0.0.2:1883".to_string(),
            client_id: "camfeed-test".to_string(),
            username: None,
            password: None,
            use_tls: false,
            tls_ca_path: None,
            tls_client_cert_path: None,
            tls_client_key_path: None,
            allow_remote: false,
        };
        let topics = ChannelTopics::new(
            "cameras/main_navigation",
            &crate::frame::CanvasSpec::new(640, 360),
            &crate::frame::CanvasSpec::new(256, 144),
        );
        let err = MqttLink::connect(&settings, topics, Arc::new(OutputSelector::default()))
            .err()
            .expect("loopback check");
        assert!(err.to_string().contains("loopback"));
    }
}
