//! MQTT transport.
//!
//! `endpoint` parses broker addresses and picks plain TCP or TLS. `mqtt` owns
//! the connection, applies inbound camera control messages and publishes
//! composed frames as JPEG.

mod endpoint;
mod mqtt;

pub use endpoint::{
    build_transport, parse_mqtt_endpoint, validate_loopback_addr, MqttEndpoint, TlsMaterials,
};
pub use mqtt::{MqttLink, MqttPublisher};
