//! Ingestion front-ends: the MQTT subscription client and the raw-socket
//! frame server. Both feed the broker-hosted RX buffers.

pub mod mqtt;
pub mod raw;

pub use mqtt::{ConnectionState, LinkStatus, SubscriptionIngestor};
pub use raw::RawFrameServer;
