//! # sensorhub
//!
//! Telemetry ingestion hub for distributed sensor nodes. Sensors report over
//! two transports, MQTT topics and raw TCP heartbeat/echo frames, and both
//! streams funnel into a fixed set of named FIFO buffers owned by a broker
//! process. Other processes (ingestors, drain workers) reach those buffers
//! through authenticated remote handles, so everyone observes the same
//! logical queues without shared memory.
//!
//! ## Processes
//!
//! One binary, one subcommand per role:
//!
//! - `broker`: owns the [`broker::BufferRegistry`] and serves remote handles
//!   over TCP (`sensorhub broker`).
//! - `mqtt`: the [`ingest::SubscriptionIngestor`], a state-machined MQTT
//!   client forwarding messages into the MqttRx buffer.
//! - `raw`: the [`ingest::RawFrameServer`], a task-per-connection TCP
//!   listener forwarding 1024-byte frames into the RawRx buffer.
//! - `drain`: the [`drain::DrainWorker`], popping an RX buffer and appending
//!   each envelope to a [`storage::QueueStore`] collaborator.
//!
//! ## Data flow
//!
//! ```text
//! sensor -> (MQTT broker | raw TCP) -> ingestor -> NamedBuffer -> drain -> storage
//! ```
//!
//! Everything blocks cooperatively: buffer pops suspend the calling task,
//! loops check their shutdown signal once per iteration, and nothing is
//! cancelled mid-item.

pub mod broker;
pub mod buffer;
pub mod config;
pub mod drain;
pub mod envelope;
pub mod error;
pub mod ingest;
pub mod shutdown;
pub mod storage;

pub use broker::{BrokerClient, BrokerHandle, BufferBroker, BufferRegistry};
pub use buffer::{BufferCategory, BufferName, NamedBuffer};
pub use envelope::Envelope;
pub use error::{AppResult, HubError};
