//! Cross-process buffer broker: wire protocol, server, and client handles.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{BrokerClient, BrokerHandle};
pub use server::{BufferBroker, BufferRegistry};
