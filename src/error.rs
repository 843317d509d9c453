//! Custom error types for the application.
//!
//! This module defines the primary error type, `HubError`, for the entire
//! application. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of errors that can occur,
//! from I/O and configuration issues to protocol violations on the broker
//! wire format.
//!
//! ## Error Categories
//!
//! - **Configuration errors** (`Config`) occur during startup and are
//!   permanent: fix the configuration file and restart.
//! - **Transport errors** (`Io`, `MqttClient`, `MqttConnection`) are surfaced
//!   to the caller; retry policy is the caller's responsibility, nothing in
//!   this crate retries internally.
//! - **Precondition violations** (`InvalidTransition`, `LinkDown`,
//!   `DisconnectUnconfirmed`) report an operation attempted out of lifecycle
//!   order. They never change state and are never fatal.
//! - **Protocol errors** (`Protocol`, `UnknownBuffer`, `AuthenticationFailed`,
//!   `ConnectionClosed`) cover misbehaving broker peers. The broker closes the
//!   offending connection and keeps serving others.
//!
//! By using `#[from]`, `HubError` can be seamlessly created from underlying
//! error types, simplifying error handling throughout the application with
//! the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, HubError>;

/// Primary error type for the telemetry hub.
#[derive(Error, Debug)]
pub enum HubError {
    /// Configuration loading or parsing error.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// I/O error from file or network operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Error issuing a request to the MQTT client (subscribe, disconnect, ...).
    #[error("MQTT client error: {0}")]
    MqttClient(#[from] rumqttc::ClientError),

    /// Error from the MQTT network event loop.
    #[error("MQTT connection error: {0}")]
    MqttConnection(#[from] rumqttc::ConnectionError),

    /// A lifecycle method was called out of order. State is unchanged.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    /// The MQTT link is not connected, so the requested phase cannot proceed.
    #[error("MQTT link is down")]
    LinkDown,

    /// Teardown was requested but the disconnect acknowledgement never
    /// arrived; the caller should retry `stop()`.
    #[error("Disconnect not acknowledged; link still alive")]
    DisconnectUnconfirmed,

    /// The broker rejected this connection's credential.
    #[error("Broker authentication failed")]
    AuthenticationFailed,

    /// A request named a buffer the broker does not register.
    #[error("Unknown buffer id: {0}")]
    UnknownBuffer(u8),

    /// Malformed or unexpected data on the broker wire protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The remote peer closed the connection mid-exchange.
    #[error("Broker connection closed")]
    ConnectionClosed,

    /// Error reported by a storage collaborator.
    #[error("Storage error: {0}")]
    Storage(String),
}
