//! The buffer broker: owner of the shared buffers.
//!
//! The broker is the single source of truth for the four named buffers. It is
//! constructed exactly once at process startup and its [`BufferRegistry`] is
//! passed by handle to anything in-process that needs it; there is no global
//! lookup. Remote processes reach the buffers through authenticated TCP
//! connections speaking the [`protocol`](super::protocol) frame format.
//!
//! Every authenticated connection operates on the same underlying buffers:
//! a push from one client is observed by a pop from any other.

use std::net::SocketAddr;

use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};

use crate::broker::protocol::{read_frame, write_frame, Request, Response};
use crate::buffer::{BufferName, NamedBuffer};
use crate::envelope::Envelope;
use crate::error::AppResult;

/// The fixed set of named buffers, created once at broker startup.
///
/// Cloning the registry clones handles to the same buffers. The registry is
/// enum-keyed: [`BufferName`] enumerates every buffer the broker serves, so
/// lookup can never miss.
#[derive(Clone, Debug)]
pub struct BufferRegistry {
    mqtt_rx: NamedBuffer<Envelope>,
    mqtt_tx: NamedBuffer<Envelope>,
    raw_rx: NamedBuffer<Envelope>,
    raw_tx: NamedBuffer<Envelope>,
}

impl BufferRegistry {
    pub fn new() -> Self {
        let build = |name: BufferName| NamedBuffer::new(name.as_str(), name.category());
        Self {
            mqtt_rx: build(BufferName::MqttRx),
            mqtt_tx: build(BufferName::MqttTx),
            raw_rx: build(BufferName::RawRx),
            raw_tx: build(BufferName::RawTx),
        }
    }

    /// Resolves a buffer name to its one underlying buffer.
    pub fn get(&self, name: BufferName) -> &NamedBuffer<Envelope> {
        match name {
            BufferName::MqttRx => &self.mqtt_rx,
            BufferName::MqttTx => &self.mqtt_tx,
            BufferName::RawRx => &self.raw_rx,
            BufferName::RawTx => &self.raw_tx,
        }
    }
}

impl Default for BufferRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// TCP server exposing the registry to other processes.
pub struct BufferBroker {
    listener: TcpListener,
    credential: String,
    registry: BufferRegistry,
}

impl BufferBroker {
    /// Binds the broker's listening address.
    ///
    /// Failure to bind is fatal to broker startup; there is no fallback
    /// address.
    pub async fn bind(
        addr: &str,
        credential: impl Into<String>,
        registry: BufferRegistry,
    ) -> AppResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Buffer broker listening on {}", addr);
        Ok(Self {
            listener,
            credential: credential.into(),
            registry,
        })
    }

    /// The actual bound address; useful when binding port 0.
    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until the process exits.
    ///
    /// Each connection runs on its own task; a misbehaving peer only ever
    /// kills its own connection, never the broker.
    pub async fn serve(self) -> AppResult<()> {
        loop {
            match self.listener.accept().await {
                Ok((socket, addr)) => {
                    let credential = self.credential.clone();
                    let registry = self.registry.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(socket, addr, credential, registry).await
                        {
                            warn!("Client {} error: {}", addr, e);
                        }
                    });
                }
                Err(e) => error!("Accept error: {}", e),
            }
        }
    }
}

async fn handle_connection(
    mut socket: TcpStream,
    addr: SocketAddr,
    credential: String,
    registry: BufferRegistry,
) -> AppResult<()> {
    debug!("Client connected: {}", addr);

    // The first frame must authenticate; anything else closes the connection.
    let Some(body) = read_frame(&mut socket).await? else {
        return Ok(());
    };
    match Request::decode(&body) {
        Ok(Request::Auth { credential: offered }) if offered == credential => {
            write_frame(&mut socket, &Response::Ok.encode()).await?;
        }
        Ok(Request::Auth { .. }) => {
            warn!("Client {} presented a bad credential", addr);
            write_frame(&mut socket, &Response::Denied.encode()).await?;
            return Ok(());
        }
        Ok(_) | Err(_) => {
            write_frame(
                &mut socket,
                &Response::Error("expected auth frame".to_string()).encode(),
            )
            .await?;
            return Ok(());
        }
    }

    loop {
        let Some(body) = read_frame(&mut socket).await? else {
            debug!("Client {} disconnected", addr);
            return Ok(());
        };
        let response = match Request::decode(&body) {
            Ok(request) => process_request(request, &registry).await,
            // Unknown buffer or malformed frame is the peer's problem, not
            // the broker's: report and keep serving.
            Err(e) => Response::Error(e.to_string()),
        };
        write_frame(&mut socket, &response.encode()).await?;
    }
}

async fn process_request(request: Request, registry: &BufferRegistry) -> Response {
    match request {
        Request::Push { name, envelope } => {
            registry.get(name).push(envelope).await;
            Response::Ok
        }
        Request::Pop { name } => {
            // Blocks this connection's task until an item arrives. Other
            // connections keep their own tasks.
            let envelope = registry.get(name).pop().await;
            Response::Item(envelope)
        }
        Request::Len { name } => Response::Len(registry.get(name).len() as u64),
        Request::Ping => Response::Pong,
        // Re-authenticating an already authenticated connection is harmless.
        Request::Auth { .. } => Response::Ok,
    }
}
