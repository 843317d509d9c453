//! Remote handles to broker-hosted buffers.
//!
//! [`BrokerClient`] is the handle factory every non-broker process uses: one
//! client per process, configured with the broker's address and credential.
//! Each [`BrokerHandle`] it produces owns a private authenticated connection,
//! so a handle parked on a blocking `pop` never stalls its siblings.

use log::debug;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::broker::protocol::{read_frame, write_frame, Request, Response};
use crate::buffer::BufferName;
use crate::envelope::Envelope;
use crate::error::{AppResult, HubError};

/// Factory for [`BrokerHandle`]s, one per consuming process.
pub struct BrokerClient {
    addr: String,
    credential: String,
    /// Control connection used for liveness probes.
    control: Mutex<TcpStream>,
}

impl BrokerClient {
    /// Connects and authenticates a control connection to the broker.
    pub async fn connect(addr: impl Into<String>, credential: impl Into<String>) -> AppResult<Self> {
        let addr = addr.into();
        let credential = credential.into();
        let control = authenticate(&addr, &credential).await?;
        debug!("Connected to buffer broker at {}", addr);
        Ok(Self {
            addr,
            credential,
            control: Mutex::new(control),
        })
    }

    /// Obtains a handle to one named buffer.
    ///
    /// The handle owns its own authenticated connection and is valid for the
    /// life of that connection.
    pub async fn get(&self, name: BufferName) -> AppResult<BrokerHandle> {
        let stream = authenticate(&self.addr, &self.credential).await?;
        debug!("Obtained handle to {}", name);
        Ok(BrokerHandle { name, stream })
    }

    /// Liveness probe over the control connection.
    ///
    /// This is the hook a supervisor would poll to decide when to rebuild the
    /// client after a dropped link; reconnection itself is the caller's
    /// responsibility.
    pub async fn health_check(&self) -> AppResult<()> {
        let mut control = self.control.lock().await;
        match call(&mut control, &Request::Ping).await? {
            Response::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

/// A capability bound to one named buffer on the broker.
///
/// Owned exclusively by the process that requested it; all operations go over
/// its private connection.
pub struct BrokerHandle {
    name: BufferName,
    stream: TcpStream,
}

impl BrokerHandle {
    pub fn name(&self) -> BufferName {
        self.name
    }

    /// Appends an envelope to the remote buffer.
    pub async fn push(&mut self, envelope: Envelope) -> AppResult<()> {
        let request = Request::Push {
            name: self.name,
            envelope,
        };
        match call(&mut self.stream, &request).await? {
            Response::Ok => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Removes and returns the remote buffer's head, waiting as long as it
    /// takes for an item to arrive.
    pub async fn pop(&mut self) -> AppResult<Envelope> {
        match call(&mut self.stream, &Request::Pop { name: self.name }).await? {
            Response::Item(envelope) => Ok(envelope),
            other => Err(unexpected(other)),
        }
    }

    /// Current depth of the remote buffer.
    pub async fn len(&mut self) -> AppResult<u64> {
        match call(&mut self.stream, &Request::Len { name: self.name }).await? {
            Response::Len(n) => Ok(n),
            other => Err(unexpected(other)),
        }
    }
}

/// Opens a connection and performs the auth handshake.
async fn authenticate(addr: &str, credential: &str) -> AppResult<TcpStream> {
    let mut stream = TcpStream::connect(addr).await?;
    let request = Request::Auth {
        credential: credential.to_string(),
    };
    match call(&mut stream, &request).await? {
        Response::Ok => Ok(stream),
        Response::Denied => Err(HubError::AuthenticationFailed),
        other => Err(unexpected(other)),
    }
}

/// One request/response exchange.
async fn call(stream: &mut TcpStream, request: &Request) -> AppResult<Response> {
    write_frame(stream, &request.encode()).await?;
    let body = read_frame(stream).await?.ok_or(HubError::ConnectionClosed)?;
    Response::decode(&body)
}

fn unexpected(response: Response) -> HubError {
    match response {
        Response::Denied => HubError::AuthenticationFailed,
        Response::Error(message) => HubError::Protocol(message),
        other => HubError::Protocol(format!("unexpected response: {other:?}")),
    }
}
