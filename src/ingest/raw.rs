//! Raw-socket frame server.
//!
//! Sensors that do not speak MQTT send heartbeat and echo frames over bare
//! TCP. The server accepts connections continuously, one task per connection.
//! Each read of up to [`MAX_FRAME_BYTES`] is treated as one complete frame,
//! an explicit simplification, not a length-prefixed protocol; frames that
//! span reads are future work.
//!
//! Connection tasks push decoded frames onto a local bounded queue; a single
//! forwarding loop drains that queue into the RawRx buffer through a
//! [`BrokerHandle`]. Shutdown is best-effort for in-flight connections, but
//! frames already queued are drained before the forwarding loop returns.

use std::net::SocketAddr;

use log::{debug, error, info, warn};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::broker::BrokerHandle;
use crate::buffer::BufferCategory;
use crate::envelope::Envelope;
use crate::error::AppResult;
use crate::shutdown::{triggered, Shutdown};

/// One read of up to this many bytes is one frame.
pub const MAX_FRAME_BYTES: usize = 1024;

/// Threaded (task-per-connection) TCP listener feeding the RawRx buffer.
pub struct RawFrameServer {
    listener: TcpListener,
    frames_tx: mpsc::Sender<Envelope>,
    frames_rx: mpsc::Receiver<Envelope>,
    shutdown: Shutdown,
}

impl RawFrameServer {
    /// Binds the listener.
    ///
    /// Failure to bind aborts startup; there is no fallback address.
    pub async fn bind(addr: &str, queue_depth: usize) -> AppResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Raw frame server listening on {}", addr);
        let (frames_tx, frames_rx) = mpsc::channel(queue_depth.max(1));
        Ok(Self {
            listener,
            frames_tx,
            frames_rx,
            shutdown: Shutdown::new(),
        })
    }

    /// The actual bound address; useful when binding port 0.
    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Trigger that makes `run()` return; clone it before calling `run`.
    pub fn shutdown_signal(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Starts the accept loop in the background and becomes the forwarding
    /// loop, pushing every queued frame into the RawRx buffer.
    ///
    /// Returns once the shutdown signal fires and the local queue is drained;
    /// the accept task is joined before returning.
    pub async fn run(mut self, mut rx_handle: BrokerHandle) -> AppResult<()> {
        let listener = self.listener;
        let frames_tx = self.frames_tx;
        let mut accept_shutdown = self.shutdown.subscribe();
        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = triggered(&mut accept_shutdown) => break,
                    accepted = listener.accept() => match accepted {
                        Ok((socket, peer)) => {
                            let frames_tx = frames_tx.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, peer, frames_tx).await {
                                    warn!("Raw connection {} error: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => error!("Accept error: {}", e),
                    }
                }
            }
            debug!("Raw accept loop stopped");
        });

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = triggered(&mut shutdown_rx) => break,
                frame = self.frames_rx.recv() => match frame {
                    Some(envelope) => forward(&mut rx_handle, envelope).await,
                    None => break,
                },
            }
        }

        // Frames already accepted must not be dropped mid-shutdown.
        while let Ok(envelope) = self.frames_rx.try_recv() {
            forward(&mut rx_handle, envelope).await;
        }

        let _ = accept_task.await;
        info!("Raw frame server stopped");
        Ok(())
    }
}

async fn forward(rx_handle: &mut BrokerHandle, envelope: Envelope) {
    let origin = envelope.origin.clone();
    match rx_handle.push(envelope).await {
        Ok(()) => info!("Forwarded raw frame from {} into {}", origin, rx_handle.name()),
        Err(e) => error!("Failed to forward raw frame from {}: {}", origin, e),
    }
}

/// Reads frames from one connection until the peer closes it.
async fn handle_connection(
    mut socket: TcpStream,
    peer: SocketAddr,
    frames_tx: mpsc::Sender<Envelope>,
) -> AppResult<()> {
    debug!("Raw connection from {}", peer);
    let mut buf = vec![0u8; MAX_FRAME_BYTES];
    loop {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            debug!("Raw connection {} closed", peer);
            return Ok(());
        }
        let envelope = Envelope::new(BufferCategory::Raw, peer.to_string(), buf[..n].to_vec());
        // Bounded queue: a slow forwarder backpressures the connection task
        // here rather than growing memory.
        if frames_tx.send(envelope).await.is_err() {
            // Forwarding loop is gone; the server is shutting down.
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn one_read_is_one_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (frames_tx, mut frames_rx) = mpsc::channel(8);

        let server = tokio::spawn(async move {
            let (socket, peer) = listener.accept().await.unwrap();
            handle_connection(socket, peer, frames_tx).await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"heartbeat:sensor-7").await.unwrap();
        client.flush().await.unwrap();

        let envelope = frames_rx.recv().await.unwrap();
        assert_eq!(envelope.category, BufferCategory::Raw);
        assert_eq!(envelope.payload, b"heartbeat:sensor-7");
        assert!(envelope.origin.starts_with("127.0.0.1:"));

        drop(client);
        server.await.unwrap();
        // Clean close, no residual frames.
        assert!(frames_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn oversized_writes_are_split_at_frame_size() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (frames_tx, mut frames_rx) = mpsc::channel(8);

        tokio::spawn(async move {
            let (socket, peer) = listener.accept().await.unwrap();
            let _ = handle_connection(socket, peer, frames_tx).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&vec![0xAB; MAX_FRAME_BYTES + 100]).await.unwrap();
        client.flush().await.unwrap();
        drop(client);

        let first = frames_rx.recv().await.unwrap();
        assert!(first.payload.len() <= MAX_FRAME_BYTES);
        let mut total = first.payload.len();
        while let Some(envelope) = frames_rx.recv().await {
            assert!(envelope.payload.len() <= MAX_FRAME_BYTES);
            total += envelope.payload.len();
        }
        assert_eq!(total, MAX_FRAME_BYTES + 100);
    }
}
