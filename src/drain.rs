//! Persistence drain worker.
//!
//! The drain worker is the single consumer of an RX buffer: it blocks on the
//! buffer's pop and hands every envelope to the storage collaborator's
//! `append`. In production the buffer is remote and reached through a
//! [`BrokerHandle`]; tests drain an in-process [`NamedBuffer`] directly.
//!
//! Stop strategy: a cancellable wait, not a poison pill. The run loop selects
//! between the blocking pop and the shutdown signal, so `kill()` takes effect
//! at the next loop boundary even while the pop is parked on an empty buffer.
//! An envelope whose pop already completed is always appended before the loop
//! exits.

use async_trait::async_trait;
use log::{error, info};

use crate::broker::BrokerHandle;
use crate::buffer::NamedBuffer;
use crate::envelope::Envelope;
use crate::error::AppResult;
use crate::shutdown::{triggered, Shutdown};
use crate::storage::QueueStore;

/// Anything the drain worker can pop envelopes from.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> AppResult<Envelope>;
}

#[async_trait]
impl FrameSource for BrokerHandle {
    async fn next_frame(&mut self) -> AppResult<Envelope> {
        self.pop().await
    }
}

#[async_trait]
impl FrameSource for NamedBuffer<Envelope> {
    async fn next_frame(&mut self) -> AppResult<Envelope> {
        Ok(self.pop().await)
    }
}

/// Forwards envelopes from a frame source into a [`QueueStore`].
pub struct DrainWorker {
    shutdown: Shutdown,
}

impl DrainWorker {
    pub fn new() -> Self {
        Self {
            shutdown: Shutdown::new(),
        }
    }

    /// Trigger that makes `run()` return; clone it before calling `run`.
    pub fn shutdown_signal(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Asks the run loop to stop at its next iteration boundary.
    pub fn kill(&self) {
        self.shutdown.trigger();
    }

    /// Drains `source` into `store` until killed.
    ///
    /// Append failures are logged and the loop continues; a failed append
    /// must not wedge ingestion for every later envelope. A frame source
    /// failure is fatal for the drain and is returned to the caller, so a
    /// lost broker connection is distinguishable from a clean `kill()`.
    pub async fn run<S, Q>(&self, mut source: S, store: &Q) -> AppResult<()>
    where
        S: FrameSource,
        Q: QueueStore + ?Sized,
    {
        info!("Drain worker running");
        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = triggered(&mut shutdown_rx) => break,
                frame = source.next_frame() => match frame {
                    Ok(envelope) => {
                        match store
                            .append(envelope.category.as_str(), &envelope.payload)
                            .await
                        {
                            Ok(count) => info!(
                                "Stored {} envelope from {} ({} total)",
                                envelope.category, envelope.origin, count
                            ),
                            Err(e) => error!("Storage append failed: {e}"),
                        }
                    }
                    Err(e) => {
                        error!("Frame source failed: {e}");
                        return Err(e);
                    }
                },
            }
        }
        info!("Drain worker stopped");
        Ok(())
    }
}

impl Default for DrainWorker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferCategory;
    use crate::storage::MemoryStore;
    use std::time::Duration;

    #[tokio::test]
    async fn drains_preloaded_buffer_in_fifo_order() {
        let buffer = NamedBuffer::new("RawRxBuffer", BufferCategory::Raw);
        buffer
            .push(Envelope::new(BufferCategory::Raw, "a", b"payloadA".to_vec()))
            .await;
        buffer
            .push(Envelope::new(BufferCategory::Pubsub, "b", b"payloadB".to_vec()))
            .await;

        let store = std::sync::Arc::new(MemoryStore::new());
        let worker = DrainWorker::new();
        let kill = worker.shutdown_signal();

        let task = {
            let buffer = buffer.clone();
            let store = store.clone();
            tokio::spawn(async move { worker.run(buffer, store.as_ref()).await })
        };

        // Wait until both items were appended.
        tokio::time::timeout(Duration::from_secs(2), async {
            while store.count().await < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        kill.trigger();
        task.await.unwrap().unwrap();

        // Exactly two appends, FIFO order, monotonically counted.
        assert_eq!(store.count().await, 2);
        let first = store.consume().await.unwrap().unwrap();
        assert_eq!(first.category, "RAW");
        assert_eq!(first.payload, b"payloadA");
        let second = store.consume().await.unwrap().unwrap();
        assert_eq!(second.category, "MQTT");
        assert_eq!(second.payload, b"payloadB");
        assert!(buffer.is_empty());
    }

    struct FailingSource;

    #[async_trait]
    impl FrameSource for FailingSource {
        async fn next_frame(&mut self) -> AppResult<Envelope> {
            Err(crate::error::HubError::ConnectionClosed)
        }
    }

    #[tokio::test]
    async fn source_failure_surfaces_from_run() {
        let store = MemoryStore::new();
        let worker = DrainWorker::new();
        let result = worker.run(FailingSource, &store).await;
        assert!(matches!(
            result,
            Err(crate::error::HubError::ConnectionClosed)
        ));
        assert_eq!(store.count().await, 0);
    }

    #[tokio::test]
    async fn kill_interrupts_a_parked_pop() {
        let buffer: NamedBuffer<Envelope> = NamedBuffer::new("RawRxBuffer", BufferCategory::Raw);
        let store = MemoryStore::new();
        let worker = DrainWorker::new();
        let kill = worker.shutdown_signal();

        let task = tokio::spawn(async move { worker.run(buffer, &store).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());
        kill.trigger();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
