//! Blocking FIFO buffers shared across the hub.
//!
//! A [`NamedBuffer`] is the only resource shared between the hub's processes.
//! In-process it is a mutex-guarded `VecDeque` paired with a semaphore that
//! counts available items, so `pop` suspends the calling task (never the
//! process) until a producer delivers. Across processes it is only reachable
//! through a `BrokerHandle` proxy handed out by the broker.
//!
//! # Ordering
//!
//! Within one buffer, the FIFO order of successful pushes is preserved as
//! observed by the buffer itself: each producer's own push order survives into
//! pop order. No ordering is guaranteed *between* producers, and none between
//! independent buffers.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

/// Which transport a buffer (or envelope) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferCategory {
    /// MQTT publish/subscribe origin.
    Pubsub,
    /// Raw TCP frame origin.
    Raw,
}

impl BufferCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            BufferCategory::Pubsub => "MQTT",
            BufferCategory::Raw => "RAW",
        }
    }
}

impl std::fmt::Display for BufferCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The fixed set of buffers the broker registers at startup.
///
/// The registry is enum-keyed: every buffer the broker will ever serve is
/// named here, resolved at startup rather than registered dynamically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BufferName {
    MqttRx = 0,
    MqttTx = 1,
    RawRx = 2,
    RawTx = 3,
}

impl BufferName {
    pub const ALL: [BufferName; 4] = [
        BufferName::MqttRx,
        BufferName::MqttTx,
        BufferName::RawRx,
        BufferName::RawTx,
    ];

    /// The accessor name as it appears on the wire and in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            BufferName::MqttRx => "MqttRxBuffer",
            BufferName::MqttTx => "MqttTxBuffer",
            BufferName::RawRx => "RawRxBuffer",
            BufferName::RawTx => "RawTxBuffer",
        }
    }

    pub fn wire_id(&self) -> u8 {
        *self as u8
    }

    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(BufferName::MqttRx),
            1 => Some(BufferName::MqttTx),
            2 => Some(BufferName::RawRx),
            3 => Some(BufferName::RawTx),
            _ => None,
        }
    }

    pub fn category(&self) -> BufferCategory {
        match self {
            BufferName::MqttRx | BufferName::MqttTx => BufferCategory::Pubsub,
            BufferName::RawRx | BufferName::RawTx => BufferCategory::Raw,
        }
    }
}

impl std::fmt::Display for BufferName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

struct Inner<T> {
    items: Mutex<VecDeque<T>>,
    /// Counts items currently in `items`; `pop` acquires one permit per item.
    available: Semaphore,
    /// Free capacity for bounded buffers; `None` means unbounded.
    slots: Option<Semaphore>,
}

/// A named, blocking FIFO channel.
///
/// Cloning a `NamedBuffer` clones the handle, not the queue: all clones
/// observe the same items. Safe for arbitrarily many concurrent producers and
/// consumers. None of the operations fail once the buffer is constructed.
#[derive(Clone)]
pub struct NamedBuffer<T> {
    name: String,
    category: BufferCategory,
    inner: Arc<Inner<T>>,
}

impl<T> NamedBuffer<T> {
    /// Creates an unbounded buffer: `push` never blocks.
    pub fn new(name: impl Into<String>, category: BufferCategory) -> Self {
        Self {
            name: name.into(),
            category,
            inner: Arc::new(Inner {
                items: Mutex::new(VecDeque::new()),
                available: Semaphore::new(0),
                slots: None,
            }),
        }
    }

    /// Creates a bounded buffer: `push` blocks once `capacity` items are
    /// queued, until a consumer pops.
    pub fn bounded(name: impl Into<String>, category: BufferCategory, capacity: usize) -> Self {
        Self {
            name: name.into(),
            category,
            inner: Arc::new(Inner {
                items: Mutex::new(VecDeque::with_capacity(capacity)),
                available: Semaphore::new(0),
                slots: Some(Semaphore::new(capacity)),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> BufferCategory {
        self.category
    }

    /// Appends an item at the tail.
    ///
    /// Unbounded buffers return immediately; bounded buffers suspend the
    /// caller until a slot frees up.
    pub async fn push(&self, item: T) {
        if let Some(slots) = &self.inner.slots {
            // Neither semaphore is ever closed for the life of the buffer.
            #[allow(clippy::expect_used)]
            let permit = slots
                .acquire()
                .await
                .expect("buffer capacity semaphore closed");
            permit.forget();
        }
        self.inner.items.lock().push_back(item);
        self.inner.available.add_permits(1);
    }

    /// Removes and returns the head, suspending the caller until an item is
    /// available. First pushed is first returned.
    pub async fn pop(&self) -> T {
        // The item semaphore is never closed, and a permit is only ever added
        // together with a queued item.
        #[allow(clippy::expect_used)]
        let permit = self
            .inner
            .available
            .acquire()
            .await
            .expect("buffer item semaphore closed");
        permit.forget();
        #[allow(clippy::expect_used)]
        let item = self
            .inner
            .items
            .lock()
            .pop_front()
            .expect("item semaphore permit without a queued item");
        if let Some(slots) = &self.inner.slots {
            slots.add_permits(1);
        }
        item
    }

    /// Current depth, without blocking.
    pub fn len(&self) -> usize {
        self.inner.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> std::fmt::Debug for NamedBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedBuffer")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("len", &self.len())
            .finish()
    }
}
