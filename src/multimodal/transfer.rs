//! Remote-memory reads of externally staged embedding tensors.
//!
//! The connector's wire protocol and completion detection live outside this
//! crate; this module only defines how a worker drives one read and makes
//! sure a handle is never read twice.

use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use thiserror::Error;
use tracing::debug;

use crate::io_struct::{TensorDtype, TransferHandle};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("remote side aborted the read: {0}")]
    Aborted(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("read did not complete within {0:?}")]
    Timeout(Duration),
    #[error("handle '{0}' was already consumed")]
    InvalidHandle(String),
    #[error("cannot allocate a {dtype:?} buffer of shape {shape:?}")]
    Unallocatable { shape: Vec<usize>, dtype: TensorDtype },
}

/// Locally allocated destination for one remote read.
pub struct Descriptor {
    shape: Vec<usize>,
    dtype: TensorDtype,
    data: Vec<u8>,
}

impl Descriptor {
    /// Allocate a zero-filled buffer sized for `shape` elements of `dtype`.
    pub fn zeroed(shape: &[usize], dtype: TensorDtype) -> Result<Self, TransferError> {
        let len = dtype
            .byte_len(shape)
            .ok_or_else(|| TransferError::Unallocatable {
                shape: shape.to_vec(),
                dtype,
            })?;
        Ok(Descriptor {
            shape: shape.to_vec(),
            dtype,
            data: vec![0; len],
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> TensorDtype {
        self.dtype
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_parts(self) -> (Vec<usize>, TensorDtype, Vec<u8>) {
        (self.shape, self.dtype, self.data)
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// A read that has been issued but not yet completed.
#[async_trait]
pub trait ReadOperation: Send {
    /// Suspend until the data is resident and hand the buffer back.
    async fn wait_for_completion(self: Box<Self>) -> Result<Descriptor, TransferError>;
}

/// Shared per-worker connection to the remote-memory transport.
#[async_trait]
pub trait RemoteMemoryConnector: Send + Sync {
    /// Issue a read of `handle` into `destination`. The connector owns the
    /// buffer until the returned operation completes.
    async fn begin_read(
        &self,
        handle: &TransferHandle,
        destination: Descriptor,
    ) -> Result<Box<dyn ReadOperation>, TransferError>;
}

/// Upper bound on the time between sweeps of expired handles.
const MAX_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Remembers consumed handles so a second read of the same handle fails.
pub struct HandleLedger {
    consumed: DashMap<TransferHandle, Instant>,
    retention: Duration,
    prune_interval: Duration,
    next_prune: Mutex<Instant>,
}

impl HandleLedger {
    pub fn new(retention: Duration) -> Self {
        let prune_interval = retention.min(MAX_PRUNE_INTERVAL);
        HandleLedger {
            consumed: DashMap::new(),
            retention,
            prune_interval,
            next_prune: Mutex::new(Instant::now() + prune_interval),
        }
    }

    /// Mark `handle` as consumed. Fails if it was claimed within the
    /// retention window, whether or not that earlier read succeeded.
    pub fn claim(&self, handle: &TransferHandle) -> Result<(), TransferError> {
        let now = Instant::now();
        self.maybe_prune(now);
        match self.consumed.entry(handle.clone()) {
            Entry::Occupied(mut slot) => {
                if now.duration_since(*slot.get()) < self.retention {
                    return Err(TransferError::InvalidHandle(handle.as_str().to_string()));
                }
                slot.insert(now);
                Ok(())
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                Ok(())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.consumed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumed.is_empty()
    }

    /// Sweep at most once per interval; a claim that loses the race skips it.
    fn maybe_prune(&self, now: Instant) {
        let Ok(mut next_prune) = self.next_prune.try_lock() else {
            return;
        };
        if now < *next_prune {
            return;
        }
        *next_prune = now + self.prune_interval;
        drop(next_prune);
        self.prune(now);
    }

    fn prune(&self, now: Instant) {
        let before = self.consumed.len();
        self.consumed
            .retain(|_, claimed_at| now.duration_since(*claimed_at) < self.retention);
        let pruned = before.saturating_sub(self.consumed.len());
        if pruned > 0 {
            debug!("Pruned {} expired transfer handles", pruned);
        }
    }
}
