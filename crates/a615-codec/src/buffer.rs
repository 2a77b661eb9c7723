//! Process-wide buffer that accumulates the DATA blocks of an incoming LUR.
//!
//! Capacity is fixed at construction. Appends check capacity and copy under
//! one lock; readers get a copy so no caller holds the lock while parsing.

use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{ArincError, Result};
use crate::lur::MAX_LUR_SIZE;

pub struct AccumulationBuffer {
    data: Mutex<BytesMut>,
    capacity: usize,
    claimed: AtomicBool,
}

impl AccumulationBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Mutex::new(BytesMut::with_capacity(capacity)),
            capacity,
            claimed: AtomicBool::new(false),
        }
    }

    /// Buffer sized for the largest LUR.
    pub fn for_lur() -> Self {
        Self::new(MAX_LUR_SIZE)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reset(&self) {
        self.lock().clear();
    }

    /// Appends `chunk`, or fails with `BufferFull` leaving the contents as
    /// they were.
    pub fn append(&self, chunk: &[u8]) -> Result<()> {
        let mut data = self.lock();
        let available = self.capacity - data.len();
        if chunk.len() > available {
            return Err(ArincError::BufferFull {
                requested: chunk.len(),
                available,
                capacity: self.capacity,
            });
        }
        data.extend_from_slice(chunk);
        Ok(())
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.lock())
    }

    /// Takes exclusive use of the buffer for one write transfer.
    ///
    /// Returns `None` while another claim is alive. A successful claim starts
    /// from an empty buffer; dropping the claim releases it.
    pub fn try_claim(self: &Arc<Self>) -> Option<BufferClaim> {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        self.reset();
        Some(BufferClaim {
            buffer: Arc::clone(self),
        })
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    fn lock(&self) -> MutexGuard<'_, BytesMut> {
        // A panic while holding the lock cannot leave the bytes inconsistent.
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for AccumulationBuffer {
    fn default() -> Self {
        Self::for_lur()
    }
}

/// Exclusive write access to an `AccumulationBuffer`.
pub struct BufferClaim {
    buffer: Arc<AccumulationBuffer>,
}

impl BufferClaim {
    pub fn append(&self, chunk: &[u8]) -> Result<()> {
        self.buffer.append(chunk)
    }

    pub fn snapshot(&self) -> Bytes {
        self.buffer.snapshot()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Drop for BufferClaim {
    fn drop(&mut self) {
        self.buffer.claimed.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for BufferClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferClaim")
            .field("len", &self.len())
            .field("capacity", &self.buffer.capacity)
            .finish()
    }
}
