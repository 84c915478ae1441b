//! # Store
//!
//! This module covers reference slots: address-stable storage for the one
//! callable a proxy forwards to

use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::callable::Callable;

/// Errors when reading a reference slot
#[derive(Debug, Error)]
pub enum StoreError {
    /// The slot was read before anything was written to it
    #[error("no callable has been published to this slot")]
    Empty,
}

/// An address-stable slot holding at most one callable reference.
///
/// The slot is the rendezvous point between a generated proxy and whatever is
/// currently "the effective original": native dispatch reads it on every call
/// while another thread may be overwriting it. Publication is one aligned
/// pointer-sized atomic store, and every callable ever written stays anchored
/// for the slot's lifetime, so a reader can never observe a freed value.
pub struct ReferenceSlot {
    /// Currently published callable; null until the first write
    cell: AtomicPtr<Callable>,
    /// Every callable ever written, pinned against reclamation.
    /// Append-only while the slot is alive.
    anchors: Mutex<Vec<Arc<Callable>>>,
}

impl ReferenceSlot {
    /// Reserves a new slot, optionally initialized to `initial`.
    ///
    /// The returned `Arc` keeps the slot's address stable for the lifetime of
    /// the allocation; native code may hold raw references into it.
    pub fn allocate(initial: Option<Arc<Callable>>) -> Arc<Self> {
        let slot = Arc::new(Self {
            cell: AtomicPtr::new(std::ptr::null_mut()),
            anchors: Mutex::new(Vec::new()),
        });
        if let Some(callable) = initial {
            slot.write(callable);
        }
        slot
    }

    /// Atomically replaces the slot's contents.
    ///
    /// The callable is anchored before it becomes visible, so concurrent
    /// readers mid-dispatch observe either the old or the new value, fully
    /// constructed.
    pub fn write(&self, callable: Arc<Callable>) {
        let raw = Arc::as_ptr(&callable) as *mut Callable;
        self.anchors.lock().unwrap().push(callable);
        self.cell.store(raw, Ordering::SeqCst);
    }

    /// Returns the currently published callable
    pub fn read(&self) -> Result<Arc<Callable>, StoreError> {
        let raw = self.cell.load(Ordering::Acquire);
        if raw.is_null() {
            return Err(StoreError::Empty);
        }
        // The anchor list holds a strong count for every pointer ever
        // published, so the allocation behind `raw` is still live
        unsafe {
            Arc::increment_strong_count(raw);
            Ok(Arc::from_raw(raw))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    use crate::callable::{Callable, Value};
    use crate::sig::{CallableType, Signature, TypeDesc};

    use super::{ReferenceSlot, StoreError};

    /// A zero-argument callable returning a constant
    fn constant(value: i32) -> Arc<Callable> {
        let ty = CallableType::of(Signature::new(vec![], TypeDesc::I32));
        Arc::new(Callable::new(ty, move |_| Ok(Value::I32(value))))
    }

    #[test]
    /// Reading an empty slot fails rather than defaulting
    fn test_read_empty() {
        let slot = ReferenceSlot::allocate(None);
        assert!(matches!(slot.read(), Err(StoreError::Empty)));
    }

    #[test]
    /// Writes overwrite; reads observe the latest value
    fn test_write_read() {
        let slot = ReferenceSlot::allocate(Some(constant(1)));
        assert_eq!(slot.read().unwrap().invoke(&[]).unwrap(), Value::I32(1));

        slot.write(constant(2));
        assert_eq!(slot.read().unwrap().invoke(&[]).unwrap(), Value::I32(2));
    }

    #[test]
    /// Concurrent readers observe either the old or the new callable, never
    /// a torn or freed one
    fn test_concurrent_overwrite() {
        let slot = ReferenceSlot::allocate(Some(constant(1)));
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let slot = slot.clone();
                let done = done.clone();
                thread::spawn(move || {
                    while !done.load(Ordering::Relaxed) {
                        let value = slot.read().unwrap().invoke(&[]).unwrap();
                        assert!(matches!(value, Value::I32(1) | Value::I32(2)));
                    }
                })
            })
            .collect();

        for _ in 0..1000 {
            slot.write(constant(2));
            slot.write(constant(1));
        }
        done.store(true, Ordering::Relaxed);

        for reader in readers {
            reader.join().unwrap();
        }
    }
}
