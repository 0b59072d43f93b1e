//! Bounded, thread-safe event queue with backpressure (spec §4.1).
//!
//! `push` is non-blocking and O(1): the lock is held only across a vector
//! append and a counter update, never across the flush-signal callback or
//! any allocation beyond the item itself. Load shedding is preferred over
//! latency inflation — see the soft/hard cap policy below.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::event::BufferItem;

/// Result of a `Buffer::push` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    Dropped,
}

struct Inner {
    items: Vec<BufferItem>,
    current_bytes: usize,
}

type FlushSignal = Arc<dyn Fn() + Send + Sync>;

/// The single shared owner of the live event list.
pub struct Buffer {
    inner: Mutex<Inner>,
    /// Soft ceiling; hard cap is `3 * max_bytes`.
    max_bytes: usize,
    dropped_events: AtomicU64,
    flush_signal: RwLock<Option<FlushSignal>>,
}

impl Buffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: Vec::new(),
                current_bytes: 0,
            }),
            max_bytes,
            dropped_events: AtomicU64::new(0),
            flush_signal: RwLock::new(None),
        }
    }

    /// Installs a hook invoked (outside the buffer's lock) whenever a push
    /// crosses the soft cap. The Flusher uses this to schedule an emergency
    /// cycle.
    pub fn set_flush_signal<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.flush_signal.write() = Some(Arc::new(f));
    }

    /// Non-blocking, O(1) push. Accepts unconditionally under the soft cap;
    /// above it, still accepts up to the 3x hard cap (to absorb bursts that
    /// routinely precede a normal flush) and signals the flusher; beyond the
    /// hard cap, drops and increments `dropped_events`.
    pub fn push(&self, item: BufferItem) -> PushOutcome {
        let bytes = item.estimated_bytes();

        let (accepted, crossed_soft_cap) = {
            let mut inner = self.inner.lock();
            let projected = inner.current_bytes + bytes;
            if projected <= self.max_bytes {
                inner.items.push(item);
                inner.current_bytes = projected;
                (true, false)
            } else if projected < self.max_bytes * 3 {
                inner.items.push(item);
                inner.current_bytes = projected;
                (true, true)
            } else {
                (false, true)
            }
        };

        if crossed_soft_cap {
            if let Some(hook) = self.flush_signal.read().as_ref() {
                hook();
            }
        }

        if accepted {
            PushOutcome::Accepted
        } else {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
            PushOutcome::Dropped
        }
    }

    /// Atomically swaps out the internal slice and resets the byte counter.
    pub fn drain(&self) -> Vec<BufferItem> {
        let mut inner = self.inner.lock();
        inner.current_bytes = 0;
        std::mem::take(&mut inner.items)
    }

    /// Drops everything currently buffered without returning it (used on
    /// final shutdown after the drained events have already been handed off).
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.items.clear();
        inner.current_bytes = 0;
    }

    pub fn size(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn current_bytes(&self) -> usize {
        self.inner.lock().current_bytes
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Re-queues previously drained items, respecting the same hard cap as
    /// `push` (used by the Flusher's single re-queue-on-failure path,
    /// spec §4.6/§4.7).
    pub fn requeue(&self, items: Vec<BufferItem>) -> usize {
        let mut inner = self.inner.lock();
        let mut accepted = 0;
        for item in items {
            let bytes = item.estimated_bytes();
            let projected = inner.current_bytes + bytes;
            if projected < self.max_bytes * 3 {
                inner.items.push(item);
                inner.current_bytes = projected;
                accepted += 1;
            } else {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
            }
        }
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::CustomEvent;
    use chrono::Utc;

    fn sized_event(bytes_target: &str) -> BufferItem {
        BufferItem::Custom(CustomEvent {
            name: bytes_target.to_string(),
            payload: None,
            recorded_at: Utc::now(),
        })
    }

    #[test]
    fn accepts_under_soft_cap() {
        let buf = Buffer::new(10_000);
        for _ in 0..5 {
            assert_eq!(buf.push(sized_event("x")), PushOutcome::Accepted);
        }
        assert_eq!(buf.size(), 5);
    }

    #[test]
    fn hard_cap_drops_and_counts() {
        // Size the soft cap for exactly ~10 events (each CustomEvent with a
        // 1-byte name costs `HEADER + name.len()` = 65 bytes).
        let per_event = sized_event("x").estimated_bytes();
        let buf = Buffer::new(per_event * 10);

        let mut accepted = 0;
        let mut dropped = 0;
        for _ in 0..40 {
            match buf.push(sized_event("x")) {
                PushOutcome::Accepted => accepted += 1,
                PushOutcome::Dropped => dropped += 1,
            }
        }

        assert!(accepted >= 10 && accepted <= 30, "accepted={accepted}");
        assert!(dropped > 0);
        assert!(buf.dropped_events() >= 1);
    }

    #[test]
    fn drain_resets_bytes_and_is_atomic() {
        let buf = Buffer::new(10_000);
        buf.push(sized_event("a"));
        buf.push(sized_event("b"));
        let drained = buf.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(buf.size(), 0);
        assert_eq!(buf.current_bytes(), 0);
    }

    #[test]
    fn flush_signal_fires_on_soft_cap_crossing() {
        use std::sync::atomic::AtomicBool;
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        let per_event = sized_event("x").estimated_bytes();
        let buf = Buffer::new(per_event);
        buf.set_flush_signal(move || fired2.store(true, Ordering::SeqCst));
        buf.push(sized_event("a"));
        buf.push(sized_event("b"));
        assert!(fired.load(Ordering::SeqCst));
    }
}
