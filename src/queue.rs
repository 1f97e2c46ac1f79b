//! Keyed concurrent queue.
//!
//! One structure multiplexes many logical FIFO channels, each identified
//! by a key. Channels are created on first reference and persist for the
//! life of the queue. Each channel is locked independently, so traffic on
//! distinct keys never contends on a shared lock; `close` is a
//! whole-structure operation.
//!
//! # Example
//!
//! ```
//! use proofwire::queue::MultiQueue;
//!
//! # tokio_test::block_on(async {
//! let queue: MultiQueue<&str, i32> = MultiQueue::new();
//! queue.send(&"replies", 1).unwrap();
//! assert_eq!(queue.request(&"replies").await.unwrap(), 1);
//! queue.close();
//! assert!(queue.send(&"replies", 2).is_err());
//! # });
//! ```

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::error::{ProofwireError, Result};

/// One logical channel: queued values when senders lead, parked
/// requesters when receivers lead, never both.
struct ChannelState<V> {
    values: VecDeque<V>,
    waiters: VecDeque<oneshot::Sender<V>>,
    closed: bool,
}

impl<V> Default for ChannelState<V> {
    fn default() -> Self {
        Self {
            values: VecDeque::new(),
            waiters: VecDeque::new(),
            closed: false,
        }
    }
}

/// A keyed concurrent queue with blocking receive and explicit close.
pub struct MultiQueue<K, V> {
    channels: DashMap<K, Arc<Mutex<ChannelState<V>>>>,
    closed: AtomicBool,
}

impl<K, V> MultiQueue<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create an open queue with no channels.
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Send a value on a key's channel.
    ///
    /// If a requester is blocked on the channel, the value is handed to
    /// the longest-waiting one; otherwise it is queued in FIFO order.
    ///
    /// # Errors
    ///
    /// [`ProofwireError::QueueClosed`] once the queue has been closed.
    pub fn send(&self, key: &K, value: V) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProofwireError::QueueClosed);
        }
        let channel = self.channel(key);
        let mut channel = lock(&channel);
        // Re-checked under the channel lock: close() marks every channel
        // it can see, and any channel it cannot see yet was inserted by an
        // operation that observes the global flag here.
        if channel.closed || self.closed.load(Ordering::SeqCst) {
            return Err(ProofwireError::QueueClosed);
        }

        let mut value = value;
        while let Some(waiter) = channel.waiters.pop_front() {
            match waiter.send(value) {
                Ok(()) => return Ok(()),
                // The requester gave up before delivery; it must not
                // consume the value. Try the next one.
                Err(returned) => value = returned,
            }
        }
        channel.values.push_back(value);
        Ok(())
    }

    /// Receive the next value on a key's channel, blocking the caller
    /// until one is sent or the queue closes.
    ///
    /// # Errors
    ///
    /// [`ProofwireError::QueueClosed`] if the queue is already closed, or
    /// closes while this call is waiting.
    pub async fn request(&self, key: &K) -> Result<V> {
        let receiver = {
            if self.closed.load(Ordering::SeqCst) {
                return Err(ProofwireError::QueueClosed);
            }
            let channel = self.channel(key);
            let mut channel = lock(&channel);
            if channel.closed || self.closed.load(Ordering::SeqCst) {
                return Err(ProofwireError::QueueClosed);
            }
            if let Some(value) = channel.values.pop_front() {
                return Ok(value);
            }
            let (tx, rx) = oneshot::channel();
            channel.waiters.push_back(tx);
            rx
        };
        // Close drops the sender, which wakes us with an error.
        receiver.await.map_err(|_| ProofwireError::QueueClosed)
    }

    /// Close the whole queue. Idempotent.
    ///
    /// Every blocked `request` wakes with [`ProofwireError::QueueClosed`],
    /// and every subsequent `send`/`request` on any key fails immediately.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for entry in self.channels.iter() {
            let mut channel = lock(entry.value());
            channel.closed = true;
            // Dropping the senders wakes every parked requester.
            channel.waiters.clear();
        }
    }

    /// Whether the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of values queued (not yet requested) on a key's channel.
    pub fn queued_len(&self, key: &K) -> usize {
        self.channels
            .get(key)
            .map(|ch| lock(ch.value()).values.len())
            .unwrap_or(0)
    }

    /// Get or create the channel for a key. The `Arc` is cloned out so no
    /// map shard lock is held while the channel itself is locked.
    fn channel(&self, key: &K) -> Arc<Mutex<ChannelState<V>>> {
        self.channels.entry(key.clone()).or_default().clone()
    }
}

impl<K, V> Default for MultiQueue<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

fn lock<V>(channel: &Mutex<ChannelState<V>>) -> MutexGuard<'_, ChannelState<V>> {
    channel.lock().expect("channel lock poisoned")
}
