// SPDX-License-Identifier: Apache-2.0

//! Bounded channels connecting the sync and async halves of the crate.
//!
//! The platform notifier calls back on its own thread while the target's
//! run loop is a tokio task, so the sender side must work from plain
//! threads and the receiver side from async code. flume supports both on
//! one channel; this wrapper narrows it to the operations the crate uses:
//! a non-blocking `try_send` (callers layer their own backoff on top) and
//! an awaited `send` for the sender, an awaited `next` and a deadline-bound
//! `recv_timeout` for the receiver.

use std::fmt;
use std::time::Duration;

/// The receiving half is gone; the message was not delivered.
#[derive(Debug, PartialEq, Eq)]
pub struct Disconnected;

impl fmt::Display for Disconnected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("receiver dropped")
    }
}

/// Outcome of a non-blocking send attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum TrySendError {
    Full,
    Disconnected,
}

impl fmt::Display for TrySendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full => f.write_str("channel at capacity"),
            TrySendError::Disconnected => f.write_str("receiver dropped"),
        }
    }
}

pub struct BoundedSender<T>(flume::Sender<T>);

pub struct BoundedReceiver<T>(flume::Receiver<T>);

/// Create a channel holding at most `capacity` in-flight messages.
pub fn bounded<T>(capacity: usize) -> (BoundedSender<T>, BoundedReceiver<T>) {
    let (tx, rx) = flume::bounded(capacity);
    (BoundedSender(tx), BoundedReceiver(rx))
}

impl<T> BoundedSender<T> {
    /// Deliver `item`, waiting for capacity if the channel is full.
    pub async fn send(&self, item: T) -> Result<(), Disconnected> {
        self.0.send_async(item).await.map_err(|_| Disconnected)
    }

    /// Deliver `item` only if there is room right now. Usable from
    /// non-async contexts; a `Full` result leaves retry policy to the
    /// caller.
    pub fn try_send(&self, item: T) -> Result<(), TrySendError> {
        match self.0.try_send(item) {
            Ok(()) => Ok(()),
            Err(flume::TrySendError::Full(_)) => Err(TrySendError::Full),
            Err(flume::TrySendError::Disconnected(_)) => Err(TrySendError::Disconnected),
        }
    }
}

impl<T> Clone for BoundedSender<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> BoundedReceiver<T> {
    /// Await the next message. Yields `None` once every sender is gone and
    /// the channel has drained.
    pub async fn next(&mut self) -> Option<T> {
        self.0.recv_async().await.ok()
    }

    /// Block for up to `timeout` waiting for a message. For callers off
    /// the runtime; `None` covers both an expired deadline and a closed
    /// channel.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        self.0.recv_timeout(timeout).ok()
    }
}

impl<T> Clone for BoundedReceiver<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}
