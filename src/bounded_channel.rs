// SPDX-License-Identifier: Apache-2.0

//! Bounded blocking channels used between agent threads.
//!
//! Every consumer in this crate runs on a dedicated OS thread, so only the
//! blocking surface is exposed. A capacity of zero gives a rendezvous
//! channel: the sender blocks until a receiver takes the item, which is how
//! clean signals are handed to the manager's dispatcher.

use std::fmt;
use std::time::Duration;

use flume::{Receiver, Sender};

pub struct BoundedSender<T> {
    tx: Sender<T>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    Disconnected,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Disconnected => write!(f, "channel disconnected"),
        }
    }
}

impl<T> BoundedSender<T> {
    /// Blocks until there is capacity (or a receiver, for rendezvous
    /// channels).
    pub fn send(&self, item: T) -> Result<(), SendError> {
        self.tx.send(item).map_err(|_| SendError::Disconnected)
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

impl<T> Clone for BoundedSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

#[derive(Clone)]
pub struct BoundedReceiver<T> {
    rx: Receiver<T>,
}

impl<T> BoundedReceiver<T> {
    /// Blocks until an item is available. Returns `None` once every sender
    /// has been dropped.
    pub fn recv(&self) -> Option<T> {
        self.rx.recv().ok()
    }

    /// Returns immediately; `None` when nothing is queued or the channel is
    /// disconnected.
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Blocks until an item is available or the timeout expires.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// True once every sender has been dropped.
    pub fn is_disconnected(&self) -> bool {
        self.rx.is_disconnected()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

pub fn bounded<T>(size: usize) -> (BoundedSender<T>, BoundedReceiver<T>) {
    let (tx, rx) = flume::bounded::<T>(size);
    (BoundedSender { tx }, BoundedReceiver { rx })
}
