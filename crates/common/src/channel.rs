//! Command channel between caller threads and a device I/O thread
//!
//! Callers never block when posting: the channel is unbounded and every post
//! pokes a wake hook so the I/O thread leaves its reap wait and drains the
//! queue. Once the I/O thread is done it closes the channel, after which posts
//! hand the command back to the caller.

use async_channel::{Receiver, Sender, unbounded};
use std::sync::Arc;

/// Hook that interrupts the I/O thread's blocking wait
pub type WakeFn = Arc<dyn Fn() + Send + Sync>;

/// Posting side, cloned freely across caller threads
pub struct CommandSender<C> {
    tx: Sender<C>,
    wake: WakeFn,
}

impl<C> Clone for CommandSender<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            wake: self.wake.clone(),
        }
    }
}

impl<C> CommandSender<C> {
    /// Queue a command and wake the receiver
    ///
    /// Returns the command if the receiving side has shut down.
    pub fn post(&self, cmd: C) -> std::result::Result<(), C> {
        match self.tx.try_send(cmd) {
            Ok(()) => {
                (self.wake)();
                Ok(())
            }
            Err(e) => Err(e.into_inner()),
        }
    }

    /// Whether the receiver has closed the channel
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving side, owned by the I/O thread
pub struct CommandReceiver<C> {
    rx: Receiver<C>,
}

impl<C> CommandReceiver<C> {
    /// Try to receive a command without blocking
    pub fn try_recv(&self) -> Option<C> {
        self.rx.try_recv().ok()
    }

    /// Receive a command (blocking)
    pub fn recv_blocking(&self) -> crate::Result<C> {
        self.rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Number of queued commands
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Close the channel and hand back everything still queued
    ///
    /// Posts racing with this call either land in the returned batch or are
    /// rejected back to their sender; none are lost.
    pub fn close_and_drain(&self) -> Vec<C> {
        self.rx.close();
        let mut remaining = Vec::new();
        while let Ok(cmd) = self.rx.try_recv() {
            remaining.push(cmd);
        }
        remaining
    }
}

/// Create the command channel
///
/// Returns (CommandSender for callers, CommandReceiver for the I/O thread)
pub fn command_channel<C>(wake: WakeFn) -> (CommandSender<C>, CommandReceiver<C>) {
    let (tx, rx) = unbounded();
    (CommandSender { tx, wake }, CommandReceiver { rx })
}
