//! Single-producer/single-consumer hand-off between the radio event context
//! and the control loop.
//!
//! The radio callback owns the [`CommandSender`] and only appends; the loop
//! owns the [`CommandReceiver`] and only pops from the head. When the callback
//! outruns the loop the newest token is rejected: whatever is already queued
//! keeps its place and order.

use core::sync::atomic::{AtomicU32, Ordering};
use heapless::spsc::{Consumer, Producer, Queue};
use static_assertions::const_assert;
use thiserror::Error;

use crate::protocol::CommandToken;

/// Backing storage size; an spsc queue keeps one slot free.
pub const QUEUE_CAPACITY: usize = 16;
const_assert!(QUEUE_CAPACITY >= 2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("command queue full ({} pending)", QUEUE_CAPACITY - 1)]
pub struct QueueFull;

pub struct CommandQueue {
    inner: Queue<CommandToken, QUEUE_CAPACITY>,
    dropped: AtomicU32,
}

impl CommandQueue {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: Queue::new(),
            dropped: AtomicU32::new(0),
        }
    }

    pub fn split(&mut self) -> (CommandSender<'_>, CommandReceiver<'_>) {
        let (producer, consumer) = self.inner.split();
        (
            CommandSender {
                producer,
                dropped: &self.dropped,
            },
            CommandReceiver {
                consumer,
                dropped: &self.dropped,
            },
        )
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CommandSender<'a> {
    producer: Producer<'a, CommandToken, QUEUE_CAPACITY>,
    dropped: &'a AtomicU32,
}

impl CommandSender<'_> {
    /// # Errors
    ///
    /// [`QueueFull`] when every usable slot is taken. The token is discarded
    /// and counted as dropped.
    pub fn push(&mut self, token: CommandToken) -> Result<(), QueueFull> {
        self.producer.enqueue(token).map_err(|_rejected| {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            QueueFull
        })
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        !self.producer.ready()
    }
}

pub struct CommandReceiver<'a> {
    consumer: Consumer<'a, CommandToken, QUEUE_CAPACITY>,
    dropped: &'a AtomicU32,
}

impl CommandReceiver<'_> {
    pub fn pop(&mut self) -> Option<CommandToken> {
        self.consumer.dequeue()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.consumer.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.consumer.ready()
    }

    /// Tokens rejected by the sender because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }
}
