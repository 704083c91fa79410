//! Transport seam between the agent and whatever carries commands.
//!
//! The agent never knows whether a command came over a serial line, a socket
//! or a test harness. It polls, responds and broadcasts through [`Transport`].

use crate::protocol::{CommandBuffer, MAX_COMMAND_SIZE};
use heapless::spsc::Queue;
use std::collections::VecDeque;
use thiserror::Error;

/// Inbound slots of a [`LoopbackTransport`]; one slot is kept free by the queue.
pub const LOOPBACK_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("command exceeds {} bytes", MAX_COMMAND_SIZE)]
    TooLarge,
    #[error("inbound queue full")]
    QueueFull,
}

pub trait Transport {
    /// Next pending command line, if any. Must not block.
    fn poll_command(&mut self) -> Option<String>;

    /// Reply to the command most recently returned by `poll_command`.
    fn respond(&mut self, response: &str);

    /// Unsolicited message for every subscriber.
    fn broadcast(&mut self, message: &str);

    /// Connection housekeeping, called once per tick before any command.
    fn maintain(&mut self, _now: u32) {}
}

/// In-memory transport for tests and embedding.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    inbound: Queue<CommandBuffer, LOOPBACK_DEPTH>,
    responses: VecDeque<String>,
    broadcasts: Vec<String>,
    last_maintained: Option<u32>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_command(&mut self, text: &str) -> Result<(), TransportError> {
        let mut slot = CommandBuffer::new();
        slot.push_str(text).map_err(|()| TransportError::TooLarge)?;
        self.inbound.enqueue(slot).map_err(|_| TransportError::QueueFull)
    }

    pub fn pending(&self) -> usize {
        self.inbound.len()
    }

    pub fn take_response(&mut self) -> Option<String> {
        self.responses.pop_front()
    }

    pub fn responses(&self) -> impl Iterator<Item = &str> {
        self.responses.iter().map(String::as_str)
    }

    pub fn broadcasts(&self) -> &[String] {
        &self.broadcasts
    }

    pub fn clear_broadcasts(&mut self) {
        self.broadcasts.clear();
    }

    pub fn last_maintained(&self) -> Option<u32> {
        self.last_maintained
    }
}

impl Transport for LoopbackTransport {
    fn poll_command(&mut self) -> Option<String> {
        self.inbound.dequeue().map(|slot| slot.as_str().to_string())
    }

    fn respond(&mut self, response: &str) {
        self.responses.push_back(response.to_string());
    }

    fn broadcast(&mut self, message: &str) {
        self.broadcasts.push(message.to_string());
    }

    fn maintain(&mut self, now: u32) {
        self.last_maintained = Some(now);
    }
}
