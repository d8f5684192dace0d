//! Transport buffers - the inbound and outbound regions exchanged with the
//! DMA engine.
//!
//! A buffer's memory lives in exactly one place at a time: inside its
//! [`TransportBuffer`] while idle or complete, or inside a [`BufferHandle`]
//! while armed. Arming moves the memory out, completion moves it back.

use log::{debug, warn};

use crate::error::TransportError;
use crate::hal::Direction;

pub const DEFAULT_BUFFER_SIZE: usize = 0x400; // 1024 bytes

/// DMA channels count transfers in a 16-bit register.
pub const MAX_DMA_LENGTH: usize = u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Idle,
    ArmedForReceive,
    ArmedForTransmit,
    Complete,
}

/// Exclusive ownership of an armed buffer's memory.
#[derive(Debug)]
pub struct BufferHandle {
    direction: Direction,
    memory: Box<[u8]>,
    len: usize,
}

impl BufferHandle {
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Length of the armed transfer
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.memory[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.memory[..self.len]
    }
}

#[derive(Debug)]
pub struct TransportBuffer {
    direction: Direction,
    capacity: usize,
    storage: Option<Box<[u8]>>,
    len: usize,
    state: BufferState,
}

impl TransportBuffer {
    pub fn new(direction: Direction, capacity: usize) -> Self {
        TransportBuffer {
            direction,
            capacity,
            storage: Some(vec![0u8; capacity].into_boxed_slice()),
            len: 0,
            state: BufferState::Idle,
        }
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn armed_state(&self) -> BufferState {
        match self.direction {
            Direction::Receive => BufferState::ArmedForReceive,
            Direction::Transmit => BufferState::ArmedForTransmit,
        }
    }

    fn arm(&mut self, len: usize) -> Result<BufferHandle, TransportError> {
        if self.state == self.armed_state() {
            return Err(TransportError::BufferBusy(self.direction));
        }
        if len == 0 || len > self.capacity {
            return Err(TransportError::Configuration(format!(
                "{} length {} outside 1..={}",
                self.direction, len, self.capacity
            )));
        }
        let memory = self
            .storage
            .take()
            .ok_or(TransportError::BufferBusy(self.direction))?;
        self.len = len;
        self.state = self.armed_state();
        debug!("{} buffer armed for {} bytes", self.direction, len);
        Ok(BufferHandle {
            direction: self.direction,
            memory,
            len,
        })
    }

    fn complete(&mut self, handle: BufferHandle) -> Result<(), TransportError> {
        if self.state != self.armed_state() {
            return Err(TransportError::Configuration(format!(
                "{} buffer released while {:?}",
                self.direction, self.state
            )));
        }
        self.len = handle.len;
        self.storage = Some(handle.memory);
        self.state = BufferState::Complete;
        Ok(())
    }

    /// Completed contents; `None` unless the buffer is complete.
    pub fn contents(&self) -> Option<&[u8]> {
        match (self.state, &self.storage) {
            (BufferState::Complete, Some(memory)) => Some(&memory[..self.len]),
            _ => None,
        }
    }

    /// Return to idle, dropping any contents. Memory lost with an aborted
    /// transfer is reallocated.
    pub fn reset(&mut self) {
        if self.storage.is_none() {
            warn!("{} buffer memory was not returned; reallocating", self.direction);
        }
        let capacity = self.capacity;
        let memory = self
            .storage
            .get_or_insert_with(|| vec![0u8; capacity].into_boxed_slice());
        memory.iter_mut().for_each(|b| *b = 0);
        self.len = 0;
        self.state = BufferState::Idle;
    }
}

/// The inbound/outbound pair used by the transport.
#[derive(Debug)]
pub struct TransportBuffers {
    rx: TransportBuffer,
    tx: TransportBuffer,
}

impl TransportBuffers {
    pub fn new(capacity: usize) -> Self {
        TransportBuffers {
            rx: TransportBuffer::new(Direction::Receive, capacity),
            tx: TransportBuffer::new(Direction::Transmit, capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }

    pub fn buffer(&self, direction: Direction) -> &TransportBuffer {
        match direction {
            Direction::Receive => &self.rx,
            Direction::Transmit => &self.tx,
        }
    }

    fn buffer_mut(&mut self, direction: Direction) -> &mut TransportBuffer {
        match direction {
            Direction::Receive => &mut self.rx,
            Direction::Transmit => &mut self.tx,
        }
    }

    /// Copy `bytes` into the outbound buffer and arm it.
    pub fn acquire_for_transmit(&mut self, bytes: &[u8]) -> Result<BufferHandle, TransportError> {
        let mut handle = self.tx.arm(bytes.len())?;
        handle.as_mut_slice().copy_from_slice(bytes);
        Ok(handle)
    }

    pub fn acquire_for_receive(&mut self, capacity: usize) -> Result<BufferHandle, TransportError> {
        self.rx.arm(capacity)
    }

    /// Take back an armed buffer once its transfer has finished.
    pub fn release_on_complete(&mut self, handle: BufferHandle) -> Result<(), TransportError> {
        self.buffer_mut(handle.direction()).complete(handle)
    }

    pub fn contents(&self, direction: Direction) -> Option<&[u8]> {
        self.buffer(direction).contents()
    }

    /// Copy out a completed inbound frame and recycle the buffer.
    pub fn take_received(&mut self) -> Option<Vec<u8>> {
        let frame = self.rx.contents()?.to_vec();
        self.rx.reset();
        Some(frame)
    }

    pub fn reset(&mut self, direction: Direction) {
        self.buffer_mut(direction).reset();
    }

    pub fn reset_all(&mut self) {
        self.rx.reset();
        self.tx.reset();
    }
}
