use std::collections::VecDeque;

use tracing::debug;

/// Size of a FIFO command or response frame.
pub const FRAME_LEN: usize = 16;
/// Responses held for the guest before further ones are dropped.
pub const RESPONSE_CAPACITY: usize = 16;

pub type Frame = [u8; FRAME_LEN];

/// Accumulates bytes written to the FIFO-in message register into 16-byte command frames.
///
/// There is no notion of word boundaries: bytes are appended in write order, and a frame is
/// complete as soon as 16 bytes have arrived. A short or extra write shifts the framing of
/// everything after it.
#[derive(Debug, Default, Clone)]
pub struct FifoBuffer {
    data: Frame,
    cursor: usize,
}

impl FifoBuffer {
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Append `bytes`, calling `dispatch` once for every frame that fills up.
    pub fn push(&mut self, bytes: &[u8], mut dispatch: impl FnMut(&Frame)) {
        for &byte in bytes {
            self.data[self.cursor] = byte;
            self.cursor += 1;
            if self.cursor == FRAME_LEN {
                dispatch(&self.data);
                self.reset();
            }
        }
    }

    /// Take the partially filled frame (zero padded). Returns `None` when nothing has been
    /// written since the last frame.
    pub fn flush(&mut self) -> Option<Frame> {
        if self.cursor == 0 {
            return None;
        }
        let frame = self.data;
        self.reset();
        Some(frame)
    }

    fn reset(&mut self) {
        self.data = [0; FRAME_LEN];
        self.cursor = 0;
    }
}

/// Responses waiting to be read through the FIFO-out message register, oldest first.
#[derive(Debug, Default, Clone)]
pub struct ResponseQueue {
    frames: VecDeque<Frame>,
    read_pos: usize,
}

impl ResponseQueue {
    /// Queue a response. Returns `false` and drops `frame` when the queue is full.
    pub fn push(&mut self, frame: Frame) -> bool {
        if self.frames.len() >= RESPONSE_CAPACITY {
            debug!(command = frame[0], "SMC response queue full, dropping response");
            return false;
        }
        self.frames.push_back(frame);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Next byte of the current response, or 0 once it has been fully read.
    pub fn read_byte(&mut self) -> u8 {
        let Some(frame) = self.frames.front() else {
            return 0;
        };
        match frame.get(self.read_pos) {
            Some(&byte) => {
                self.read_pos += 1;
                byte
            }
            None => 0,
        }
    }

    pub fn rewind(&mut self) {
        self.read_pos = 0;
    }

    /// Drop the current response if the guest has started reading it.
    pub fn discard_current(&mut self) {
        if self.read_pos == 0 {
            return;
        }
        self.frames.pop_front();
        self.read_pos = 0;
    }
}
