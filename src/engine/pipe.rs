//! Blocking byte pipe backing in-process stream connections.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use super::EngineError;

#[derive(Debug, Default)]
struct PipeState {
    buffer: VecDeque<u8>,
    /// Writer side shut; readers drain what is left, then see end of stream.
    write_closed: bool,
    /// Reader side shut; pending and future reads return end of stream.
    read_closed: bool,
}

/// One direction of a stream.
#[derive(Debug, Default)]
pub struct Pipe {
    state: Mutex<PipeState>,
    readable: Condvar,
}

impl Pipe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until bytes are available or the pipe is shut. Returns 0 at end of stream.
    pub fn read(&self, out: &mut [u8]) -> usize {
        if out.is_empty() {
            return 0;
        }
        let mut state = self.state.lock().expect("pipe mutex poisoned");
        loop {
            if state.read_closed {
                return 0;
            }
            if !state.buffer.is_empty() {
                let n = out.len().min(state.buffer.len());
                for (slot, byte) in out.iter_mut().zip(state.buffer.drain(..n)) {
                    *slot = byte;
                }
                return n;
            }
            if state.write_closed {
                return 0;
            }
            state = self.readable.wait(state).expect("pipe mutex poisoned");
        }
    }

    pub fn write(&self, data: &[u8]) -> Result<usize, EngineError> {
        let mut state = self.state.lock().expect("pipe mutex poisoned");
        if state.write_closed {
            return Err(EngineError::new("broken pipe"));
        }
        if state.read_closed {
            return Err(EngineError::new("connection reset by peer"));
        }
        state.buffer.extend(data);
        self.readable.notify_all();
        Ok(data.len())
    }

    pub fn close_write(&self) {
        let mut state = self.state.lock().expect("pipe mutex poisoned");
        state.write_closed = true;
        self.readable.notify_all();
    }

    pub fn close_read(&self) {
        let mut state = self.state.lock().expect("pipe mutex poisoned");
        state.read_closed = true;
        state.buffer.clear();
        self.readable.notify_all();
    }
}
