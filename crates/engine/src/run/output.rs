//! Per-run output stream: a bounded buffer for polling plus a broadcast
//! channel for live subscribers.

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};

use tokio::sync::broadcast;

#[derive(Debug)]
struct OutputBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

/// Output written by `print_msg`, command echoes and legacy `print` calls.
///
/// Writers never block: when the buffer is full the oldest line is dropped,
/// and subscribers that fall behind lose lines instead of stalling the run.
#[derive(Debug)]
pub struct OutputStream {
    buffer: Mutex<OutputBuffer>,
    sender: broadcast::Sender<String>,
}

impl OutputStream {
    pub fn new(capacity: usize, stream_capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(stream_capacity.max(1));
        Self {
            buffer: Mutex::new(OutputBuffer {
                lines: VecDeque::with_capacity(capacity.min(1024)),
                capacity,
            }),
            sender,
        }
    }

    fn lock(&self) -> MutexGuard<'_, OutputBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a line and forwards it to live subscribers.
    pub fn push(&self, line: impl Into<String>) {
        let line = line.into();
        {
            let mut buffer = self.lock();
            if buffer.lines.len() >= buffer.capacity {
                buffer.lines.pop_front();
            }
            buffer.lines.push_back(line.clone());
        }
        // No subscribers is not an error.
        let _ = self.sender.send(line);
    }

    /// Every retained line, oldest first.
    pub fn lines(&self) -> Vec<String> {
        self.lock().lines.iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.lock().lines.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().lines.is_empty()
    }

    /// A receiver for lines pushed after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_buffer_drops_oldest_line() {
        let stream = OutputStream::new(2, 8);
        for line in ["a", "b", "c"] {
            stream.push(line);
        }
        assert_eq!(stream.lines(), vec!["b", "c"]);
        assert_eq!(stream.len(), 2);
    }

    #[test]
    fn clear_keeps_subscribers_attached() {
        let stream = OutputStream::new(4, 4);
        let mut receiver = stream.subscribe();
        stream.push("one");
        stream.clear();
        stream.push("two");
        assert!(stream.lines() == vec!["two"]);
        assert_eq!(receiver.try_recv().expect("first"), "one");
        assert_eq!(receiver.try_recv().expect("second"), "two");
    }

    #[test]
    fn slow_subscribers_lag_instead_of_blocking() {
        let stream = OutputStream::new(100, 2);
        let mut receiver = stream.subscribe();
        for index in 0..10 {
            stream.push(format!("line {index}"));
        }
        assert!(matches!(receiver.try_recv(), Err(broadcast::error::TryRecvError::Lagged(_))));
        assert_eq!(stream.len(), 10);
    }
}
