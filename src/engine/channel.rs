//! Request channel between front ends and the engine.
//!
//! A blocking multi-producer/single-consumer queue with an explicit
//! close: once closed, writes fail with [`Error::Terminated`], while the
//! reader drains whatever was written before the close and then gets a
//! defined end-of-stream result (`None`) forever.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::core::request::RequestInput;
use crate::error::{Error, Result};

enum Message {
    Request(Box<RequestInput>),
    Shutdown,
}

/// Closable blocking queue of admitted requests.
///
/// Shared by `Arc`: producers call [`write`](Self::write) from any thread;
/// exactly one consumer (the engine's ingestion thread) calls
/// [`read`](Self::read).
pub struct RequestChannel {
    tx: Sender<Message>,
    rx: Receiver<Message>,
    closed: AtomicBool,
    drained: AtomicBool,
}

impl RequestChannel {
    /// Create an open channel.
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            closed: AtomicBool::new(false),
            drained: AtomicBool::new(false),
        }
    }

    /// Enqueue a request. Non-blocking.
    ///
    /// # Errors
    ///
    /// [`Error::Terminated`] once the channel is closed.
    pub fn write(&self, input: RequestInput) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Terminated);
        }
        self.tx
            .send(Message::Request(Box::new(input)))
            .map_err(|_| Error::Terminated)
    }

    /// Blocking read of the next request.
    ///
    /// Returns `None` once the channel is closed and every request written
    /// before the close has been delivered; every later call returns
    /// `None` immediately.
    pub fn read(&self) -> Option<RequestInput> {
        if self.drained.load(Ordering::Acquire) {
            return None;
        }
        match self.rx.recv() {
            Ok(Message::Request(input)) => Some(*input),
            Ok(Message::Shutdown) | Err(_) => {
                self.drained.store(true, Ordering::Release);
                None
            }
        }
    }

    /// Close the channel. Idempotent; wakes a blocked reader.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(Message::Shutdown);
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for RequestChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::config::SamplingConfig;
    use crate::core::waiter::Waiter;

    fn input(req_id: u64) -> RequestInput {
        RequestInput {
            req_id,
            model_name: "m".to_string(),
            token_sequences: vec![vec![1, 2]],
            sampling_configs: vec![SamplingConfig::default()],
            waiter: Arc::new(Waiter::new()),
        }
    }

    #[test]
    fn test_write_read_order() {
        let channel = RequestChannel::new();
        channel.write(input(1)).unwrap();
        channel.write(input(2)).unwrap();
        assert_eq!(channel.read().unwrap().req_id, 1);
        assert_eq!(channel.read().unwrap().req_id, 2);
    }

    #[test]
    fn test_read_blocks_until_write() {
        let channel = Arc::new(RequestChannel::new());
        let producer = {
            let channel = channel.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                channel.write(input(9)).unwrap();
            })
        };
        assert_eq!(channel.read().unwrap().req_id, 9);
        producer.join().unwrap();
    }

    #[test]
    fn test_close_drains_then_ends() {
        let channel = RequestChannel::new();
        channel.write(input(1)).unwrap();
        channel.close();
        // Request written before close is still delivered.
        assert_eq!(channel.read().unwrap().req_id, 1);
        // Then end-of-stream, idempotently.
        assert!(channel.read().is_none());
        assert!(channel.read().is_none());
    }

    #[test]
    fn test_write_after_close_fails() {
        let channel = RequestChannel::new();
        channel.close();
        assert!(matches!(channel.write(input(1)), Err(Error::Terminated)));
        assert!(channel.is_closed());
    }

    #[test]
    fn test_close_unblocks_reader() {
        let channel = Arc::new(RequestChannel::new());
        let reader = {
            let channel = channel.clone();
            thread::spawn(move || channel.read())
        };
        thread::sleep(Duration::from_millis(20));
        channel.close();
        assert!(reader.join().unwrap().is_none());
    }
}
