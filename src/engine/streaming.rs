//! Streaming result delivery.
//!
//! A [`StreamingIterator`] is a blocking cursor over one request's
//! generated tokens. It coordinates with the request's waiter: the
//! scheduling loop notifies after every appended token and on terminal
//! transitions, so the iterator never blocks past termination.

use std::sync::Arc;

use crate::core::request::RequestId;
use crate::core::waiter::Waiter;
use crate::scheduler::batch_manager::RequestHandle;

/// Blocking pull cursor over a request's generated continuation.
///
/// Streams only generated tokens, never the input. After the final token
/// has been delivered once, every further call returns `None`.
///
/// Streaming consumers use single-branch requests; the iterator follows
/// branch 0.
pub struct StreamingIterator {
    request: RequestHandle,
    waiter: Arc<Waiter>,
    cursor: usize,
}

impl StreamingIterator {
    /// Create an iterator positioned before the first generated token.
    pub fn new(request: RequestHandle, waiter: Arc<Waiter>) -> Self {
        Self { request, waiter, cursor: 0 }
    }

    /// Request this iterator follows.
    pub fn req_id(&self) -> RequestId {
        self.request.lock().req_id
    }

    /// Next generated token, blocking until one is available.
    ///
    /// Returns `None` once the request is terminal and every token has
    /// been delivered; repeated calls at end-of-stream keep returning
    /// `None` without blocking.
    pub fn next_token(&mut self) -> Option<u32> {
        loop {
            let seen = self.waiter.epoch();
            {
                let req = self.request.lock();
                let seq = req.sequences.first()?;
                if self.cursor < seq.output_tokens.len() {
                    let token = seq.output_tokens[self.cursor];
                    self.cursor += 1;
                    return Some(token);
                }
                if seq.is_finished() {
                    return None;
                }
            }
            self.waiter.wait(seen);
        }
    }
}

impl Iterator for StreamingIterator {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        self.next_token()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::config::SamplingConfig;
    use crate::core::request::{FinishReason, Request, RequestInput};

    fn request() -> (RequestHandle, Arc<Waiter>) {
        let waiter = Arc::new(Waiter::new());
        let req = Request::from_input(RequestInput {
            req_id: 1,
            model_name: "m".to_string(),
            token_sequences: vec![vec![10, 11, 12]],
            sampling_configs: vec![SamplingConfig::default()],
            waiter: waiter.clone(),
        });
        (Arc::new(Mutex::new(req)), waiter)
    }

    #[test]
    fn test_streams_only_generated_tokens() {
        let (handle, waiter) = request();
        {
            let mut req = handle.lock();
            req.sequences[0].output_tokens.extend([20, 21]);
            req.sequences[0].finish_reason = Some(FinishReason::MaxTokens);
        }
        waiter.notify();

        let mut iter = StreamingIterator::new(handle, waiter);
        // The 3-token input is never replayed.
        assert_eq!(iter.next_token(), Some(20));
        assert_eq!(iter.next_token(), Some(21));
        assert_eq!(iter.next_token(), None);
        // Idempotent at end-of-stream.
        assert_eq!(iter.next_token(), None);
    }

    #[test]
    fn test_blocks_until_producer_appends() {
        let (handle, waiter) = request();
        let producer = {
            let handle = handle.clone();
            let waiter = waiter.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                handle.lock().sequences[0].output_tokens.push(42);
                waiter.notify();
                thread::sleep(Duration::from_millis(20));
                handle.lock().sequences[0].finish_reason = Some(FinishReason::EndOfSequence);
                waiter.notify();
            })
        };

        let mut iter = StreamingIterator::new(handle, waiter);
        assert_eq!(iter.next_token(), Some(42));
        assert_eq!(iter.next_token(), None);
        producer.join().unwrap();
    }

    #[test]
    fn test_iterator_collect() {
        let (handle, waiter) = request();
        {
            let mut req = handle.lock();
            req.sequences[0].output_tokens.extend([1, 2, 3]);
            req.sequences[0].finish_reason = Some(FinishReason::EndOfSequence);
        }
        let iter = StreamingIterator::new(handle, waiter);
        assert_eq!(iter.collect::<Vec<_>>(), vec![1, 2, 3]);
    }
}
