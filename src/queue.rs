//! An unbounded FIFO decoupling a non-blocking producer from a single
//! consumer.
//!
//! The queue is used to isolate the notification dispatcher from slow
//! subscribers: the dispatcher pushes into the unbounded producer side and
//! never blocks, while a relay task forwards elements in insertion order to
//! the bounded consumer side at whatever pace the consumer sustains.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// An unbounded FIFO between a non-blocking producer and a single consumer.
///
/// Elements are delivered in strict insertion order. Producers never block
/// regardless of consumer speed (memory permitting).
#[derive(Debug)]
pub struct ConcurrentQueue<T> {
    input: mpsc::UnboundedSender<T>,
    // Held until start() hands them to the relay task.
    pending: Option<(mpsc::UnboundedReceiver<T>, mpsc::Sender<T>)>,
    output: Option<mpsc::Receiver<T>>,
    relay: Option<JoinHandle<()>>,
    stop: CancellationToken,
}

impl<T: Send + 'static> ConcurrentQueue<T> {
    /// Create a new queue. `chunk_size` is a hint for how many elements the
    /// consumer side buffers ahead of the consumer.
    pub fn new(chunk_size: usize) -> Self {
        let (input, staging_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::channel(chunk_size.max(1));

        Self {
            input,
            pending: Some((staging_rx, out_tx)),
            output: Some(out_rx),
            relay: None,
            stop: CancellationToken::new(),
        }
    }

    /// Launch the relay task. Elements pushed before `start` are retained
    /// and delivered once the relay runs.
    pub fn start(&mut self) {
        let Some((mut staging_rx, out_tx)) = self.pending.take() else {
            return;
        };
        let stop = self.stop.clone();

        self.relay = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    item = staging_rx.recv() => {
                        let Some(item) = item else { break };
                        tokio::select! {
                            res = out_tx.send(item) => {
                                if res.is_err() {
                                    break;
                                }
                            }
                            _ = stop.cancelled() => break,
                        }
                    }
                    _ = stop.cancelled() => break,
                }
            }

            // Best-effort drain of elements already queued at stop time. If
            // the consumer is gone or saturated, the remainder is dropped.
            while let Ok(item) = staging_rx.try_recv() {
                if out_tx.try_send(item).is_err() {
                    break;
                }
            }
        }));
    }

    /// Push an element. Returns false if the queue has been stopped.
    pub fn send(&self, item: T) -> bool {
        if self.stop.is_cancelled() {
            return false;
        }
        self.input.send(item).is_ok()
    }

    /// Take the consumer endpoint. Yields `None` after the first call.
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<T>> {
        self.output.take()
    }

    /// Stop the relay, drain what it can, and close the consumer side.
    pub async fn stop(&mut self) {
        self.stop.cancel();
        if let Some(relay) = self.relay.take() {
            let _ = relay.await;
        }
        // Never started: dropping the staged endpoints closes the output.
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delivers_in_insertion_order() {
        let mut queue = ConcurrentQueue::new(4);
        queue.start();
        let mut out = queue.take_output().unwrap();

        for i in 0..100u32 {
            assert!(queue.send(i));
        }

        for i in 0..100u32 {
            assert_eq!(out.recv().await, Some(i));
        }
    }

    #[tokio::test]
    async fn test_producer_never_blocks_on_slow_consumer() {
        let mut queue = ConcurrentQueue::new(2);
        queue.start();
        let mut out = queue.take_output().unwrap();

        // Far more elements than the consumer-side buffer holds; sends are
        // synchronous and must all succeed without a consumer running.
        for i in 0..1_000u32 {
            assert!(queue.send(i));
        }

        for i in 0..1_000u32 {
            assert_eq!(out.recv().await, Some(i));
        }
    }

    #[tokio::test]
    async fn test_elements_before_start_are_retained() {
        let mut queue = ConcurrentQueue::new(4);
        assert!(queue.send(7u32));
        queue.start();
        let mut out = queue.take_output().unwrap();
        assert_eq!(out.recv().await, Some(7));
    }

    #[tokio::test]
    async fn test_stop_closes_output() {
        let mut queue = ConcurrentQueue::<u32>::new(4);
        queue.start();
        let mut out = queue.take_output().unwrap();

        queue.stop().await;

        assert!(!queue.send(1));
        assert_eq!(out.recv().await, None);
    }

    #[tokio::test]
    async fn test_stop_without_start_closes_output() {
        let mut queue = ConcurrentQueue::<u32>::new(4);
        let mut out = queue.take_output().unwrap();
        queue.stop().await;
        assert_eq!(out.recv().await, None);
    }

    #[tokio::test]
    async fn test_stop_with_unread_consumer_does_not_hang() {
        let mut queue = ConcurrentQueue::new(1);
        queue.start();
        let _out = queue.take_output().unwrap();

        for i in 0..50u32 {
            queue.send(i);
        }
        // Consumer never reads; stop must still return.
        queue.stop().await;
    }
}
