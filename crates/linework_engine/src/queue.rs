use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

/// Receiving half of a bounded channel shared by a pool of workers.
///
/// Whichever worker holds the lock waits for the next item; the others queue
/// on the lock, so every item is delivered to exactly one worker.
pub(crate) struct SharedQueue<T> {
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
}

impl<T> Clone for SharedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            rx: Arc::clone(&self.rx),
        }
    }
}

impl<T> SharedQueue<T> {
    /// Returns `None` once every sender is dropped and the queue is empty.
    pub(crate) async fn next(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }
}

pub(crate) fn bounded<T>(capacity: usize) -> (mpsc::Sender<T>, SharedQueue<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        tx,
        SharedQueue {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}
