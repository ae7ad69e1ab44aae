use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, mpsc};

/// Bounded hand-off from the fetch task to the translator pool.
///
/// A slot is reserved *before* a chapter is fetched and released only when the
/// worker that dequeued it is done with it, so fetched-but-untranslated
/// chapters never exceed the capacity.
pub fn chapter_queue(capacity: usize) -> (QueueProducer, QueueConsumer) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    (
        QueueProducer {
            slots: Arc::new(Semaphore::new(capacity)),
            tx,
        },
        QueueConsumer {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

#[derive(Debug)]
pub struct QueuedChapter {
    pub index: u32,
    _slot: OwnedSemaphorePermit,
}

#[derive(Debug)]
pub struct QueueProducer {
    slots: Arc<Semaphore>,
    tx: mpsc::Sender<QueuedChapter>,
}

/// A reserved place in the queue. Dropping it gives the place back.
#[derive(Debug)]
pub struct Slot {
    permit: OwnedSemaphorePermit,
}

impl QueueProducer {
    /// Waits until the queue has room. `None` once the queue is shut down.
    pub async fn reserve(&self) -> Option<Slot> {
        let permit = Arc::clone(&self.slots).acquire_owned().await.ok()?;
        Some(Slot { permit })
    }

    /// Returns `false` when every consumer is gone.
    pub async fn enqueue(&self, slot: Slot, index: u32) -> bool {
        self.tx
            .send(QueuedChapter {
                index,
                _slot: slot.permit,
            })
            .await
            .is_ok()
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }
}

#[derive(Debug, Clone)]
pub struct QueueConsumer {
    rx: Arc<Mutex<mpsc::Receiver<QueuedChapter>>>,
}

impl QueueConsumer {
    /// `None` once the producer is dropped and the queue is drained.
    pub async fn recv(&self) -> Option<QueuedChapter> {
        self.rx.lock().await.recv().await
    }
}
