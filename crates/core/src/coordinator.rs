use std::sync::Mutex as StdMutex;

use tokio::sync::{Mutex, mpsc, watch};

use crate::source::Chunk;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Finished,
    Failed,
}

#[derive(Debug, Clone, Copy, Default)]
struct Flags {
    finished: bool,
    failed: bool,
}

/// Rendezvous for one file upload: the bounded chunk queue plus the single-shot
/// "finished" and "error" signals.
#[derive(Debug)]
pub struct Coordinator {
    sender: StdMutex<Option<mpsc::Sender<Chunk>>>,
    receiver: Mutex<mpsc::Receiver<Chunk>>,
    flags: watch::Sender<Flags>,
}

/// The only writer of a coordinator's queue. Dropping it closes the queue.
#[derive(Debug)]
pub struct QueueProducer {
    sender: mpsc::Sender<Chunk>,
}

impl QueueProducer {
    /// Blocks while the queue is full.
    pub async fn send(&self, chunk: Chunk) -> Result<()> {
        self.sender.send(chunk).await.map_err(|_| Error::Shutdown {
            message: "chunk queue has no consumers".to_string(),
        })
    }

    pub fn close(self) {}
}

impl Coordinator {
    pub fn new(queue_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let (flags, _) = watch::channel(Flags::default());
        Self {
            sender: StdMutex::new(Some(tx)),
            receiver: Mutex::new(rx),
            flags,
        }
    }

    /// Hands out the queue's writer. There is exactly one; later calls fail.
    pub fn producer(&self) -> Result<QueueProducer> {
        self.sender
            .lock()
            .expect("coordinator sender mutex poisoned")
            .take()
            .map(|sender| QueueProducer { sender })
            .ok_or_else(|| Error::Shutdown {
                message: "chunk queue producer already taken".to_string(),
            })
    }

    /// Next queued chunk; `None` once the producer is gone and the queue is drained.
    pub async fn recv(&self) -> Option<Chunk> {
        self.receiver.lock().await.recv().await
    }

    /// Fires "finished" if nothing has fired it before. Returns whether this call did.
    pub fn signal_finished(&self) -> bool {
        self.flags.send_if_modified(|f| {
            if f.finished {
                return false;
            }
            f.finished = true;
            true
        })
    }

    pub fn signal_error(&self) -> bool {
        self.flags.send_if_modified(|f| {
            if f.failed {
                return false;
            }
            f.failed = true;
            true
        })
    }

    pub fn is_finished(&self) -> bool {
        self.flags.borrow().finished
    }

    pub fn is_failed(&self) -> bool {
        self.flags.borrow().failed
    }

    pub fn reset(&self) {
        self.flags.send_replace(Flags::default());
    }

    /// Suspends until either signal fires. An error wins over a finish.
    pub async fn wait_for_completion(&self) -> Completion {
        let mut rx = self.flags.subscribe();
        match rx.wait_for(|f| f.finished || f.failed).await {
            Ok(flags) if !flags.failed => Completion::Finished,
            _ => Completion::Failed,
        }
    }

    pub async fn wait_for_error(&self) {
        let mut rx = self.flags.subscribe();
        let _ = rx.wait_for(|f| f.failed).await;
    }
}
