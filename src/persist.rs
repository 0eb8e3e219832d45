//! Write-behind persistence
//!
//! Live state is the source of truth for fanout; durable copies are written
//! afterwards by a single worker task. Jobs are applied in the order the
//! server actor queued them, so two quick edits of the same message cannot
//! land in the store out of order. Failures are logged and not retried.
//!
//! Reads that must observe every earlier write (loading a message to mutate
//! it, loading a history page) go through the same queue. Their outcome is
//! posted back to the actor as a command, in queue order.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::ledger::Message;
use crate::presence::UserPresence;
use crate::server::ServerCommand;
use crate::store::Store;

/// A job queued by the server actor
pub enum WriteJob {
    Presence(UserPresence),
    Message(Message),
    /// Store read whose result goes back to the actor
    Read(BoxFuture<'static, ServerCommand>),
}

/// Queue side, held by the server actor
#[derive(Debug, Clone)]
pub struct WriteBehind {
    sender: mpsc::UnboundedSender<WriteJob>,
}

/// Worker side, drains the queue into the store
pub struct WriteWorker {
    store: Arc<dyn Store>,
    receiver: mpsc::UnboundedReceiver<WriteJob>,
    /// Actor inbox for read results; weak so the worker never keeps the
    /// actor alive
    results: mpsc::WeakSender<ServerCommand>,
}

impl WriteBehind {
    /// Create a queue and the worker that drains it
    pub fn new(
        store: Arc<dyn Store>,
        results: mpsc::WeakSender<ServerCommand>,
    ) -> (Self, WriteWorker) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = WriteWorker {
            store,
            receiver,
            results,
        };
        (Self { sender }, worker)
    }

    pub fn presence(&self, record: UserPresence) {
        self.enqueue(WriteJob::Presence(record));
    }

    pub fn message(&self, message: Message) {
        self.enqueue(WriteJob::Message(message));
    }

    /// Run `work` after every write queued so far and send its command back
    pub fn read(&self, work: BoxFuture<'static, ServerCommand>) {
        self.enqueue(WriteJob::Read(work));
    }

    fn enqueue(&self, job: WriteJob) {
        if self.sender.send(job).is_err() {
            error!("Write-behind worker stopped, job lost");
        }
    }
}

impl WriteWorker {
    /// Apply queued jobs until every `WriteBehind` handle is dropped
    pub async fn run(mut self) {
        while let Some(job) = self.receiver.recv().await {
            let (label, result) = match job {
                WriteJob::Presence(record) => (
                    format!("presence of {}", record.user_id),
                    self.store.update_presence_record(&record).await,
                ),
                WriteJob::Message(message) => (
                    format!("message {}", message.id),
                    self.store.update_message_record(&message).await,
                ),
                WriteJob::Read(work) => {
                    let cmd = work.await;
                    match self.results.upgrade() {
                        Some(tx) => {
                            if tx.send(cmd).await.is_err() {
                                debug!("ChatServer gone before read result arrived");
                            }
                        }
                        None => debug!("ChatServer closing, dropping read result"),
                    }
                    continue;
                }
            };
            match result {
                Ok(()) => debug!("Persisted {}", label),
                Err(e) => error!("Failed to persist {}: {}", label, e),
            }
        }
        debug!("Write-behind worker shutting down");
    }
}
