use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::model::{QueueItem, TaskType};
use crate::source::ContentSource;
use crate::util;
use crate::writer::IndexWriterService;

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error("indexing queue is closed")]
    Closed,
}

/// Producer handle pushing queue items into the worker's buffer. Enqueueing
/// never blocks.
#[derive(Clone)]
pub struct QueueClient {
    sender: mpsc::UnboundedSender<QueueItem>,
}

impl QueueClient {
    pub fn enqueue(&self, item: QueueItem) -> Result<(), EnqueueError> {
        self.sender.send(item).map_err(|_| EnqueueError::Closed)
    }
}

pub fn channel() -> (QueueClient, mpsc::UnboundedReceiver<QueueItem>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (QueueClient { sender }, receiver)
}

#[derive(Clone, Debug)]
pub struct QueueWorkerConfig {
    /// Buffer size that triggers a flush before the interval elapses.
    pub max_batch_size: usize,
    /// How often the background loop flushes the buffer.
    pub flush_interval: Duration,
    /// Bound on the final flush attempted during shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for QueueWorkerConfig {
    fn default() -> Self {
        QueueWorkerConfig {
            max_batch_size: 500,
            flush_interval: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Long-lived consumer draining the indexing queue.
///
/// Items accumulate in a FIFO buffer and are flushed when the buffer reaches
/// `max_batch_size` or `flush_interval` elapses, whichever comes first. A
/// flush de-duplicates last-write-wins per (index, guid, language), groups by
/// index name, and submits each group to the writer service as one unit.
/// A failing group is logged with its item identities and does not stop the
/// remaining groups; failed items are not re-queued.
pub struct QueueWorker {
    receiver: mpsc::UnboundedReceiver<QueueItem>,
    writer: Arc<IndexWriterService>,
    content: Arc<dyn ContentSource>,
    config: QueueWorkerConfig,
    buffer: Vec<QueueItem>,
}

impl QueueWorker {
    pub fn new(
        receiver: mpsc::UnboundedReceiver<QueueItem>,
        writer: Arc<IndexWriterService>,
        content: Arc<dyn ContentSource>,
        config: QueueWorkerConfig,
    ) -> QueueWorker {
        QueueWorker {
            receiver,
            writer,
            content,
            config,
            buffer: Vec::new(),
        }
    }

    /// Runs until the shutdown signal flips or every producer is dropped,
    /// then attempts a final bounded flush of whatever is still buffered.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush(Some(&shutdown)).await;
                }
                received = self.receiver.recv() => {
                    match received {
                        Some(item) => {
                            self.buffer.push(item);
                            if self.buffer.len() >= self.config.max_batch_size {
                                self.flush(Some(&shutdown)).await;
                                ticker.reset();
                            }
                        }
                        None => break,
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        // Drain anything still sitting in the channel, then flush once more
        // within the shutdown bound.
        while let Ok(item) = self.receiver.try_recv() {
            self.buffer.push(item);
        }

        let pending = self.buffer.len();
        if pending > 0 {
            let timeout = self.config.shutdown_timeout;
            if tokio::time::timeout(timeout, self.flush(None)).await.is_err() {
                warn!(message = "shutdown_flush_timed_out", pending);
            }
        }

        info!(message = "queue_worker_stopped");
    }

    /// Flushes the buffer. When a shutdown signal is supplied, no further
    /// index groups are started once it flips; the group in progress always
    /// finishes its commit. The final shutdown flush passes `None` and is
    /// bounded by the timeout instead.
    async fn flush(&mut self, halt_signal: Option<&watch::Receiver<bool>>) {
        if self.buffer.is_empty() {
            return;
        }

        let items = std::mem::take(&mut self.buffer);
        let flush_id = util::generate_id();

        info!(
            message = "flush_started",
            flush_id = flush_id.as_str(),
            item_count = items.len(),
            at = util::timestamp().as_str()
        );

        let mut groups = plan_flush(items).into_iter();

        while let Some((index_name, group)) = groups.next() {
            if halt_signal.map(|signal| *signal.borrow()).unwrap_or(false) {
                warn!(
                    message = "flush_halted_by_shutdown",
                    flush_id = flush_id.as_str(),
                    index = index_name.as_str()
                );

                // Hand the untouched groups back to the buffer so the final
                // shutdown flush can still attempt them.
                self.buffer.extend(group);
                for (_, rest) in groups {
                    self.buffer.extend(rest);
                }
                break;
            }

            let identities = group.iter().map(describe).collect::<Vec<_>>().join(", ");

            match self
                .writer
                .apply_batch(&index_name, group, self.content.as_ref())
                .await
            {
                Ok(outcome) => {
                    info!(
                        message = "flush_group_applied",
                        flush_id = flush_id.as_str(),
                        index = index_name.as_str(),
                        applied = outcome.applied,
                        skipped = outcome.skipped,
                        rebuilt = outcome.rebuilt
                    );
                }
                Err(err) => {
                    // Isolated to this group; the items are logged for manual
                    // re-trigger and not re-queued.
                    error!(
                        message = "flush_group_failed",
                        flush_id = flush_id.as_str(),
                        index = index_name.as_str(),
                        error = err.to_string().as_str(),
                        items = identities.as_str()
                    );
                }
            }
        }
    }
}

fn describe(item: &QueueItem) -> String {
    match item.item() {
        Some(snapshot) => format!(
            "{:?} {}/{}",
            item.task_type(),
            snapshot.item_guid,
            snapshot.language_name
        ),
        None => format!("{:?}", item.task_type()),
    }
}

/// Turns a drained buffer into per-index dispatch groups.
///
/// Within the batch the last operation wins per (index, guid, language) key.
/// A PublishIndex item collapses its index's group to the single rebuild,
/// since the rebuild re-reads every in-scope item anyway. First-seen index
/// order and per-key buffer order are preserved.
fn plan_flush(items: Vec<QueueItem>) -> Vec<(String, Vec<QueueItem>)> {
    let mut last_for_key: HashMap<(String, String), usize> = HashMap::new();
    let mut rebuild_indexes: HashSet<String> = HashSet::new();

    for (pos, item) in items.iter().enumerate() {
        match item.item() {
            Some(snapshot) => {
                last_for_key.insert((item.index_name().into(), snapshot.unique_key()), pos);
            }
            None => {
                rebuild_indexes.insert(item.index_name().into());
            }
        }
    }

    let mut groups: Vec<(String, Vec<QueueItem>)> = Vec::new();
    let mut rebuild_planned: HashSet<String> = HashSet::new();

    for (pos, item) in items.into_iter().enumerate() {
        let index_name = item.index_name().to_string();

        let keep = if rebuild_indexes.contains(&index_name) {
            item.task_type() == TaskType::PublishIndex && rebuild_planned.insert(index_name.clone())
        } else {
            match item.item() {
                Some(snapshot) => {
                    last_for_key[&(index_name.clone(), snapshot.unique_key())] == pos
                }
                None => true,
            }
        };

        if !keep {
            continue;
        }

        match groups.iter_mut().find(|(name, _)| *name == index_name) {
            Some((_, group)) => group.push(item),
            None => groups.push((index_name, vec![item])),
        }
    }

    groups
}
