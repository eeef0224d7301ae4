use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::registry::Counter;
use crate::shutdown::{ShutdownReceiver, ShutdownSender};
use crate::sink::{MetricsSinkWriter, SinkTarget};
use crate::window::GroupedBatch;

/// Fans every closed batch out to independent writer tasks.
///
/// Each writer has its own bounded queue and consumer task, so a failing
/// writer never affects its siblings. Publishing waits for queue space
/// instead of overwriting, which holds back only the close trigger, never the
/// record path.
pub struct MetricDispatcher {
    queues: Vec<mpsc::Sender<Arc<GroupedBatch>>>,
    consumers: Vec<JoinHandle<()>>,
}

impl MetricDispatcher {
    pub fn spawn(
        target: SinkTarget,
        writers: Vec<Arc<dyn MetricsSinkWriter>>,
        capacity: usize,
        shutdown: &ShutdownSender,
        failures: Counter,
    ) -> Self {
        let (queues, consumers) = writers
            .into_iter()
            .map(|writer| {
                let (tx, rx) = mpsc::channel(capacity);
                let consumer = tokio::spawn(consume(
                    writer,
                    target.clone(),
                    rx,
                    shutdown.subscribe(),
                    failures.clone(),
                ));
                (tx, consumer)
            })
            .unzip();
        Self { queues, consumers }
    }

    pub fn publisher(&self) -> BatchPublisher {
        BatchPublisher {
            queues: self.queues.clone(),
        }
    }

    /// Stops accepting batches and waits until every writer has handled what
    /// was already published. Every `BatchPublisher` must be dropped first.
    pub async fn close(self) {
        let Self { queues, consumers } = self;
        drop(queues);
        for consumer in consumers {
            if let Err(e) = consumer.await {
                warn!(error = %e, "metrics writer task failed");
            }
        }
    }
}

/// Cloneable handle used to hand closed batches to the dispatcher.
#[derive(Clone)]
pub struct BatchPublisher {
    queues: Vec<mpsc::Sender<Arc<GroupedBatch>>>,
}

impl BatchPublisher {
    /// Queues the batch for every writer, waiting while a queue is full. A
    /// writer whose task has stopped is skipped.
    pub async fn publish(&self, batch: GroupedBatch) {
        let batch = Arc::new(batch);
        let sends = self.queues.iter().map(|queue| queue.send(batch.clone()));
        let stopped = join_all(sends).await.into_iter().filter(Result::is_err).count();
        if stopped > 0 {
            debug!(
                key = %batch.key,
                window_start = batch.window.start_ms,
                stopped,
                "metrics writers stopped, batch not delivered to all"
            );
        }
    }
}

async fn consume(
    writer: Arc<dyn MetricsSinkWriter>,
    target: SinkTarget,
    mut batches: mpsc::Receiver<Arc<GroupedBatch>>,
    mut shutdown: ShutdownReceiver,
    failures: Counter,
) {
    loop {
        let batch = tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            batch = batches.recv() => match batch {
                Some(batch) => batch,
                None => break,
            },
        };

        tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            result = writer.write(&target, &batch) => {
                if let Err(e) = result {
                    failures.inc();
                    warn!(
                        writer = writer.name(),
                        key = %batch.key,
                        window_start = batch.window.start_ms,
                        error = %e,
                        "failed to write inflight metrics"
                    );
                }
            }
        }
    }
    debug!(writer = writer.name(), "metrics writer stopped");
}
