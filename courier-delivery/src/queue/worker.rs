use std::{panic::AssertUnwindSafe, sync::Arc};

use courier_common::internal;
use futures_util::FutureExt;
use tokio::time::Instant;

use super::{QueueEntry, Shared};
use crate::{
    error::{SystemError, panic_message},
    types::DeliveryReport,
};

impl Shared {
    pub(super) async fn run(self: Arc<Self>, index: usize) {
        internal!(level = DEBUG, "Worker {index} started");
        let batch_size = self.config.batch_size.max(1);

        while self.is_running() {
            let mut processed = 0;
            while processed < batch_size && self.is_running() {
                let Some(entry) = self.take() else {
                    break;
                };

                self.process(entry).await;
                processed += 1;
            }

            if processed == 0 {
                self.wait_for_work().await;
            } else {
                tokio::task::yield_now().await;
            }
        }

        internal!(level = DEBUG, "Worker {index} stopped");
    }

    /// Sleep until something is enqueued, a delayed entry falls due, the queue
    /// stops, or the idle timeout passes
    async fn wait_for_work(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let now = Instant::now();
        let (ready, next_due) = {
            let store = self.store.lock();
            (store.has_ready(now), store.next_due())
        };

        if ready || !self.is_running() {
            return;
        }

        let idle = now + self.config.idle_wait();
        let deadline = next_due.map_or(idle, |due| due.min(idle));

        tokio::select! {
            () = &mut notified => {}
            () = tokio::time::sleep_until(deadline) => {}
        }
    }

    async fn process(&self, entry: QueueEntry) {
        let id = entry.id();
        let dispatcher = self.dispatcher.lock().clone();
        let Some(dispatcher) = dispatcher else {
            self.complete(id, DeliveryReport::failed(id, None, SystemError::NoDispatcher));
            return;
        };

        internal!(
            "Dispatching {id} (attempt {}, priority {})",
            entry.retry_count + 1,
            entry.priority
        );

        self.store.lock().stats.active_workers += 1;
        let report = AssertUnwindSafe(dispatcher.dispatch(&entry))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let message = panic_message(panic.as_ref());
                tracing::error!(%id, panic = %message, "Dispatcher panicked");
                DeliveryReport::failed(id, None, SystemError::Internal(message))
            });
        {
            let mut store = self.store.lock();
            store.stats.active_workers = store.stats.active_workers.saturating_sub(1);
        }

        self.complete(id, report);
    }
}
