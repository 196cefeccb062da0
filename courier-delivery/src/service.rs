//! Wiring for a complete delivery pipeline
//!
//! [`DeliveryService`] builds a [`Router`] from the configured channels, puts a
//! [`DeliveryQueue`] in front of it, and runs the workers until told to stop.

use std::{sync::Arc, time::Duration};

use courier_common::{Message, MessageId, Priority, Signal, internal};
use tokio::sync::broadcast;
use tracing::Span;

use crate::{
    channel::ChannelFactory,
    config::DeliveryConfig,
    error::DeliveryError,
    queue::{DeliveryQueue, EnqueueOptions},
    router::Router,
    types::DeliveryReport,
};

#[derive(Debug)]
pub struct DeliveryService {
    config: DeliveryConfig,
    router: Arc<Router>,
    queue: Arc<DeliveryQueue>,
    span: Span,
}

impl DeliveryService {
    /// Build every enabled channel in `config` through `factory`
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid or any enabled channel cannot be
    /// built or registered.
    pub fn from_config(
        config: DeliveryConfig,
        factory: &ChannelFactory,
    ) -> Result<Self, DeliveryError> {
        config.validate()?;

        let span = tracing::info_span!("delivery");
        let router = Router::new(config.router.clone())
            .with_span(tracing::info_span!(parent: &span, "router"));

        for channel in &config.channels {
            if !channel.enabled {
                tracing::info!(parent: &span, name = %channel.name, "Skipping disabled channel");
                continue;
            }

            let built = factory.create(channel)?;
            router.add_channel(built, channel.rate_limit())?;
        }

        let router = Arc::new(router);
        let queue = DeliveryQueue::new(config.queue.clone())
            .with_span(tracing::info_span!(parent: &span, "queue"));
        queue.set_dispatcher(router.clone());

        Ok(Self {
            config,
            router,
            queue: Arc::new(queue),
            span,
        })
    }

    pub const fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    pub const fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub const fn queue(&self) -> &Arc<DeliveryQueue> {
        &self.queue
    }

    /// Queue `message` for delivery at `priority`
    pub fn submit(&self, message: Message, priority: Priority) -> Result<MessageId, DeliveryError> {
        Ok(self.queue.enqueue(message, priority)?)
    }

    pub fn submit_with(
        &self,
        message: Message,
        options: EnqueueOptions,
    ) -> Result<MessageId, DeliveryError> {
        Ok(self.queue.enqueue_with(message, options)?)
    }

    /// Deliver `message` right away, bypassing the queue
    pub async fn send_now(&self, message: &Message, channel: Option<&str>) -> DeliveryReport {
        self.router.send(message, channel).await
    }

    pub fn start(&self) -> Result<(), DeliveryError> {
        Ok(self.queue.start()?)
    }

    pub async fn stop(&self) {
        self.queue.stop().await;
    }

    /// Run the workers until a shutdown signal arrives
    ///
    /// Queue and router counters are logged every `stats_interval_secs`.
    pub async fn serve(
        &self,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), DeliveryError> {
        tracing::info!(
            parent: &self.span,
            channels = ?self.router.available_channels(),
            "Delivery service starting"
        );
        self.start()?;

        let mut stats_timer =
            tokio::time::interval(Duration::from_secs(self.config.stats_interval_secs.max(1)));
        // The first tick completes immediately
        stats_timer.tick().await;

        loop {
            tokio::select! {
                _ = stats_timer.tick() => self.log_statistics(),
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            internal!("Delivery service received shutdown signal");
                            break;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(
                                parent: &self.span,
                                skipped,
                                "Delivery service lagged behind signals"
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            tracing::warn!(parent: &self.span, "Signal channel closed, shutting down");
                            break;
                        }
                    }
                }
            }
        }

        self.stop().await;
        self.log_statistics();
        internal!(level = INFO, "Delivery service stopped");

        Ok(())
    }

    fn log_statistics(&self) {
        let queue = self.queue.stats();
        tracing::info!(
            parent: &self.span,
            queued = queue.current_size,
            active_workers = queue.active_workers,
            processed = queue.processed,
            failed = queue.failed,
            retried = queue.retried,
            router = ?self.router.statistics(),
            "Delivery statistics"
        );
    }
}
