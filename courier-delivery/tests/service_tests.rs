//! Running a delivery service from a configuration file
#![allow(clippy::expect_used, clippy::unwrap_used)]

mod support;

use std::{io::Write, sync::Arc, time::Duration};

use courier_common::{Signal, logging};
use courier_delivery::{
    Channel, ChannelConfig, ChannelFactory, DeliveryConfig, DeliveryService, DeliveryStatus,
    EnqueueOptions, ErrorCategory, Priority, Provider,
};
use support::{MockChannel, message, wait_for};
use tokio::sync::broadcast;

const CONFIG: &str = r#"(
    queue: (workers: 2, retry: (max_retries: 1, base_retry_delay_secs: 1)),
    router: (enable_fallback: false),
    stats_interval_secs: 1,
    logging: (level: "info", ansi: false),
    channels: [
        (name: "relay", provider: "smtp", settings: {"host": "mail.example.org"}),
        (name: "broken", provider: "smtp", settings: {"host": "mail.example.org", "fail": "connection"}),
        (name: "spare", provider: "mailgun", enabled: false),
    ],
)"#;

/// Channels keep their mocks so tests can inspect them after building
fn factory(channels: Arc<parking_lot::Mutex<Vec<Arc<MockChannel>>>>) -> ChannelFactory {
    let mut factory = ChannelFactory::new();
    factory.register(Provider::Smtp, move |config: &ChannelConfig| {
        config.require("host")?;
        let channel = match config.settings.get("fail").map(String::as_str) {
            Some("connection") => MockChannel::failing(&config.name, ErrorCategory::Connection),
            _ => MockChannel::healthy(&config.name),
        };
        channels.lock().push(Arc::clone(&channel));
        Ok(channel as Arc<dyn Channel>)
    });
    factory
}

fn load() -> anyhow::Result<(DeliveryService, Vec<Arc<MockChannel>>)> {
    let mut file = tempfile::NamedTempFile::new()?;
    file.write_all(CONFIG.as_bytes())?;

    let config = DeliveryConfig::load(file.path())?;
    let built = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let service = DeliveryService::from_config(config, &factory(Arc::clone(&built)))?;

    let channels = built.lock().clone();
    Ok((service, channels))
}

#[tokio::test]
async fn test_service_builds_enabled_channels() -> anyhow::Result<()> {
    let (service, channels) = load()?;

    assert_eq!(channels.len(), 2);
    assert_eq!(service.router().available_channels(), ["relay", "broken"]);
    assert!(!service.config().router.enable_fallback);

    // The only test in this binary that installs a global subscriber
    assert_eq!(service.config().logging.level.as_deref(), Some("info"));
    logging::init(&service.config().logging)?;

    let report = service.send_now(&message("direct"), Some("relay")).await;
    assert!(report.is_success());
    assert_eq!(channels[0].subjects(), ["direct"]);

    Ok(())
}

#[tokio::test]
async fn test_serve_delivers_until_shutdown() -> anyhow::Result<()> {
    let (service, channels) = load()?;
    let service = Arc::new(service);
    let (tx, rx) = broadcast::channel(4);

    let good = service.submit(message("good"), Priority::Normal)?;
    let bad = service.submit_with(
        message("bad"),
        EnqueueOptions::priority(Priority::High)
            .with_channel("broken")
            .with_max_retries(0),
    )?;

    let serving = tokio::spawn({
        let service = Arc::clone(&service);
        async move { service.serve(rx).await }
    });

    wait_for(service.queue(), Duration::from_secs(5), |queue| {
        let stats = queue.stats();
        stats.processed == 1 && stats.failed == 1
    })
    .await;

    tx.send(Signal::Shutdown)?;
    serving.await??;

    assert!(!service.queue().is_running());
    assert!(service.queue().get(good).is_none());
    assert_eq!(
        service.queue().get(bad).map(|entry| entry.status),
        Some(DeliveryStatus::Failed)
    );
    assert_eq!(channels[0].subjects(), ["good"]);
    assert_eq!(channels[1].calls(), 1);

    Ok(())
}

#[tokio::test]
async fn test_scheduled_message_can_be_cancelled() -> anyhow::Result<()> {
    let (service, channels) = load()?;

    let later = service.submit_with(
        message("later"),
        EnqueueOptions::priority(Priority::Normal).with_delay(Duration::from_secs(3600)),
    )?;
    service.start()?;

    let pending = service.queue().pending_messages();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].status, DeliveryStatus::Pending);

    assert!(service.queue().cancel(later));
    service.stop().await;

    assert!(service.queue().is_empty());
    assert!(channels.iter().all(|channel| channel.calls() == 0));

    Ok(())
}
