//! In-memory channels for exercising the delivery pipeline
#![allow(dead_code)] // Not every test file uses every helper

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use courier_delivery::{
    Channel, ChannelError, DeliveryQueue, ErrorCategory, Message, MessageId, Provider, SendReceipt,
};
use parking_lot::Mutex;

/// A channel that records what it was asked to send
///
/// Outcomes are taken from a script; once the script runs out every send
/// succeeds (or fails with `fallback` when one is set).
pub struct MockChannel {
    name: String,
    script: Mutex<VecDeque<Result<(), ErrorCategory>>>,
    fallback: Option<ErrorCategory>,
    sent: Mutex<Vec<(MessageId, String)>>,
    calls: AtomicUsize,
}

impl MockChannel {
    pub fn healthy(name: &str) -> Arc<Self> {
        Self::build(name, Vec::new(), None)
    }

    /// Fails every send with `category`
    pub fn failing(name: &str, category: ErrorCategory) -> Arc<Self> {
        Self::build(name, Vec::new(), Some(category))
    }

    pub fn scripted(name: &str, script: Vec<Result<(), ErrorCategory>>) -> Arc<Self> {
        Self::build(name, script, None)
    }

    fn build(
        name: &str,
        script: Vec<Result<(), ErrorCategory>>,
        fallback: Option<ErrorCategory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(script.into()),
            fallback,
            sent: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Subjects of the messages accepted so far, in order
    pub fn subjects(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .map(|(_, subject)| subject.clone())
            .collect()
    }

    pub fn ids(&self) -> Vec<MessageId> {
        self.sent.lock().iter().map(|(id, _)| *id).collect()
    }
}

#[async_trait]
impl Channel for MockChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider(&self) -> Provider {
        Provider::Custom
    }

    async fn send(&self, message: &Message) -> Result<SendReceipt, ChannelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let outcome = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.map_or(Ok(()), Err));

        match outcome {
            Ok(()) => {
                self.sent
                    .lock()
                    .push((message.id, message.subject.clone()));
                Ok(SendReceipt::new(format!("{}-{}", self.name, message.id)))
            }
            Err(category) => Err(ChannelError::new(
                category,
                format!("{} refused {}", self.name, message.id),
            )),
        }
    }
}

pub fn message(subject: impl Into<String>) -> Message {
    Message::new(
        "sender@example.org",
        vec!["rcpt@example.com".to_string()],
        subject,
        "Test message content",
    )
}

/// Poll until `done` holds, panicking after `limit`
pub async fn wait_for(
    queue: &DeliveryQueue,
    limit: Duration,
    done: impl Fn(&DeliveryQueue) -> bool,
) {
    tokio::time::timeout(limit, async {
        while !done(queue) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("queue did not settle within {limit:?}: {queue:?}"));
}
