use std::collections::BTreeMap;

use ahash::AHashMap;
use parking_lot::Mutex;

#[derive(Debug, Default, Clone, Copy)]
struct ChannelCounters {
    success: u64,
    failure: u64,
}

#[derive(Debug, Default)]
struct Counters {
    channels: AHashMap<String, ChannelCounters>,
    retries: u64,
    fallbacks: u64,
}

/// Router counters, flattened to `<channel>_success`, `<channel>_failure`,
/// `retries` and `fallbacks`
#[derive(Debug, Default)]
pub struct RouterStats {
    inner: Mutex<Counters>,
}

impl RouterStats {
    pub(super) fn success(&self, channel: &str) {
        let mut inner = self.inner.lock();
        inner.channels.entry(channel.to_string()).or_default().success += 1;
    }

    pub(super) fn failure(&self, channel: &str) {
        let mut inner = self.inner.lock();
        inner.channels.entry(channel.to_string()).or_default().failure += 1;
    }

    pub(super) fn retry(&self) {
        self.inner.lock().retries += 1;
    }

    pub(super) fn fallback(&self) {
        self.inner.lock().fallbacks += 1;
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        let inner = self.inner.lock();
        let mut counters = BTreeMap::new();

        for (name, channel) in &inner.channels {
            counters.insert(format!("{name}_success"), channel.success);
            counters.insert(format!("{name}_failure"), channel.failure);
        }
        counters.insert("retries".to_string(), inner.retries);
        counters.insert("fallbacks".to_string(), inner.fallbacks);

        counters
    }

    pub fn reset(&self) {
        *self.inner.lock() = Counters::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let stats = RouterStats::default();
        stats.success("smtp");
        stats.success("smtp");
        stats.failure("sendgrid");
        stats.fallback();
        stats.retry();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.get("smtp_success"), Some(&2));
        assert_eq!(snapshot.get("smtp_failure"), Some(&0));
        assert_eq!(snapshot.get("sendgrid_failure"), Some(&1));
        assert_eq!(snapshot.get("fallbacks"), Some(&1));
        assert_eq!(snapshot.get("retries"), Some(&1));

        stats.reset();
        assert_eq!(stats.snapshot().len(), 2);
    }
}
