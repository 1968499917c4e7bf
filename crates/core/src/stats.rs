//! Periodic reporting of per-connection transport counters.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::ClientRegistry;

/// Where the reports go. In production this is the transport's stats
/// packet path; tests hand in a channel.
pub trait StatsSink: Send + Sync + 'static {
    fn publish(&self, stats: serde_json::Value);
}

impl<F: Fn(serde_json::Value) + Send + Sync + 'static> StatsSink for F {
    fn publish(&self, stats: serde_json::Value) {
        self(stats)
    }
}

pub struct StatsReporter {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl StatsReporter {
    /// Sample `registry` every `interval` and push one JSON document,
    /// keyed by client identity, to `sink`.
    pub fn spawn(registry: Arc<ClientRegistry>, sink: Arc<dyn StatsSink>, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick fires immediately; skip it so a report
            // always covers a full interval
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => sink.publish(sample(&registry)),
                }
            }
        });

        Self { cancel, join }
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.join.await;
    }
}

fn sample(registry: &ClientRegistry) -> serde_json::Value {
    let mut stats = serde_json::Map::new();
    for (id, sample) in registry.sample_all() {
        stats.insert(
            id.identity.to_string(),
            json!({
                "connection": sample,
            }),
        );
    }
    serde_json::Value::Object(stats)
}
