//! Alert broadcast engine
//!
//! Fans a detection event out to eligible subscriptions: the live control
//! channel is the primary path; disconnected peers fall back to the push
//! collaborator, except channel-only subscriptions which simply miss the
//! event. Push failures never abort a broadcast; invalid tokens purge the
//! subscription and the stored peer token until the peer re-subscribes.

use std::sync::Arc;

use chrono::Utc;
use cribcall_protocol::{ControlMessage, TrustStore};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::push::PushSender;
use crate::registry::ChannelRegistry;
use crate::subscription::{DeliveryMode, SubscriptionRegistry};

/// A noise detection event from the local sampler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoiseEvent {
    pub timestamp_ms: i64,
    pub peak_level: f64,
}

/// What one broadcast did, for logging and tests.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct BroadcastReport {
    pub eligible: usize,
    /// Fingerprints delivered over a live channel.
    pub channel_delivered: Vec<String>,
    /// Fingerprints handed to the push collaborator.
    pub push_attempted: Vec<String>,
    /// Fingerprints skipped because they are channel-only and offline.
    pub skipped_offline: Vec<String>,
    /// Fingerprints purged after the provider reported their token dead.
    pub purged: Vec<String>,
}

pub struct Broadcaster {
    monitor_name: String,
    subscriptions: Arc<SubscriptionRegistry>,
    channels: ChannelRegistry,
    push: Arc<dyn PushSender>,
    trust: Arc<dyn TrustStore>,
}

impl Broadcaster {
    pub fn new(
        monitor_name: impl Into<String>,
        subscriptions: Arc<SubscriptionRegistry>,
        channels: ChannelRegistry,
        push: Arc<dyn PushSender>,
        trust: Arc<dyn TrustStore>,
    ) -> Self {
        Self {
            monitor_name: monitor_name.into(),
            subscriptions,
            channels,
            push,
            trust,
        }
    }

    /// Fan one detection event out. Never fails: delivery problems are
    /// logged and degrade per path.
    pub async fn broadcast(&self, event: NoiseEvent) -> BroadcastReport {
        let eligible = self
            .subscriptions
            .eligible(event.timestamp_ms, event.peak_level, Utc::now());
        let mut report = BroadcastReport {
            eligible: eligible.len(),
            ..BroadcastReport::default()
        };
        if eligible.is_empty() {
            debug!(peak = event.peak_level, "no eligible subscriptions");
            return report;
        }

        let message = ControlMessage::NoiseAlert {
            timestamp_ms: event.timestamp_ms,
            peak_level: event.peak_level,
        };

        let mut push_tokens: Vec<(String, String)> = Vec::new();
        for sub in &eligible {
            if self.channels.is_connected(&sub.fingerprint) {
                match self.channels.send_to(&sub.fingerprint, message.clone()).await {
                    Ok(()) => {
                        report.channel_delivered.push(sub.fingerprint.clone());
                        continue;
                    }
                    Err(e) => {
                        warn!(peer = %sub.fingerprint, "channel delivery failed: {e}");
                    }
                }
            }
            match &sub.delivery {
                DeliveryMode::ChannelOnly => {
                    debug!(peer = %sub.fingerprint, "channel-only subscriber offline, alert missed");
                    report.skipped_offline.push(sub.fingerprint.clone());
                }
                DeliveryMode::Push { token, .. } => {
                    push_tokens.push((sub.fingerprint.clone(), token.clone()));
                }
                DeliveryMode::Webhook { url } => {
                    push_tokens.push((sub.fingerprint.clone(), url.clone()));
                }
            }
        }

        if !push_tokens.is_empty() {
            let payload = json!({
                "type": "noise_alert",
                "monitorName": self.monitor_name,
                "timestampMs": event.timestamp_ms,
                "peakLevel": event.peak_level,
            });
            let tokens: Vec<String> = push_tokens.iter().map(|(_, t)| t.clone()).collect();
            report.push_attempted = push_tokens.iter().map(|(fp, _)| fp.clone()).collect();

            let outcome = self.push.send(&tokens, &payload).await;
            debug!(
                success = outcome.success_count,
                failed = outcome.failure_count,
                invalid = outcome.invalid_tokens.len(),
                "push fan-out finished"
            );

            for token in &outcome.invalid_tokens {
                if let Some(fingerprint) = self.subscriptions.purge_token(token) {
                    // Forget the stored peer token too; the peer must
                    // re-subscribe before push delivery resumes.
                    self.trust.set_push_token(&fingerprint, None);
                    report.purged.push(fingerprint);
                }
            }
        }

        info!(
            eligible = report.eligible,
            channel = report.channel_delivered.len(),
            push = report.push_attempted.len(),
            "broadcast complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::PushOutcome;
    use crate::subscription::{SubscribeRequest, SubscriptionDefaults, CHANNEL_ONLY_TOKEN};
    use async_trait::async_trait;
    use cribcall_protocol::{MemoryTrustStore, TrustedPeer};
    use serde_json::Value;
    use std::sync::Mutex;

    struct RecordingPush {
        batches: Mutex<Vec<Vec<String>>>,
        invalid: Vec<String>,
    }

    impl RecordingPush {
        fn new(invalid: Vec<String>) -> Self {
            Self {
                batches: Mutex::new(Vec::new()),
                invalid,
            }
        }
    }

    #[async_trait]
    impl PushSender for RecordingPush {
        async fn send(&self, tokens: &[String], _payload: &Value) -> PushOutcome {
            self.batches.lock().unwrap().push(tokens.to_vec());
            let invalid: Vec<String> = tokens
                .iter()
                .filter(|t| self.invalid.contains(t))
                .cloned()
                .collect();
            PushOutcome {
                success_count: tokens.len() - invalid.len(),
                failure_count: invalid.len(),
                invalid_tokens: invalid,
            }
        }
    }

    fn registry() -> Arc<SubscriptionRegistry> {
        Arc::new(SubscriptionRegistry::new(SubscriptionDefaults {
            threshold: 50.0,
            cooldown_secs: 30,
            lease_secs: 3600,
            max_lease_secs: 86_400,
        }))
    }

    fn subscribe(subs: &SubscriptionRegistry, fp: &str, token: &str, threshold: f64) {
        subs.upsert(
            fp,
            &SubscribeRequest {
                token: token.to_string(),
                platform: "android".to_string(),
                threshold: Some(threshold),
                cooldown_seconds: Some(30),
                auto_stream_type: None,
                auto_stream_duration_sec: None,
                lease_seconds: None,
            },
        );
    }

    fn trust_with(fps: &[&str]) -> Arc<MemoryTrustStore> {
        let store = MemoryTrustStore::new();
        for fp in fps {
            store.upsert(TrustedPeer {
                device_id: format!("dev-{fp}"),
                display_name: "Phone".into(),
                fingerprint: fp.to_string(),
                certificate_der: None,
                push_token: Some(format!("tok-{fp}")),
            });
        }
        Arc::new(store)
    }

    #[tokio::test]
    async fn threshold_gates_fanout() {
        let subs = registry();
        subscribe(&subs, "a", "tok-a", 10.0);
        subscribe(&subs, "b", "tok-b", 50.0);
        subscribe(&subs, "c", "tok-c", 90.0);

        let push = Arc::new(RecordingPush::new(vec![]));
        let broadcaster = Broadcaster::new(
            "Nursery",
            subs,
            ChannelRegistry::new(),
            push.clone(),
            trust_with(&["a", "b", "c"]),
        );

        let report = broadcaster
            .broadcast(NoiseEvent {
                timestamp_ms: 1_000,
                peak_level: 60.0,
            })
            .await;

        assert_eq!(report.eligible, 2);
        let batch = &push.batches.lock().unwrap()[0];
        assert!(batch.contains(&"tok-a".to_string()));
        assert!(batch.contains(&"tok-b".to_string()));
        assert!(!batch.contains(&"tok-c".to_string()));
    }

    #[tokio::test]
    async fn cooldown_suppresses_then_allows() {
        let subs = registry();
        subscribe(&subs, "a", "tok-a", 10.0);
        let push = Arc::new(RecordingPush::new(vec![]));
        let broadcaster = Broadcaster::new(
            "Nursery",
            subs,
            ChannelRegistry::new(),
            push.clone(),
            trust_with(&["a"]),
        );

        let at = |ms| NoiseEvent {
            timestamp_ms: ms,
            peak_level: 60.0,
        };
        assert_eq!(broadcaster.broadcast(at(0)).await.eligible, 1);
        assert_eq!(broadcaster.broadcast(at(10_000)).await.eligible, 0);
        assert_eq!(broadcaster.broadcast(at(31_000)).await.eligible, 1);
    }

    #[tokio::test]
    async fn channel_only_subscriber_is_skipped_for_push() {
        let subs = registry();
        subscribe(&subs, "a", CHANNEL_ONLY_TOKEN, 10.0);
        let push = Arc::new(RecordingPush::new(vec![]));
        let broadcaster = Broadcaster::new(
            "Nursery",
            subs,
            ChannelRegistry::new(),
            push.clone(),
            trust_with(&["a"]),
        );

        let report = broadcaster
            .broadcast(NoiseEvent {
                timestamp_ms: 0,
                peak_level: 99.0,
            })
            .await;

        assert_eq!(report.skipped_offline, vec!["a".to_string()]);
        assert!(push.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_token_purges_subscription_and_stored_token() {
        let subs = registry();
        subscribe(&subs, "a", "dead-token", 10.0);
        let push = Arc::new(RecordingPush::new(vec!["dead-token".to_string()]));
        let trust = trust_with(&["a"]);
        let broadcaster = Broadcaster::new(
            "Nursery",
            subs.clone(),
            ChannelRegistry::new(),
            push,
            trust.clone(),
        );

        let report = broadcaster
            .broadcast(NoiseEvent {
                timestamp_ms: 0,
                peak_level: 99.0,
            })
            .await;

        assert_eq!(report.purged, vec!["a".to_string()]);
        assert!(subs.get("a", Utc::now()).is_none());
        assert_eq!(trust.get("a").unwrap().push_token, None);

        // Not retried on the next event until the peer re-subscribes.
        let report = broadcaster
            .broadcast(NoiseEvent {
                timestamp_ms: 60_000,
                peak_level: 99.0,
            })
            .await;
        assert_eq!(report.eligible, 0);
    }
}
