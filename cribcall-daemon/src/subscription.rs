//! Alert subscription registry
//!
//! One subscription per trusted peer, keyed by certificate fingerprint
//! with upsert semantics. Subscriptions carry a lease; expired entries
//! are dropped lazily at lookup and broadcast time — there is no
//! background sweep. Threshold and cooldown filtering happens here, and
//! `last_broadcast` is stamped at eligibility time so a slow delivery
//! cannot make the same event window eligible twice.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use cribcall_protocol::StreamType;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Token sentinel for peers with no viable push mechanism: channel
/// delivery only, events are missed while disconnected.
pub const CHANNEL_ONLY_TOKEN: &str = "websocket-only";

/// Smallest lease the server grants.
pub const MIN_LEASE_SECS: u64 = 60;

/// How an alert reaches a disconnected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryMode {
    /// No fallback: only the live control channel.
    ChannelOnly,
    /// Push provider token.
    Push { token: String, platform: String },
    /// Webhook URL handed to the push collaborator verbatim.
    Webhook { url: String },
}

impl DeliveryMode {
    /// Normalize the wire token into a typed mode. The `websocket-only`
    /// sentinel stays on the wire for compatibility but never leaks past
    /// this boundary.
    pub fn from_token(token: &str, platform: &str) -> Self {
        if token == CHANNEL_ONLY_TOKEN {
            DeliveryMode::ChannelOnly
        } else if token.starts_with("http://") || token.starts_with("https://") {
            DeliveryMode::Webhook {
                url: token.to_string(),
            }
        } else {
            DeliveryMode::Push {
                token: token.to_string(),
                platform: platform.to_string(),
            }
        }
    }

    /// The token to hand to the push collaborator, if any.
    pub fn push_token(&self) -> Option<&str> {
        match self {
            DeliveryMode::ChannelOnly => None,
            DeliveryMode::Push { token, .. } => Some(token),
            DeliveryMode::Webhook { url } => Some(url),
        }
    }
}

/// A live alert subscription.
#[derive(Debug, Clone)]
pub struct NoiseSubscription {
    pub subscription_id: String,
    pub fingerprint: String,
    pub delivery: DeliveryMode,
    /// Wire token as submitted (for unsubscribe/purge matching).
    pub raw_token: String,
    pub platform: String,
    pub expires_at: DateTime<Utc>,
    pub threshold: f64,
    pub cooldown_secs: u64,
    pub auto_stream_type: Option<StreamType>,
    pub auto_stream_duration_sec: Option<u64>,
    /// Event-clock timestamp of the last eligible broadcast.
    pub last_broadcast_ms: Option<i64>,
}

impl NoiseSubscription {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Subscribe request body (HTTPS side-channel). The caller identity is
/// the TLS peer fingerprint and never part of the body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub token: String,
    pub platform: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_stream_type: Option<StreamType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_stream_duration_sec: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_seconds: Option<u64>,
}

/// Subscribe response: granted lease (possibly clamped).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeAck {
    pub subscription_id: String,
    pub expires_at: DateTime<Utc>,
    pub lease_seconds: u64,
}

/// Unsubscribe request body: either identifier removes the subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
}

/// Registry defaults, sourced from daemon config.
#[derive(Debug, Clone)]
pub struct SubscriptionDefaults {
    pub threshold: f64,
    pub cooldown_secs: u64,
    pub lease_secs: u64,
    pub max_lease_secs: u64,
}

pub struct SubscriptionRegistry {
    defaults: SubscriptionDefaults,
    subscriptions: RwLock<HashMap<String, NoiseSubscription>>,
}

impl SubscriptionRegistry {
    pub fn new(defaults: SubscriptionDefaults) -> Self {
        Self {
            defaults,
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    /// Seed from the persistence collaborator's subscription list.
    pub fn with_subscriptions(
        defaults: SubscriptionDefaults,
        subscriptions: impl IntoIterator<Item = NoiseSubscription>,
    ) -> Self {
        let registry = Self::new(defaults);
        {
            let mut map = registry.subscriptions.write().unwrap();
            for sub in subscriptions {
                map.insert(sub.fingerprint.clone(), sub);
            }
        }
        registry
    }

    /// Create or refresh the subscription for a peer. A refresh keeps the
    /// cooldown history so re-subscribing cannot bypass the cooldown.
    pub fn upsert(&self, fingerprint: &str, request: &SubscribeRequest) -> SubscribeAck {
        self.upsert_at(fingerprint, request, Utc::now())
    }

    pub fn upsert_at(
        &self,
        fingerprint: &str,
        request: &SubscribeRequest,
        now: DateTime<Utc>,
    ) -> SubscribeAck {
        let lease_secs = request
            .lease_seconds
            .unwrap_or(self.defaults.lease_secs)
            .clamp(MIN_LEASE_SECS, self.defaults.max_lease_secs);
        let expires_at = now + Duration::seconds(lease_secs as i64);

        let mut subscriptions = self.subscriptions.write().unwrap();
        let previous = subscriptions.remove(fingerprint);
        let subscription = NoiseSubscription {
            subscription_id: previous
                .as_ref()
                .map(|p| p.subscription_id.clone())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            fingerprint: fingerprint.to_string(),
            delivery: DeliveryMode::from_token(&request.token, &request.platform),
            raw_token: request.token.clone(),
            platform: request.platform.clone(),
            expires_at,
            threshold: request.threshold.unwrap_or(self.defaults.threshold),
            cooldown_secs: request
                .cooldown_seconds
                .unwrap_or(self.defaults.cooldown_secs),
            auto_stream_type: request.auto_stream_type,
            auto_stream_duration_sec: request.auto_stream_duration_sec,
            last_broadcast_ms: previous.and_then(|p| p.last_broadcast_ms),
        };

        info!(
            peer = %fingerprint,
            subscription_id = %subscription.subscription_id,
            lease_secs,
            "subscription upserted"
        );

        let ack = SubscribeAck {
            subscription_id: subscription.subscription_id.clone(),
            expires_at,
            lease_seconds: lease_secs,
        };
        subscriptions.insert(fingerprint.to_string(), subscription);
        ack
    }

    /// Remove a peer's subscription by token or id. With no identifier
    /// given, the peer's subscription is removed unconditionally.
    pub fn unsubscribe(&self, fingerprint: &str, request: &UnsubscribeRequest) -> bool {
        let mut subscriptions = self.subscriptions.write().unwrap();
        let matches = match subscriptions.get(fingerprint) {
            Some(sub) => match (&request.token, &request.subscription_id) {
                (None, None) => true,
                (token, id) => {
                    token.as_deref() == Some(sub.raw_token.as_str())
                        || id.as_deref() == Some(sub.subscription_id.as_str())
                }
            },
            None => false,
        };
        if matches {
            subscriptions.remove(fingerprint);
            info!(peer = %fingerprint, "subscription removed");
        }
        matches
    }

    /// Current subscription for a peer, dropping it first if expired.
    pub fn get(&self, fingerprint: &str, now: DateTime<Utc>) -> Option<NoiseSubscription> {
        let mut subscriptions = self.subscriptions.write().unwrap();
        if let Some(sub) = subscriptions.get(fingerprint) {
            if sub.is_expired(now) {
                debug!(peer = %fingerprint, "subscription lease expired");
                subscriptions.remove(fingerprint);
                return None;
            }
            return Some(sub.clone());
        }
        None
    }

    /// Snapshot of unexpired subscriptions, lazily dropping expired ones.
    pub fn active(&self, now: DateTime<Utc>) -> Vec<NoiseSubscription> {
        let mut subscriptions = self.subscriptions.write().unwrap();
        subscriptions.retain(|fingerprint, sub| {
            let keep = !sub.is_expired(now);
            if !keep {
                debug!(peer = %fingerprint, "subscription lease expired");
            }
            keep
        });
        subscriptions.values().cloned().collect()
    }

    /// Subscriptions eligible for an event: lease unexpired, peak at or
    /// above threshold, cooldown window elapsed. `last_broadcast` is
    /// stamped here, at the moment of eligibility, not after delivery.
    pub fn eligible(
        &self,
        timestamp_ms: i64,
        peak_level: f64,
        now: DateTime<Utc>,
    ) -> Vec<NoiseSubscription> {
        let mut subscriptions = self.subscriptions.write().unwrap();
        subscriptions.retain(|_, sub| !sub.is_expired(now));

        let mut eligible = Vec::new();
        for sub in subscriptions.values_mut() {
            if peak_level < sub.threshold {
                continue;
            }
            let cooled_down = match sub.last_broadcast_ms {
                Some(last) => timestamp_ms - last >= (sub.cooldown_secs as i64) * 1000,
                None => true,
            };
            if !cooled_down {
                continue;
            }
            sub.last_broadcast_ms = Some(timestamp_ms);
            eligible.push(sub.clone());
        }
        eligible
    }

    /// Drop the subscription whose delivery token the push provider
    /// reported invalid. Returns the affected fingerprint.
    pub fn purge_token(&self, token: &str) -> Option<String> {
        let mut subscriptions = self.subscriptions.write().unwrap();
        let fingerprint = subscriptions
            .iter()
            .find(|(_, sub)| sub.delivery.push_token() == Some(token))
            .map(|(fp, _)| fp.clone());
        if let Some(fp) = &fingerprint {
            subscriptions.remove(fp);
            info!(peer = %fp, "subscription purged (invalid push token)");
        }
        fingerprint
    }

    /// Drop a peer's subscription (unpair).
    pub fn purge_fingerprint(&self, fingerprint: &str) {
        if self
            .subscriptions
            .write()
            .unwrap()
            .remove(fingerprint)
            .is_some()
        {
            info!(peer = %fingerprint, "subscription purged (peer removed)");
        }
    }

    /// Update the push token of an existing subscription in place
    /// (push-token rotation via the control channel).
    pub fn update_push_token(&self, fingerprint: &str, token: &str, platform: &str) -> bool {
        let mut subscriptions = self.subscriptions.write().unwrap();
        match subscriptions.get_mut(fingerprint) {
            Some(sub) => {
                sub.delivery = DeliveryMode::from_token(token, platform);
                sub.raw_token = token.to_string();
                sub.platform = platform.to_string();
                true
            }
            None => false,
        }
    }
}

/// Subscriber-side renewal schedule: half the remaining lease, clamped
/// to [1 s, 86 400 s].
pub fn renewal_delay(lease_remaining: std::time::Duration) -> std::time::Duration {
    let half = lease_remaining / 2;
    half.clamp(
        std::time::Duration::from_secs(1),
        std::time::Duration::from_secs(86_400),
    )
}
