//! CribCall monitor daemon
//!
//! Hosts the monitor side of the CribCall protocol: control channels to
//! paired remotes, the alert subscription/broadcast engine with push
//! fallback, and the HTTPS pairing/subscription side-channel.

pub mod api;
pub mod broadcast;
pub mod channel;
pub mod config;
pub mod events;
pub mod failure;
pub mod http;
pub mod push;
pub mod registry;
pub mod server;
pub mod subscription;

pub use broadcast::{BroadcastReport, Broadcaster, NoiseEvent};
pub use channel::{ChannelState, ControlChannel, InboundMessage};
pub use config::DaemonConfig;
pub use events::DaemonEvent;
pub use failure::{Failure, FailureKind};
pub use push::{NoopPushSender, PushOutcome, PushSender};
pub use registry::ChannelRegistry;
pub use server::MonitorServer;
pub use subscription::{
    NoiseSubscription, SubscribeAck, SubscribeRequest, SubscriptionRegistry, UnsubscribeRequest,
};
