//! Channel failure classification
//!
//! Turns raw transport error text into a `{kind, message}` pair so
//! presentation layers can render kind-specific guidance instead of raw
//! exceptions. The classification is an advisory string heuristic; the
//! transports in this workspace emit the canonical phrases, so in-repo
//! classification is deterministic, while foreign error text degrades to
//! `Transport`/`Unknown`.

use serde::Serialize;

/// Outward-facing failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    FingerprintMismatch,
    UntrustedClient,
    ProtocolViolation,
    Timeout,
    Transport,
    Closed,
    Unknown,
}

/// A classified channel failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classify an error message by inspecting its text.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        let kind = if lower.contains("fingerprint mismatch") {
            FailureKind::FingerprintMismatch
        } else if lower.contains("untrusted") {
            FailureKind::UntrustedClient
        } else if lower.contains("protocol") {
            FailureKind::ProtocolViolation
        } else if lower.contains("timeout") || lower.contains("timed out") || lower.contains("idle")
        {
            FailureKind::Timeout
        } else if lower.contains("closed") {
            FailureKind::Closed
        } else if lower.contains("error") {
            FailureKind::Transport
        } else {
            FailureKind::Unknown
        };

        Self { kind, message }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_phrases_classify() {
        let cases = [
            (
                "fingerprint mismatch: expected aa, got bb",
                FailureKind::FingerprintMismatch,
            ),
            ("untrusted client: ffee", FailureKind::UntrustedClient),
            (
                "protocol violation: disallowed message type",
                FailureKind::ProtocolViolation,
            ),
            ("idle timeout", FailureKind::Timeout),
            ("TLS handshake with 1.2.3.4: timed out", FailureKind::Timeout),
            ("connection closed: bye", FailureKind::Closed),
            ("IO error: broken pipe", FailureKind::Transport),
            ("strange things happened", FailureKind::Unknown),
        ];
        for (text, expected) in cases {
            assert_eq!(Failure::classify(text).kind, expected, "{text}");
        }
    }

    #[test]
    fn message_is_preserved() {
        let failure = Failure::classify("untrusted client: ffee");
        assert_eq!(failure.message, "untrusted client: ffee");
    }
}
