//! Typed configuration for a [`crate::facade::Node`], with the defaults
//! enumerated in the wire-level configuration table.
//!
//! Grounded on the teacher's habit of a plain `#[derive(Debug, Clone)]`
//! config struct with a hand-written `Default` impl (rather than a
//! `config`-crate layered loader, which this corpus doesn't reach for at the
//! library level — loading from files/env is a host-application concern,
//! out of scope here per the non-goals).

use std::time::Duration;

/// Tunables for a single [`crate::facade::Node`] instance.
///
/// Construct via [`NodeConfig::default`] and override fields directly, or
/// use [`NodeBuilder`] for a fluent construction style.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// How long a per-pair connection attempt may stay in a non-CONNECTED
    /// state before it's force-closed into `TIMEOUT`.
    pub p2p_connection_timeout: Duration,
    /// How long an incomplete multipart reassembly buffer survives before
    /// being discarded.
    pub multipart_msg_timeout: Duration,
    /// Whether an involuntary broker disconnect triggers automatic
    /// reconnection attempts.
    pub reconnection: bool,
    /// Ceiling on reconnection attempts. `None` means unbounded.
    pub max_reconnection_attempts: Option<u32>,
    /// Delay between successive reconnection attempts.
    pub reconnection_delta: Duration,
    /// Base-level logging enabled (maps to a `tracing` `INFO` filter).
    pub logging_enable_base: bool,
    /// Debug-level logging enabled (maps to a `tracing` `DEBUG` filter).
    pub logging_enable_debug: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            p2p_connection_timeout: Duration::from_millis(30_000),
            multipart_msg_timeout: Duration::from_millis(60_000),
            reconnection: true,
            max_reconnection_attempts: None,
            reconnection_delta: Duration::from_millis(2_000),
            logging_enable_base: false,
            logging_enable_debug: false,
        }
    }
}

impl NodeConfig {
    /// The `tracing` filter directive implied by the logging flags, or
    /// `None` if both are disabled (the caller installs no subscriber).
    pub fn tracing_filter(&self) -> Option<&'static str> {
        if self.logging_enable_debug {
            Some("debug")
        } else if self.logging_enable_base {
            Some("info")
        } else {
            None
        }
    }
}

/// Outbound payload chunk size, in bytes. Not exposed as configuration: no
/// crate in the corpus promotes internal backpressure constants to public
/// config, so this stays a crate constant.
pub const PAYLOAD_CHUNK_BYTES: usize = 15_000;

/// Data-channel send watermark, in bytes, above which the outbound sender
/// busy-waits before enqueuing the next frame.
pub const MAX_BUFFERED_AMOUNT: u64 = 512 * 1024;

/// Fluent builder for [`NodeConfig`].
///
/// This is an in-language ergonomic builder, not a host-language-facing FFI
/// facade (those are explicitly out of scope).
#[derive(Debug, Clone, Default)]
pub struct NodeBuilder {
    config: NodeConfig,
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn p2p_connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.p2p_connection_timeout = timeout;
        self
    }

    pub fn multipart_msg_timeout(mut self, timeout: Duration) -> Self {
        self.config.multipart_msg_timeout = timeout;
        self
    }

    pub fn reconnection(mut self, enabled: bool) -> Self {
        self.config.reconnection = enabled;
        self
    }

    pub fn max_reconnection_attempts(mut self, attempts: Option<u32>) -> Self {
        self.config.max_reconnection_attempts = attempts;
        self
    }

    pub fn reconnection_delta(mut self, delta: Duration) -> Self {
        self.config.reconnection_delta = delta;
        self
    }

    pub fn logging(mut self, enable_base: bool, enable_debug: bool) -> Self {
        self.config.logging_enable_base = enable_base;
        self.config.logging_enable_debug = enable_debug;
        self
    }

    pub fn build(self) -> NodeConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.p2p_connection_timeout, Duration::from_millis(30_000));
        assert_eq!(cfg.multipart_msg_timeout, Duration::from_millis(60_000));
        assert!(cfg.reconnection);
        assert_eq!(cfg.max_reconnection_attempts, None);
        assert_eq!(cfg.reconnection_delta, Duration::from_millis(2_000));
        assert!(!cfg.logging_enable_base);
        assert!(!cfg.logging_enable_debug);
    }

    #[test]
    fn builder_overrides_individual_fields() {
        let cfg = NodeBuilder::new()
            .max_reconnection_attempts(Some(3))
            .reconnection_delta(Duration::from_millis(500))
            .logging(true, false)
            .build();
        assert_eq!(cfg.max_reconnection_attempts, Some(3));
        assert_eq!(cfg.reconnection_delta, Duration::from_millis(500));
        assert_eq!(cfg.tracing_filter(), Some("info"));
    }

    #[test]
    fn tracing_filter_prefers_debug() {
        let cfg = NodeBuilder::new().logging(true, true).build();
        assert_eq!(cfg.tracing_filter(), Some("debug"));
        let cfg = NodeBuilder::new().logging(false, false).build();
        assert_eq!(cfg.tracing_filter(), None);
    }
}
