//! Centralized configuration for Spindrift.
//!
//! All tunable parameters are defined here to avoid hard-coded values
//! scattered throughout the codebase.

use std::time::Duration;

/// Central configuration for all Spindrift components.
///
/// Groups related settings into logical sections and supports environment
/// variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct SpindriftConfig {
    pub torrent: TorrentConfig,
    pub stream: StreamConfig,
}

/// Download scheduling and peer lifecycle configuration.
#[derive(Debug, Clone)]
pub struct TorrentConfig {
    /// Per-peer cap on outstanding block requests
    pub max_in_flight: usize,
    /// Per-request timeout before a block is reclaimed
    pub request_timeout: Duration,
    /// Minimum spacing between resync passes
    pub resync_interval: Duration,
    /// How many missing-list slots ahead of the playback head resync inspects
    pub resync_window: usize,
    /// Below this many remaining pieces, idle peers duplicate-request
    pub force_threshold: usize,
    /// Tail slots excluded from the lookahead cap while many pieces remain
    pub tail_reserve: usize,
    /// Averaging window for per-peer speed estimates
    pub speed_window: Duration,
    /// Handshake deadline before a connection is destroyed
    pub handshake_timeout: Duration,
    /// Choke deadline before a connection is destroyed under queue pressure
    pub choke_timeout: Duration,
    /// Maximum concurrent peer connections
    pub max_peer_connections: usize,
    /// Heartbeat period driving maintenance and timeout expiry
    pub heartbeat_interval: Duration,
    /// Request-timeout strikes before a peer is disconnected
    pub timeout_strike_limit: u32,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 5,
            request_timeout: Duration::from_secs(30),
            resync_interval: Duration::from_secs(2),
            resync_window: 10,
            force_threshold: 30,
            tail_reserve: 30,
            // Shares the resync time base so the speed floor
            // (2 blocks per interval) compares like with like.
            speed_window: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(10),
            choke_timeout: Duration::from_secs(30),
            max_peer_connections: 50,
            heartbeat_interval: Duration::from_millis(500),
            timeout_strike_limit: 2,
        }
    }
}

/// Streaming reader configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Bytes of lookahead that must be complete before output proceeds
    pub buffer_bytes: u64,
    /// How long a reader may wait for the buffer before reporting a stall
    pub stall_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_bytes: 1_500_000,
            stall_timeout: Duration::from_secs(30),
        }
    }
}

impl StreamConfig {
    /// Lookahead window in pieces for a given piece length.
    pub fn lookahead_pieces(&self, piece_length: u32) -> u64 {
        self.buffer_bytes.div_ceil(piece_length.max(1) as u64)
    }
}

impl SpindriftConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime tuning via `SPINDRIFT_*` variables while keeping
    /// sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(max_peers) = std::env::var("SPINDRIFT_MAX_PEERS") {
            if let Ok(count) = max_peers.parse::<usize>() {
                config.torrent.max_peer_connections = count;
            }
        }

        if let Ok(timeout) = std::env::var("SPINDRIFT_REQUEST_TIMEOUT") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.torrent.request_timeout = Duration::from_secs(seconds);
            }
        }

        if let Ok(buffer) = std::env::var("SPINDRIFT_BUFFER_BYTES") {
            if let Ok(bytes) = buffer.parse::<u64>() {
                config.stream.buffer_bytes = bytes;
            }
        }

        if let Ok(stall) = std::env::var("SPINDRIFT_STALL_TIMEOUT") {
            if let Ok(seconds) = stall.parse::<u64>() {
                config.stream.stall_timeout = Duration::from_secs(seconds);
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = SpindriftConfig::default();

        assert_eq!(config.torrent.max_in_flight, 5);
        assert_eq!(config.torrent.request_timeout, Duration::from_secs(30));
        assert_eq!(config.torrent.resync_interval, Duration::from_secs(2));
        assert_eq!(config.torrent.force_threshold, 30);
        assert_eq!(config.torrent.max_peer_connections, 50);
        assert_eq!(config.stream.buffer_bytes, 1_500_000);
        assert_eq!(config.stream.stall_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_lookahead_pieces_rounds_up() {
        let stream = StreamConfig::default();
        assert_eq!(stream.lookahead_pieces(1_048_576), 2);
        assert_eq!(stream.lookahead_pieces(262_144), 6);
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("SPINDRIFT_MAX_PEERS", "80");
            std::env::set_var("SPINDRIFT_BUFFER_BYTES", "4000000");
        }

        let config = SpindriftConfig::from_env();
        assert_eq!(config.torrent.max_peer_connections, 80);
        assert_eq!(config.stream.buffer_bytes, 4_000_000);

        unsafe {
            std::env::remove_var("SPINDRIFT_MAX_PEERS");
            std::env::remove_var("SPINDRIFT_BUFFER_BYTES");
        }
    }
}
