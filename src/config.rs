//! Engine configuration: the single struct through which every tunable
//! named in the component designs is reachable. No ambient globals.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloodProtectionConfig {
    pub per_second: u32,
    pub per_minute: u32,
    pub burst_size: u32,
    pub ban_duration_secs: u64,
    pub window_secs: u64,
}

impl Default for FloodProtectionConfig {
    fn default() -> Self {
        Self {
            per_second: 10,
            per_minute: 100,
            burst_size: 10,
            ban_duration_secs: 2 * 3600,
            window_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyLimitsConfig {
    pub burst_window_secs: u64,
    pub max_burst: u32,
    pub per_minute: u32,
    pub per_5min: u32,
    pub per_hour: u32,
    pub abuse_ban_secs: u64,
}

impl Default for EmergencyLimitsConfig {
    fn default() -> Self {
        Self {
            burst_window_secs: 10,
            max_burst: 2,
            per_minute: 5,
            per_5min: 10,
            per_hour: 20,
            abuse_ban_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub max_direct_peers: u32,
    pub max_hop_count: u8,
    pub message_ttl_seconds: u32,
    pub heartbeat_interval_seconds: u32,
    pub flood_protection: FloodProtectionConfig,
    pub emergency_limits: EmergencyLimitsConfig,

    pub max_concurrent_global: usize,
    pub channel_timeout_secs: u64,
    pub dedup_cache_cap: usize,
    pub normal_queue_cap: usize,
    pub emergency_queue_cap: usize,
    pub queue_tick_ms: u64,
    pub metrics_cleanup_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_direct_peers: 30,
            max_hop_count: 15,
            message_ttl_seconds: 600,
            heartbeat_interval_seconds: 120,
            flood_protection: FloodProtectionConfig::default(),
            emergency_limits: EmergencyLimitsConfig::default(),
            max_concurrent_global: 20,
            channel_timeout_secs: 300,
            dedup_cache_cap: 1000,
            normal_queue_cap: 500,
            emergency_queue_cap: 125,
            queue_tick_ms: 200,
            metrics_cleanup_secs: 300,
        }
    }
}

#[cfg(feature = "config-file")]
pub fn load_from_file(path: &str) -> Result<EngineConfig, config::ConfigError> {
    config::Config::builder()
        .add_source(config::File::with_name(path))
        .build()?
        .try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_surface() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_direct_peers, 30);
        assert_eq!(cfg.max_hop_count, 15);
        assert_eq!(cfg.normal_queue_cap, 500);
        assert_eq!(cfg.emergency_queue_cap, 125);
    }
}
