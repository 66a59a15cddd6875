//! Configuration surface (spec §6 "Configuration").

use std::time::Duration;

/// Mutable, running-time-adjustable configuration for a presentation.
///
/// Mirrors the teacher's `DownloaderConfig` shape: a plain struct with a
/// `Default` impl and a `builder()` entry point, constructed once and then
/// read from multiple contexts (most fields are read-mostly after startup;
/// the watermark and bandwidth fields are explicitly mutable while running
/// per spec §6 and are therefore exposed through setters rather than
/// plain field mutation so a future caller can add change notification).
#[derive(Debug, Clone)]
pub struct DemuxerConfig {
    /// Connection speed hint in bits per second; 0 means auto-detect from
    /// observed bandwidth.
    connection_speed_bps: u64,

    /// Target fraction of observed bandwidth to budget for a rendition
    /// (0.0..=1.0).
    bandwidth_target_ratio: f64,

    min_bitrate_bps: u64,
    max_bitrate_bps: u64,

    /// Hard ceiling on buffered duration per track before backpressure
    /// kicks in.
    max_buffering_time: Duration,

    /// 0 disables the time-based watermark (fragment-count watermark takes
    /// over).
    high_watermark_time: Duration,
    low_watermark_time: Duration,

    /// 0.0 disables the fragment-count watermark.
    high_watermark_fragments: f64,
    low_watermark_fragments: f64,

    /// Retry policy applied to fragment downloads and manifest refreshes.
    pub retry: crate::retry::RetryPolicy,
}

impl Default for DemuxerConfig {
    fn default() -> Self {
        Self {
            connection_speed_bps: 0,
            bandwidth_target_ratio: 0.8,
            min_bitrate_bps: 0,
            max_bitrate_bps: 0,
            max_buffering_time: Duration::from_secs(30),
            high_watermark_time: Duration::ZERO,
            low_watermark_time: Duration::ZERO,
            high_watermark_fragments: 0.0,
            low_watermark_fragments: 0.0,
            retry: crate::retry::RetryPolicy::default(),
        }
    }
}

impl DemuxerConfig {
    pub fn builder() -> DemuxerConfigBuilder {
        DemuxerConfigBuilder::new()
    }

    pub fn connection_speed_bps(&self) -> u64 {
        self.connection_speed_bps
    }

    pub fn set_connection_speed_bps(&mut self, bps: u64) {
        self.connection_speed_bps = bps;
    }

    pub fn bandwidth_target_ratio(&self) -> f64 {
        self.bandwidth_target_ratio
    }

    pub fn set_bandwidth_target_ratio(&mut self, ratio: f64) {
        self.bandwidth_target_ratio = ratio.clamp(0.0, 1.0);
    }

    pub fn bitrate_range_bps(&self) -> (u64, u64) {
        (self.min_bitrate_bps, self.max_bitrate_bps)
    }

    pub fn set_bitrate_range_bps(&mut self, min: u64, max: u64) {
        self.min_bitrate_bps = min;
        self.max_bitrate_bps = max;
    }

    pub fn max_buffering_time(&self) -> Duration {
        self.max_buffering_time
    }

    pub fn set_max_buffering_time(&mut self, d: Duration) {
        self.max_buffering_time = d;
    }

    pub fn watermark_times(&self) -> (Duration, Duration) {
        (self.low_watermark_time, self.high_watermark_time)
    }

    pub fn set_watermark_times(&mut self, low: Duration, high: Duration) {
        self.low_watermark_time = low;
        self.high_watermark_time = high;
    }

    pub fn watermark_fragments(&self) -> (f64, f64) {
        (self.low_watermark_fragments, self.high_watermark_fragments)
    }

    pub fn set_watermark_fragments(&mut self, low: f64, high: f64) {
        self.low_watermark_fragments = low;
        self.high_watermark_fragments = high;
    }

    /// Whether the time-based watermark is enabled (non-zero high
    /// watermark); per spec §6, 0 means disabled/auto.
    pub fn time_watermark_enabled(&self) -> bool {
        self.high_watermark_time > Duration::ZERO
    }

    pub fn fragment_watermark_enabled(&self) -> bool {
        self.high_watermark_fragments > 0.0
    }
}

#[derive(Debug, Default)]
pub struct DemuxerConfigBuilder {
    config: DemuxerConfig,
}

impl DemuxerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: DemuxerConfig::default(),
        }
    }

    pub fn connection_speed_bps(mut self, bps: u64) -> Self {
        self.config.connection_speed_bps = bps;
        self
    }

    pub fn bandwidth_target_ratio(mut self, ratio: f64) -> Self {
        self.config.bandwidth_target_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn bitrate_range_bps(mut self, min: u64, max: u64) -> Self {
        self.config.min_bitrate_bps = min;
        self.config.max_bitrate_bps = max;
        self
    }

    pub fn max_buffering_time(mut self, d: Duration) -> Self {
        self.config.max_buffering_time = d;
        self
    }

    pub fn watermark_times(mut self, low: Duration, high: Duration) -> Self {
        self.config.low_watermark_time = low;
        self.config.high_watermark_time = high;
        self
    }

    pub fn watermark_fragments(mut self, low: f64, high: f64) -> Self {
        self.config.low_watermark_fragments = low;
        self.config.high_watermark_fragments = high;
        self
    }

    pub fn retry(mut self, policy: crate::retry::RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn build(self) -> DemuxerConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_set_get() {
        let mut cfg = DemuxerConfig::default();
        cfg.set_connection_speed_bps(5_000_000);
        assert_eq!(cfg.connection_speed_bps(), 5_000_000);

        cfg.set_bandwidth_target_ratio(0.5);
        assert_eq!(cfg.bandwidth_target_ratio(), 0.5);

        cfg.set_watermark_times(Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(
            cfg.watermark_times(),
            (Duration::from_secs(1), Duration::from_secs(5))
        );
        assert!(cfg.time_watermark_enabled());
    }

    #[test]
    fn builder_produces_expected_config() {
        let cfg = DemuxerConfig::builder()
            .connection_speed_bps(1_000_000)
            .bandwidth_target_ratio(0.9)
            .bitrate_range_bps(100_000, 8_000_000)
            .max_buffering_time(Duration::from_secs(60))
            .build();
        assert_eq!(cfg.connection_speed_bps(), 1_000_000);
        assert_eq!(cfg.bandwidth_target_ratio(), 0.9);
        assert_eq!(cfg.bitrate_range_bps(), (100_000, 8_000_000));
        assert_eq!(cfg.max_buffering_time(), Duration::from_secs(60));
    }

    #[test]
    fn disabled_watermarks_default_off() {
        let cfg = DemuxerConfig::default();
        assert!(!cfg.time_watermark_enabled());
        assert!(!cfg.fragment_watermark_enabled());
    }
}
