//! Configuration validation

use super::*;
use crate::kernel::builtin::LINE_BYTES;
use crate::util::region::WORD_BYTES;
use anyhow::Result;

/// Validate complete configuration
pub fn validate_config(config: &BenchmarkConfig) -> Result<()> {
    if config.duration_ms == 0 {
        anyhow::bail!("duration_ms must be greater than 0");
    }
    if config.large_region_threshold == 0 {
        anyhow::bail!("large_region_threshold must be greater than 0");
    }

    validate_timer(&config.timer)?;
    validate_latency(&config.latency)?;
    validate_load(&config.load)?;

    Ok(())
}

/// Validate timer configuration
pub fn validate_timer(timer: &TimerConfig) -> Result<()> {
    if timer.ticks_per_ms == Some(0) {
        anyhow::bail!("timer.ticks_per_ms must be greater than 0");
    }
    if timer.ticks_per_ms.is_none() && timer.source == TimerSource::Tsc && timer.calibration_ms == 0 {
        anyhow::bail!("timer.calibration_ms must be greater than 0 when ticks_per_ms is not set");
    }
    #[cfg(not(target_arch = "x86_64"))]
    if timer.source == TimerSource::Tsc {
        anyhow::bail!("timer.source = \"tsc\" is only available on x86_64");
    }
    Ok(())
}

/// Validate latency configuration
pub fn validate_latency(latency: &LatencyConfig) -> Result<()> {
    if latency.unroll == 0 {
        anyhow::bail!("latency.unroll must be greater than 0");
    }
    if latency.random_passes_per_call == 0 {
        anyhow::bail!("latency.random_passes_per_call must be greater than 0");
    }
    if latency.bytes_per_pass == 0 || latency.bytes_per_pass % WORD_BYTES as u64 != 0 {
        anyhow::bail!(
            "latency.bytes_per_pass must be a non-zero multiple of {}, got {}",
            WORD_BYTES,
            latency.bytes_per_pass
        );
    }
    if latency.chase_window_bytes == 0 || latency.chase_window_bytes % LINE_BYTES as u64 != 0 {
        anyhow::bail!(
            "latency.chase_window_bytes must be a non-zero multiple of {}, got {}",
            LINE_BYTES,
            latency.chase_window_bytes
        );
    }
    Ok(())
}

/// Validate load configuration
pub fn validate_load(load: &LoadConfig) -> Result<()> {
    if load.unroll == 0 {
        anyhow::bail!("load.unroll must be greater than 0");
    }
    if load.passes_per_call == 0 {
        anyhow::bail!("load.passes_per_call must be greater than 0");
    }
    if load.bytes_per_pass == 0 || load.bytes_per_pass % WORD_BYTES as u64 != 0 {
        anyhow::bail!(
            "load.bytes_per_pass must be a non-zero multiple of {}, got {}",
            WORD_BYTES,
            load.bytes_per_pass
        );
    }
    if load.bytes_per_pass.checked_mul(load.passes_per_call).is_none() {
        anyhow::bail!("load.bytes_per_pass * load.passes_per_call overflows");
    }
    Ok(())
}

/// Validate that a region of `len` bytes suits the configured load window
pub fn validate_load_region(load: &LoadConfig, len: u64) -> Result<()> {
    let bytes_per_call = load.bytes_per_pass.saturating_mul(load.passes_per_call);
    if len == 0 || len % bytes_per_call != 0 {
        anyhow::bail!(
            "per-thread region of {} bytes must be a non-zero multiple of {} bytes (bytes_per_pass * passes_per_call)",
            len,
            bytes_per_call
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&BenchmarkConfig::default()).is_ok());
    }

    #[test]
    fn test_zero_duration() {
        let config = BenchmarkConfig {
            duration_ms: 0,
            ..Default::default()
        };
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("duration_ms"));
    }

    #[test]
    fn test_zero_unroll() {
        let mut config = BenchmarkConfig::default();
        config.load.unroll = 0;
        assert!(validate_config(&config).unwrap_err().to_string().contains("load.unroll"));

        let mut config = BenchmarkConfig::default();
        config.latency.unroll = 0;
        assert!(validate_config(&config).unwrap_err().to_string().contains("latency.unroll"));
    }

    #[test]
    fn test_bytes_per_pass_alignment() {
        let mut config = BenchmarkConfig::default();
        config.load.bytes_per_pass = 100;
        assert!(validate_config(&config).is_err());

        config.load.bytes_per_pass = 128;
        assert!(validate_config(&config).is_ok());

        config.latency.bytes_per_pass = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_chase_window() {
        let mut config = BenchmarkConfig::default();
        config.latency.chase_window_bytes = 100;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_timer() {
        let mut config = BenchmarkConfig::default();
        config.timer.ticks_per_ms = Some(0);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_load_region() {
        let load = LoadConfig::default();
        assert!(validate_load_region(&load, 64 * 4096).is_ok());
        assert!(validate_load_region(&load, 0).is_err());
        assert!(validate_load_region(&load, 6144).is_err());
    }
}
