//! Runtime configuration.
//!
//! Compile-time defaults with environment overrides and a builder for
//! programmatic setup. Out-of-range values clamp silently to safe
//! bounds: the runtime never refuses to start over configuration.
//!
//! # Environment Variables
//!
//! - `SVCMUX_WORKERS` - worker thread count
//! - `SVCMUX_TABLE_BITS` - service table bucket-count exponent
//! - `SVCMUX_LOG_BUFFER` - log sink buffer size in bytes
//! - `SVCMUX_IDLE_LIMIT` - per-thread idle buffer-pool ceiling in bytes
//! - `SVCMUX_LOG_FILE` - log file path, or "stdout"/"stderr"

use svcmux_core::constants::MAX_WORKERS;
use svcmux_core::env::{env_get, env_get_str};
use svcmux_core::svc_warn;

mod defaults {
    pub const WORKERS: usize = 1;
    pub const TABLE_BITS: u8 = 10; // 2^10 = 1024 buckets
    pub const LOG_BUFFER: usize = 8 * 1024;
    pub const IDLE_LIMIT: usize = 256 * 1024;
    pub const LOG_FILE: &str = "stderr";
}

/// Runtime configuration with builder-style setters.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of worker threads
    pub workers: usize,
    /// Service table bucket count, as a power-of-two exponent
    pub table_size_bits: u8,
    /// Buffer size for the file log sink
    pub log_buffer_size: usize,
    /// Per-thread ceiling on idle buffer-pool memory
    pub idle_buffer_limit: usize,
    /// Log sink: "stdout", "stderr", or a file path
    pub log_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}

impl Config {
    /// Compile-time defaults, no environment lookups.
    pub fn new() -> Self {
        Config {
            workers: defaults::WORKERS,
            table_size_bits: defaults::TABLE_BITS,
            log_buffer_size: defaults::LOG_BUFFER,
            idle_buffer_limit: defaults::IDLE_LIMIT,
            log_file: defaults::LOG_FILE.to_string(),
        }
    }

    /// Defaults with `SVCMUX_*` environment overrides applied.
    pub fn from_env() -> Self {
        Config {
            workers: env_get("SVCMUX_WORKERS", defaults::WORKERS),
            table_size_bits: env_get("SVCMUX_TABLE_BITS", defaults::TABLE_BITS),
            log_buffer_size: env_get("SVCMUX_LOG_BUFFER", defaults::LOG_BUFFER),
            idle_buffer_limit: env_get("SVCMUX_IDLE_LIMIT", defaults::IDLE_LIMIT),
            log_file: env_get_str("SVCMUX_LOG_FILE", defaults::LOG_FILE),
        }
    }

    // Builder methods

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn table_size_bits(mut self, bits: u8) -> Self {
        self.table_size_bits = bits;
        self
    }

    pub fn log_buffer_size(mut self, n: usize) -> Self {
        self.log_buffer_size = n;
        self
    }

    pub fn idle_buffer_limit(mut self, n: usize) -> Self {
        self.idle_buffer_limit = n;
        self
    }

    pub fn log_file<S: Into<String>>(mut self, target: S) -> Self {
        self.log_file = target.into();
        self
    }

    /// Apply recognized command-line flags. Unknown flags are warned
    /// about and ignored.
    pub fn apply_args(mut self, args: &[String]) -> Self {
        let known = ["--workers", "--table-bits", "--log-file"];
        let mut i = 0;
        while i < args.len() {
            let (flag, inline) = match args[i].split_once('=') {
                Some((f, v)) => (f, Some(v.to_string())),
                None => (args[i].as_str(), None),
            };
            let value = match inline {
                Some(v) => Some(v),
                None if known.contains(&flag) && i + 1 < args.len() => {
                    let v = args[i + 1].clone();
                    i += 1;
                    Some(v)
                }
                None => None,
            };
            match flag {
                "--workers" => {
                    if let Some(v) = value.and_then(|v| v.parse().ok()) {
                        self.workers = v;
                    }
                }
                "--table-bits" => {
                    if let Some(v) = value.and_then(|v| v.parse().ok()) {
                        self.table_size_bits = v;
                    }
                }
                "--log-file" => {
                    if let Some(v) = value {
                        self.log_file = v;
                    }
                }
                other => svc_warn!("unrecognized argument {:?} ignored", other),
            }
            i += 1;
        }
        self
    }

    /// Clamp every field into its safe range.
    pub fn sanitize(mut self) -> Self {
        self.workers = self.workers.clamp(1, MAX_WORKERS);
        self.table_size_bits = self.table_size_bits.clamp(4, 24);
        self.log_buffer_size = self.log_buffer_size.max(4096);
        // round up to a whole number of 1 KiB blocks
        self.log_buffer_size = (self.log_buffer_size + 1023) & !1023;
        self.idle_buffer_limit = self.idle_buffer_limit.max(4096);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = Config::new().sanitize();
        assert_eq!(cfg.workers, 1);
        assert_eq!(cfg.table_size_bits, 10);
        assert_eq!(cfg.log_file, "stderr");
    }

    #[test]
    fn test_builder() {
        let cfg = Config::new().workers(4).log_file("stdout");
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.log_file, "stdout");
    }

    #[test]
    fn test_sanitize_clamps_silently() {
        let cfg = Config::new().workers(0).sanitize();
        assert_eq!(cfg.workers, 1);

        let cfg = Config::new().workers(10_000).sanitize();
        assert_eq!(cfg.workers, MAX_WORKERS);

        let cfg = Config::new().table_size_bits(0).sanitize();
        assert_eq!(cfg.table_size_bits, 4);

        let cfg = Config::new().log_buffer_size(10).sanitize();
        assert_eq!(cfg.log_buffer_size, 4096);
        assert_eq!(cfg.log_buffer_size % 1024, 0);
    }

    #[test]
    fn test_apply_args() {
        let args: Vec<String> = ["--workers", "3", "--log-file=stdout", "--bogus"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let cfg = Config::new().apply_args(&args);
        assert_eq!(cfg.workers, 3);
        assert_eq!(cfg.log_file, "stdout");
    }
}
