use crate::driver::BoundaryPolicy;
use crate::switch;

/// Default size of the native code reservation.
pub const DEFAULT_CODE_SIZE: usize = 128 * 1024 * 1024;

pub const ENV_ENABLED: &str = "PD_JIT";
pub const ENV_CODE_SIZE: &str = "PD_JIT_CODE_SIZE";
pub const ENV_HOT_THRESHOLD: &str = "PD_JIT_HOT_THRESHOLD";
pub const ENV_MAX_SEGMENT: &str = "PD_JIT_MAX_SEGMENT";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JitConfig {
    pub enabled: bool,
    /// Bytes reserved for native code. Fixed for the life of the buffer.
    pub code_size: usize,
    /// Executions of a block leader before it is translated.
    pub hot_threshold: u32,
    pub max_segment_instructions: usize,
    pub max_segment_bytes: usize,
    /// Alignment of each segment's first native byte.
    pub segment_align: usize,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            enabled: switch::native_supported(),
            code_size: DEFAULT_CODE_SIZE,
            hot_threshold: 2,
            max_segment_instructions: 256,
            max_segment_bytes: 64 * 1024,
            segment_align: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
}

impl JitConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from defaults overridden by `lookup(key)` for each `PD_JIT*` key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = JitConfig::default();
        if let Some(value) = lookup(ENV_ENABLED) {
            config.enabled = parse_switch(ENV_ENABLED, &value)?;
        }
        if let Some(value) = lookup(ENV_CODE_SIZE) {
            config.code_size = parse_size(ENV_CODE_SIZE, &value)?;
        }
        if let Some(value) = lookup(ENV_HOT_THRESHOLD) {
            config.hot_threshold = parse_number(ENV_HOT_THRESHOLD, &value)?;
            if config.hot_threshold == 0 {
                return Err(invalid(ENV_HOT_THRESHOLD, &value, "must be at least 1"));
            }
        }
        if let Some(value) = lookup(ENV_MAX_SEGMENT) {
            config.max_segment_instructions = parse_number(ENV_MAX_SEGMENT, &value)?;
            if config.max_segment_instructions == 0 {
                return Err(invalid(ENV_MAX_SEGMENT, &value, "must be at least 1"));
            }
        }
        Ok(config)
    }

    pub fn boundary_policy(&self) -> BoundaryPolicy {
        BoundaryPolicy {
            max_instructions: self.max_segment_instructions,
            max_code_bytes: self.max_segment_bytes,
        }
    }
}

fn invalid(key: &'static str, value: &str, reason: &'static str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason,
    }
}

fn parse_switch(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "on" | "true" | "yes" => Ok(true),
        "0" | "off" | "false" | "no" => Ok(false),
        _ => Err(invalid(key, value, "expected on/off")),
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| invalid(key, value, "expected an unsigned integer"))
}

/// Parses a byte count with an optional `k`, `m` or `g` suffix.
pub fn parse_size(key: &'static str, value: &str) -> Result<usize, ConfigError> {
    let text = value.trim().to_ascii_lowercase();
    let (digits, scale) = match text.char_indices().last() {
        Some((at, 'k')) => (&text[..at], 1usize << 10),
        Some((at, 'm')) => (&text[..at], 1usize << 20),
        Some((at, 'g')) => (&text[..at], 1usize << 30),
        _ => (text.as_str(), 1),
    };
    let base: usize = digits
        .trim()
        .parse()
        .map_err(|_| invalid(key, value, "expected a byte count like 4096, 64k or 128m"))?;
    let size = base
        .checked_mul(scale)
        .ok_or_else(|| invalid(key, value, "size overflows"))?;
    if size == 0 {
        return Err(invalid(key, value, "must be greater than zero"));
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_reserve_128_mib() {
        let config = JitConfig::from_lookup(lookup(&[])).expect("config");
        assert_eq!(config.code_size, 128 * 1024 * 1024);
        assert_eq!(config.enabled, switch::native_supported());
    }

    #[test]
    fn env_keys_override_defaults() {
        let config = JitConfig::from_lookup(lookup(&[
            ("PD_JIT", "off"),
            ("PD_JIT_CODE_SIZE", "64k"),
            ("PD_JIT_HOT_THRESHOLD", "5"),
            ("PD_JIT_MAX_SEGMENT", "12"),
        ]))
        .expect("config");
        assert!(!config.enabled);
        assert_eq!(config.code_size, 64 * 1024);
        assert_eq!(config.hot_threshold, 5);
        assert_eq!(config.boundary_policy().max_instructions, 12);
    }

    #[test]
    fn size_suffixes() {
        assert_eq!(parse_size("k", "4096"), Ok(4096));
        assert_eq!(parse_size("k", "2M"), Ok(2 * 1024 * 1024));
        assert_eq!(parse_size("k", " 1g "), Ok(1 << 30));
        assert!(parse_size("k", "0").is_err());
        assert!(parse_size("k", "12q").is_err());
        assert!(parse_size("k", "m").is_err());
    }

    #[test]
    fn rejects_bad_values() {
        let err = JitConfig::from_lookup(lookup(&[("PD_JIT", "maybe")])).expect_err("bad switch");
        assert_eq!(
            err.to_string(),
            "invalid value 'maybe' for PD_JIT: expected on/off"
        );
        assert!(JitConfig::from_lookup(lookup(&[("PD_JIT_HOT_THRESHOLD", "0")])).is_err());
        assert!(JitConfig::from_lookup(lookup(&[("PD_JIT_MAX_SEGMENT", "-3")])).is_err());
    }
}
