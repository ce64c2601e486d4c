//! Runtime configuration.
//!
//! Nothing here touches the filesystem unless [`DenoiseConfig::from_model_dir`]
//! is called. Values not present in `config.ini` keep their defaults.

use crate::{DcError, Result, FRAME_LENGTH, HOP_MS, SAMPLE_RATE, WINDOW_MS};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// File name of the optional configuration inside a model directory.
pub const CONFIG_FILE: &str = "config.ini";

/// Number of channels of the published weight sets: 45 / 1.414, floored.
pub const DEFAULT_MODEL_COMPLEXITY: usize = 31;
/// The only architecture depth with a defined layer table.
pub const DEFAULT_MODEL_DEPTH: usize = 20;

/// What to do with WAV input that has more than one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelPolicy {
    /// Average all channels of each sample frame into one mono sample.
    #[default]
    Downmix,
    /// Refuse the input with [`DcError::UnsupportedAudio`].
    Reject,
}

impl FromStr for ChannelPolicy {
    type Err = DcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "downmix" => Ok(ChannelPolicy::Downmix),
            "reject" => Ok(ChannelPolicy::Reject),
            other => Err(DcError::Config(format!(
                "unknown channel_policy '{}', expected downmix|reject",
                other
            ))),
        }
    }
}

/// How the final decoder stage bounds its output and how the mask is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaskArithmetic {
    /// Polar mask `tanh(|z|) · z / (|z| + ε)` with `|z|` the complex modulus,
    /// applied to the spectrogram by complex multiplication.
    #[default]
    Complex,
    /// Real and imaginary parts treated as independent reals: each component
    /// is bounded on its own and the mask multiplies component by component.
    RealView,
}

impl FromStr for MaskArithmetic {
    type Err = DcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "complex" => Ok(MaskArithmetic::Complex),
            "real_view" | "realview" => Ok(MaskArithmetic::RealView),
            other => Err(DcError::Config(format!(
                "unknown mask_arithmetic '{}', expected complex|real_view",
                other
            ))),
        }
    }
}

/// Everything the pipeline needs to know, constructed and validated by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct DenoiseConfig {
    /// Sample rate of input and output audio in Hz.
    pub sample_rate: usize,
    /// Samples per model invocation.
    pub frame_length: usize,
    /// Transform window length in milliseconds.
    pub window_ms: usize,
    /// Transform hop length in milliseconds.
    pub hop_ms: usize,
    /// Base channel count of the encoder/decoder stacks.
    pub model_complexity: usize,
    /// Total number of encoder + decoder stages.
    pub model_depth: usize,
    pub channel_policy: ChannelPolicy,
    pub mask_arithmetic: MaskArithmetic,
}

impl Default for DenoiseConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            frame_length: FRAME_LENGTH,
            window_ms: WINDOW_MS,
            hop_ms: HOP_MS,
            model_complexity: DEFAULT_MODEL_COMPLEXITY,
            model_depth: DEFAULT_MODEL_DEPTH,
            channel_policy: ChannelPolicy::default(),
            mask_arithmetic: MaskArithmetic::default(),
        }
    }
}

impl DenoiseConfig {
    /// Read `config.ini` from a model directory. A missing file yields the defaults.
    pub fn from_model_dir(model_dir: &Path) -> Result<Self> {
        let config_path = model_dir.join(CONFIG_FILE);
        if !config_path.exists() {
            log::debug!("No {} in {:?}, using defaults", CONFIG_FILE, model_dir);
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&config_path)?;
        let config = Self::from_ini_str(&content)?;
        log::debug!("Loaded {:?}: {:?}", config_path, config);
        Ok(config)
    }

    /// Parse INI text, applying every recognized key over the defaults.
    pub fn from_ini_str(content: &str) -> Result<Self> {
        let params = parse_ini(content);
        let mut config = Self::default();

        if let Some(v) = params.get("sample_rate") {
            config.sample_rate = parse_number("sample_rate", v)?;
        }
        if let Some(v) = params.get("frame_length") {
            config.frame_length = parse_number("frame_length", v)?;
        }
        if let Some(v) = params.get("window_ms") {
            config.window_ms = parse_number("window_ms", v)?;
        }
        if let Some(v) = params.get("hop_ms") {
            config.hop_ms = parse_number("hop_ms", v)?;
        }
        if let Some(v) = params.get("model_complexity") {
            config.model_complexity = parse_number("model_complexity", v)?;
        }
        if let Some(v) = params.get("model_depth") {
            config.model_depth = parse_number("model_depth", v)?;
        }
        if let Some(v) = params.get("channel_policy") {
            config.channel_policy = v.parse()?;
        }
        if let Some(v) = params.get("mask_arithmetic") {
            config.mask_arithmetic = v.parse()?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Transform window length in samples.
    pub fn n_fft(&self) -> usize {
        self.sample_rate * self.window_ms / 1000
    }

    /// Transform hop length in samples.
    pub fn hop_length(&self) -> usize {
        self.sample_rate * self.hop_ms / 1000
    }

    /// Duration of one frame in seconds.
    pub fn frame_seconds(&self) -> f64 {
        self.frame_length as f64 / self.sample_rate as f64
    }

    /// Check internal consistency. Architecture depth is checked when the model is built.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(DcError::Config("sample_rate must be positive".to_string()));
        }
        let n_fft = self.n_fft();
        let hop = self.hop_length();
        if n_fft < 2 || n_fft % 2 != 0 {
            return Err(DcError::Config(format!(
                "window of {} samples must be even and at least 2",
                n_fft
            )));
        }
        if hop == 0 || hop > n_fft {
            return Err(DcError::Config(format!(
                "hop of {} samples must be in 1..={}",
                hop, n_fft
            )));
        }
        // Centered frames reflect-pad n_fft/2 samples on each side
        if self.frame_length <= n_fft / 2 {
            return Err(DcError::Config(format!(
                "frame_length {} must exceed half the window ({})",
                self.frame_length,
                n_fft / 2
            )));
        }
        if self.model_complexity == 0 {
            return Err(DcError::Config("model_complexity must be positive".to_string()));
        }
        Ok(())
    }
}

fn parse_number(key: &str, value: &str) -> Result<usize> {
    value
        .parse::<usize>()
        .map_err(|e| DcError::Config(format!("{} = '{}': {}", key, value, e)))
}

/// Simple INI parser
pub(crate) fn parse_ini(content: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.starts_with('[') || line.starts_with('#') || line.starts_with(';') || line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_transform_geometry() {
        let config = DenoiseConfig::default();
        assert_eq!(config.n_fft(), 3072);
        assert_eq!(config.hop_length(), 768);
        assert_eq!(config.model_complexity, 31);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_ini_skips_sections_and_comments() {
        let params = parse_ini("[model]\n# comment\n; other\nmodel_depth = 20\n\nmask_arithmetic=real_view\n");
        assert_eq!(params.len(), 2);
        assert_eq!(params["model_depth"], "20");
        assert_eq!(params["mask_arithmetic"], "real_view");
    }

    #[test]
    fn test_from_ini_overrides() {
        let config = DenoiseConfig::from_ini_str(
            "[dcunet]\nmodel_complexity = 8\nchannel_policy = reject\nmask_arithmetic = real_view\n",
        )
        .unwrap();
        assert_eq!(config.model_complexity, 8);
        assert_eq!(config.channel_policy, ChannelPolicy::Reject);
        assert_eq!(config.mask_arithmetic, MaskArithmetic::RealView);
        assert_eq!(config.frame_length, FRAME_LENGTH);
    }

    #[test]
    fn test_from_ini_rejects_bad_values() {
        assert!(matches!(
            DenoiseConfig::from_ini_str("model_complexity = many"),
            Err(DcError::Config(_))
        ));
        assert!(matches!(
            DenoiseConfig::from_ini_str("channel_policy = left"),
            Err(DcError::Config(_))
        ));
        assert!(matches!(
            DenoiseConfig::from_ini_str("hop_ms = 0"),
            Err(DcError::Config(_))
        ));
    }

    #[test]
    fn test_missing_config_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = DenoiseConfig::from_model_dir(dir.path()).unwrap();
        assert_eq!(config, DenoiseConfig::default());
    }

    #[test]
    fn test_frame_must_cover_reflect_padding() {
        let config = DenoiseConfig {
            frame_length: 1536,
            ..DenoiseConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
