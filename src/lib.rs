//! # DCUNet-RT
//!
//! Offline speech denoising with a 20-stage Deep Complex U-Net (DCUNet-20).
//!
//! A noisy waveform is cut into fixed-length frames, each frame is turned into a
//! complex spectrogram, the network predicts a bounded complex mask, and the
//! masked spectrogram is transformed back to audio. Frame outputs are stitched
//! into one waveform of exactly the input length.
//!
//! ## Quick Start
//!
//! ```ignore
//! use dcunet_rt::Denoiser;
//!
//! // Directory with weights.safetensors and an optional config.ini
//! let denoiser = Denoiser::from_model_dir(Path::new("models/dcunet20"))?;
//!
//! // 48kHz mono f32 samples, any length
//! let enhanced = denoiser.denoise(&input_samples)?;
//! assert_eq!(enhanced.len(), input_samples.len());
//! ```
//!
//! ## Model Directory
//!
//! | File | Required | Contents |
//! |------|----------|----------|
//! | `weights.safetensors` | yes | Every conv / batch-norm tensor, named as in the training state dict |
//! | `config.ini` | no | Overrides for [`DenoiseConfig`] (`model_complexity`, `mask_arithmetic`, ...) |
//!
//! Weight names follow the layout `encoder{i}.cconv.{real,im}_conv.{weight,bias}`,
//! `encoder{i}.cbn.{real,im}_b.{weight,bias,running_mean,running_var}`,
//! `decoder{i}.cconvt.{real,im}_convt.{weight,bias}` and `decoder{i}.cbn.*`.
//! Every tensor must match the architecture table exactly; a single mismatch
//! fails the whole load.
//!
//! ## Audio Requirements
//!
//! - **Sample rate**: 48 kHz (resample before processing)
//! - **Format**: mono f32 samples in range [-1.0, 1.0]
//! - **Channels**: multi-channel WAV input is downmixed or rejected according
//!   to [`ChannelPolicy`]
//!
//! ## API Levels
//!
//! - [`Denoiser`] - loads a model directory and denoises whole waveforms or WAV files.
//! - [`ChunkedInference`] - the frame loop, generic over any [`FrameProcessor`].
//! - [`DcUnet20`] / [`SpectralFramePipeline`] - the network and the
//!   waveform ⇄ spectrogram adapter, for callers that drive frames themselves.
//!
//! ## Logging
//!
//! This crate uses the `log` crate. Binaries decide on a logger; the demo uses
//! `env_logger`:
//!
//! ```ignore
//! env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
//! ```
//!
//! ## Thread Safety
//!
//! A loaded [`DcUnet20`] is immutable and `Send + Sync`. Frames of one waveform
//! are processed strictly in order.

pub mod audio;
pub mod chunked;
pub mod complex;
pub mod config;
pub mod frame;
pub mod layers;
pub mod model;
pub mod stft;
pub mod weights;

use std::path::Path;
use thiserror::Error;

pub use audio::Waveform;
pub use chunked::{ChunkedInference, ChunkedOutput, FrameProcessor, SpectralDenoiser};
pub use complex::{ComplexArray, ComplexSpectrogram, ComplexTensor};
pub use config::{ChannelPolicy, DenoiseConfig, MaskArithmetic};
pub use frame::{Frame, FrameBuffer, SpectralFramePipeline};
pub use model::{ArchitectureTable, DcUnet20};
pub use stft::SpectralTransform;
pub use weights::ModelWeights;

// Defaults of the published DCUNet-20 weight sets
pub const SAMPLE_RATE: usize = 48000;
pub const FRAME_LENGTH: usize = 165000;
pub const WINDOW_MS: usize = 64;
pub const HOP_MS: usize = 16;
pub const N_FFT: usize = SAMPLE_RATE * WINDOW_MS / 1000;
pub const HOP_LENGTH: usize = SAMPLE_RATE * HOP_MS / 1000;
pub const FREQ_SIZE: usize = N_FFT / 2 + 1;

/// File name of the weight set inside a model directory.
pub const WEIGHTS_FILE: &str = "weights.safetensors";

#[derive(Error, Debug)]
pub enum DcError {
    #[error("Shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
    #[error("FFT error: {0}")]
    Fft(#[from] realfft::FftError),
    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),
    #[error("Weight error: {0}")]
    Weights(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Unsupported audio: {0}")]
    UnsupportedAudio(String),
    #[error("Input waveform is empty")]
    EmptyInput,
}

pub type Result<T> = std::result::Result<T, DcError>;

/// High-level denoising API.
///
/// Owns the loaded network and the frame pipeline. Every call is independent:
/// the remainder buffer lives only for the duration of one [`denoise`](Self::denoise).
///
/// ```ignore
/// let denoiser = Denoiser::from_model_dir(Path::new("models/dcunet20"))?;
/// denoiser.denoise_file(Path::new("noisy.wav"), Path::new("denoised.wav"))?;
/// ```
pub struct Denoiser {
    config: DenoiseConfig,
    pipeline: SpectralFramePipeline,
    model: DcUnet20,
}

impl Denoiser {
    /// Load `config.ini` (optional) and `weights.safetensors` from a model directory.
    pub fn from_model_dir(model_dir: &Path) -> Result<Self> {
        let config = DenoiseConfig::from_model_dir(model_dir)?;
        let weights = ModelWeights::load(model_dir.join(WEIGHTS_FILE))?;
        Self::with_weights(config, &weights)
    }

    /// Build from an explicit configuration and an already loaded weight set.
    pub fn with_weights(config: DenoiseConfig, weights: &ModelWeights) -> Result<Self> {
        config.validate()?;
        let model = DcUnet20::new(&config, weights)?;
        Self::from_parts(config, model)
    }

    /// Combine a configuration with a constructed model.
    ///
    /// Fails if the model's transform does not match the configured window/hop.
    pub fn from_parts(config: DenoiseConfig, model: DcUnet20) -> Result<Self> {
        config.validate()?;
        let pipeline = SpectralFramePipeline::new(&config)?;
        let (n_fft, hop) = (model.transform().n_fft(), model.transform().hop_length());
        if n_fft != config.n_fft() || hop != config.hop_length() {
            return Err(DcError::Config(format!(
                "model transform ({}/{}) does not match configured window/hop ({}/{})",
                n_fft,
                hop,
                config.n_fft(),
                config.hop_length()
            )));
        }
        Ok(Self {
            config,
            pipeline,
            model,
        })
    }

    /// Denoise mono samples at the configured sample rate.
    ///
    /// Output has exactly `samples.len()` samples.
    pub fn denoise(&self, samples: &[f32]) -> Result<Vec<f32>> {
        Ok(self.run(samples)?.samples)
    }

    /// Same as [`denoise`](Self::denoise), also reporting the number of frames run.
    pub fn run(&self, samples: &[f32]) -> Result<ChunkedOutput> {
        let processor = SpectralDenoiser::new(&self.pipeline, &self.model);
        ChunkedInference::new(processor, self.config.frame_length, self.config.sample_rate)?
            .run(samples)
    }

    /// Denoise a [`Waveform`], checking its sample rate first.
    pub fn denoise_waveform(&self, input: &Waveform) -> Result<Waveform> {
        if input.sample_rate as usize != self.config.sample_rate {
            return Err(DcError::UnsupportedAudio(format!(
                "sample rate {} Hz, expected {} Hz",
                input.sample_rate, self.config.sample_rate
            )));
        }
        let samples = self.denoise(&input.samples)?;
        Ok(Waveform::new(samples, input.sample_rate))
    }

    /// Read a WAV file, denoise it and write a 16-bit mono WAV of the same duration.
    pub fn denoise_file(&self, input: &Path, output: &Path) -> Result<ChunkedOutput> {
        let noisy = audio::read_wav(input, self.config.channel_policy)?;
        if noisy.sample_rate as usize != self.config.sample_rate {
            return Err(DcError::UnsupportedAudio(format!(
                "{}: sample rate {} Hz, expected {} Hz",
                input.display(),
                noisy.sample_rate,
                self.config.sample_rate
            )));
        }
        log::info!(
            "Denoising {} ({} samples, {:.2}s)",
            input.display(),
            noisy.len(),
            noisy.duration_secs()
        );
        let result = self.run(&noisy.samples)?;
        audio::write_wav(output, &Waveform::new(result.samples.clone(), noisy.sample_rate))?;
        log::info!("Saved {} ({} frames)", output.display(), result.iterations);
        Ok(result)
    }

    pub fn config(&self) -> &DenoiseConfig {
        &self.config
    }

    pub fn model(&self) -> &DcUnet20 {
        &self.model
    }

    pub fn pipeline(&self) -> &SpectralFramePipeline {
        &self.pipeline
    }

    /// Required sample rate (48000 Hz unless overridden).
    pub fn sample_rate(&self) -> usize {
        self.config.sample_rate
    }

    /// Duration of audio covered by one model invocation.
    pub fn frame_seconds(&self) -> f64 {
        self.config.frame_seconds()
    }
}

// Compile-time check that loaded models can be shared across threads
fn _assert_send_sync<T: Send + Sync>() {}
fn _assert_model_is_send_sync() {
    _assert_send_sync::<DcUnet20>();
    _assert_send_sync::<Denoiser>();
}
