//! WAV input and output.
//!
//! Input may be float or 8/16/24/32-bit integer PCM with any channel count;
//! it is normalized to `f32` in [-1, 1] and reduced to mono according to a
//! [`ChannelPolicy`]. Output is always 16-bit mono.

use crate::config::ChannelPolicy;
use crate::{DcError, Result};
use std::path::Path;

/// Mono samples at a known sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl Waveform {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

pub fn read_wav(path: &Path, policy: ChannelPolicy) -> Result<Waveform> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    log::debug!(
        "{}: {} Hz, {} channel(s), {} bit {:?}",
        path.display(),
        spec.sample_rate,
        spec.channels,
        spec.bits_per_sample,
        spec.sample_format
    );

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<std::result::Result<_, _>>()?,
        hound::SampleFormat::Int => match spec.bits_per_sample {
            8 => reader
                .samples::<i8>()
                .map(|s| s.map(|v| v as f32 / 128.0))
                .collect::<std::result::Result<_, _>>()?,
            16 => reader
                .samples::<i16>()
                .map(|s| s.map(|v| v as f32 / 32768.0))
                .collect::<std::result::Result<_, _>>()?,
            bits @ (24 | 32) => {
                let scale = (1u64 << (bits - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<std::result::Result<_, _>>()?
            }
            bits => {
                return Err(DcError::UnsupportedAudio(format!(
                    "{}: {} bits per sample",
                    path.display(),
                    bits
                )))
            }
        },
    };

    let mono = to_mono(samples, spec.channels as usize, policy)?;
    Ok(Waveform::new(mono, spec.sample_rate))
}

/// Reduce interleaved samples to one channel.
pub fn to_mono(interleaved: Vec<f32>, channels: usize, policy: ChannelPolicy) -> Result<Vec<f32>> {
    match (channels, policy) {
        (0, _) => Err(DcError::UnsupportedAudio("zero channels".to_string())),
        (1, _) => Ok(interleaved),
        (n, ChannelPolicy::Reject) => Err(DcError::UnsupportedAudio(format!(
            "{} channels, expected mono",
            n
        ))),
        (n, ChannelPolicy::Downmix) => {
            log::warn!("Downmixing {} channels to mono", n);
            Ok(interleaved
                .chunks(n)
                .map(|frame| frame.iter().sum::<f32>() / n as f32)
                .collect())
        }
    }
}

/// Write 16-bit mono PCM, clamping to [-1, 1].
pub fn write_wav(path: &Path, waveform: &Waveform) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: waveform.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for sample in &waveform.samples {
        let s = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
        writer.write_sample(s)?;
    }
    writer.finalize()?;
    Ok(())
}
