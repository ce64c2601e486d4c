//! Fixed-length framing of a waveform and the waveform ⇄ spectrogram adapter.

use crate::complex::ComplexTensor;
use crate::config::DenoiseConfig;
use crate::stft::SpectralTransform;
use crate::Result;

/// One model-sized slice of audio.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Exactly `frame_length` samples.
    pub samples: Vec<f32>,
    /// Zeros inserted before the real audio. Non-zero only for the last,
    /// short segment of a waveform, which is right-aligned.
    pub leading_padding: usize,
}

/// Split `segment` into one frame and the unconsumed tail.
///
/// A segment no longer than `frame_length` is placed in the last positions of
/// an otherwise zero frame and leaves nothing behind. A longer segment gives
/// up its first `frame_length` samples; the rest is returned untouched.
pub fn frame_segment(segment: &[f32], frame_length: usize) -> (Frame, &[f32]) {
    if segment.len() <= frame_length {
        let leading_padding = frame_length - segment.len();
        let mut samples = vec![0.0f32; frame_length];
        samples[leading_padding..].copy_from_slice(segment);
        (
            Frame {
                samples,
                leading_padding,
            },
            &segment[segment.len()..],
        )
    } else {
        let (head, tail) = segment.split_at(frame_length);
        (
            Frame {
                samples: head.to_vec(),
                leading_padding: 0,
            },
            tail,
        )
    }
}

/// Audio not yet handed to the model.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    pending: Vec<f32>,
    frame_length: usize,
}

impl FrameBuffer {
    pub fn new(frame_length: usize) -> Self {
        Self {
            pending: Vec::new(),
            frame_length,
        }
    }

    pub fn push(&mut self, samples: &[f32]) {
        self.pending.extend_from_slice(samples);
    }

    pub fn pending(&self) -> &[f32] {
        &self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Take the next frame. The remainder stays buffered, in order.
    pub fn next_frame(&mut self) -> Frame {
        let (frame, tail) = frame_segment(&self.pending, self.frame_length);
        let consumed = self.pending.len() - tail.len();
        self.pending.drain(..consumed);
        frame
    }
}

/// Converts frames to model input and model output back to frames.
#[derive(Debug, Clone)]
pub struct SpectralFramePipeline {
    transform: SpectralTransform,
    frame_length: usize,
}

impl SpectralFramePipeline {
    pub fn new(config: &DenoiseConfig) -> Result<Self> {
        Ok(Self {
            transform: SpectralTransform::from_config(config)?,
            frame_length: config.frame_length,
        })
    }

    /// `(1, freq_bins, frames)` spectrogram of one frame.
    pub fn analyze(&self, frame: &Frame) -> Result<ComplexTensor> {
        Ok(self.transform.forward(&frame.samples)?.into_tensor())
    }

    /// Waveform of exactly `frame_length` samples from a `(1, freq, time)` spectrogram.
    pub fn synthesize(&self, spec: &ComplexTensor) -> Result<Vec<f32>> {
        let spec = spec.clone().squeeze_channel()?;
        self.transform.inverse(&spec, Some(self.frame_length))
    }

    pub fn frame_length(&self) -> usize {
        self.frame_length
    }

    pub fn transform(&self) -> &SpectralTransform {
        &self.transform
    }
}
