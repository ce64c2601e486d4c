//! Running a fixed-input-size model over a waveform of any length.
//!
//! The waveform is consumed front to back in frames of `frame_length`
//! samples. The final frame is right-aligned with leading zeros; those zeros
//! are dropped from its output chunk before stitching, so the result lines up
//! sample for sample with the input and is finally cut to the input length.

use crate::frame::{Frame, FrameBuffer, SpectralFramePipeline};
use crate::model::DcUnet20;
use crate::{DcError, Result};

/// One frame of audio in, one chunk of `frame.samples.len()` samples out.
pub trait FrameProcessor {
    fn process_frame(&self, frame: &Frame) -> Result<Vec<f32>>;
}

impl<P: FrameProcessor + ?Sized> FrameProcessor for &P {
    fn process_frame(&self, frame: &Frame) -> Result<Vec<f32>> {
        (**self).process_frame(frame)
    }
}

/// Spectrogram → DCUNet mask → waveform, for one frame.
pub struct SpectralDenoiser<'a> {
    pipeline: &'a SpectralFramePipeline,
    model: &'a DcUnet20,
}

impl<'a> SpectralDenoiser<'a> {
    pub fn new(pipeline: &'a SpectralFramePipeline, model: &'a DcUnet20) -> Self {
        Self { pipeline, model }
    }
}

impl FrameProcessor for SpectralDenoiser<'_> {
    fn process_frame(&self, frame: &Frame) -> Result<Vec<f32>> {
        let spec = self.pipeline.analyze(frame)?;
        self.model
            .forward_istft(&spec, Some(self.pipeline.frame_length()))
    }
}

/// Stitched output of a chunked run.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkedOutput {
    pub samples: Vec<f32>,
    /// Number of frames the processor was invoked on.
    pub iterations: usize,
}

pub struct ChunkedInference<P> {
    processor: P,
    frame_length: usize,
    sample_rate: usize,
}

impl<P: FrameProcessor> ChunkedInference<P> {
    /// Both `frame_length` and `sample_rate` must be positive.
    pub fn new(processor: P, frame_length: usize, sample_rate: usize) -> Result<Self> {
        if frame_length == 0 || sample_rate == 0 {
            return Err(DcError::Config(format!(
                "frame_length ({}) and sample_rate ({}) must be positive",
                frame_length, sample_rate
            )));
        }
        Ok(Self {
            processor,
            frame_length,
            sample_rate,
        })
    }

    /// Seconds of audio per frame.
    pub fn frame_seconds(&self) -> f64 {
        self.frame_length as f64 / self.sample_rate as f64
    }

    /// `⌈samples / frame_length⌉`
    pub fn iteration_count(&self, samples: usize) -> usize {
        samples.div_ceil(self.frame_length)
    }

    pub fn run(&self, samples: &[f32]) -> Result<ChunkedOutput> {
        if samples.is_empty() {
            return Err(DcError::EmptyInput);
        }
        let iterations = self.iteration_count(samples.len());
        log::debug!(
            "{} samples ({:.2}s) in {} frame(s) of {:.4}s",
            samples.len(),
            samples.len() as f64 / self.sample_rate as f64,
            iterations,
            self.frame_seconds()
        );

        let mut buffer = FrameBuffer::new(self.frame_length);
        buffer.push(samples);
        let mut output = Vec::with_capacity(iterations * self.frame_length);

        for i in 0..iterations {
            let frame = buffer.next_frame();
            let chunk = self.processor.process_frame(&frame)?;
            if chunk.len() != frame.samples.len() {
                return Err(DcError::Config(format!(
                    "frame {} produced {} samples, expected {}",
                    i,
                    chunk.len(),
                    frame.samples.len()
                )));
            }
            log::trace!("frame {}/{} done", i + 1, iterations);
            output.extend_from_slice(&chunk[frame.leading_padding..]);
        }

        if output.len() < samples.len() {
            return Err(DcError::Config(format!(
                "stitched {} samples for an input of {}",
                output.len(),
                samples.len()
            )));
        }
        output.truncate(samples.len());
        Ok(ChunkedOutput {
            samples: output,
            iterations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// Passes frames through unchanged and counts calls.
    struct Identity {
        calls: Cell<usize>,
    }

    impl Identity {
        fn new() -> Self {
            Self { calls: Cell::new(0) }
        }
    }

    impl FrameProcessor for Identity {
        fn process_frame(&self, frame: &Frame) -> Result<Vec<f32>> {
            self.calls.set(self.calls.get() + 1);
            Ok(frame.samples.clone())
        }
    }

    struct Truncating;

    impl FrameProcessor for Truncating {
        fn process_frame(&self, frame: &Frame) -> Result<Vec<f32>> {
            Ok(frame.samples[1..].to_vec())
        }
    }

    #[test]
    fn test_iteration_count_is_ceil() {
        let controller = ChunkedInference::new(Identity::new(), 165000, 48000).unwrap();
        assert_eq!(controller.iteration_count(1), 1);
        assert_eq!(controller.iteration_count(165000), 1);
        assert_eq!(controller.iteration_count(165001), 2);
        assert_eq!(controller.iteration_count(480000), 3);
        assert!((controller.frame_seconds() - 3.4375).abs() < 1e-12);
    }

    #[test]
    fn test_identity_reproduces_input() {
        let input: Vec<f32> = (0..23).map(|i| i as f32).collect();
        let identity = Identity::new();
        let output = ChunkedInference::new(&identity, 10, 10).unwrap().run(&input).unwrap();
        assert_eq!(output.iterations, 3);
        assert_eq!(identity.calls.get(), 3);
        assert_eq!(output.samples, input);
    }

    #[test]
    fn test_single_short_frame() {
        let input = vec![0.5f32; 7];
        let output = ChunkedInference::new(Identity::new(), 10, 10).unwrap().run(&input).unwrap();
        assert_eq!(output.iterations, 1);
        assert_eq!(output.samples, input);
    }

    #[test]
    fn test_exact_multiple_of_frame() {
        let input: Vec<f32> = (0..30).map(|i| (i as f32).sqrt()).collect();
        let output = ChunkedInference::new(Identity::new(), 10, 10).unwrap().run(&input).unwrap();
        assert_eq!(output.iterations, 3);
        assert_eq!(output.samples, input);
    }

    #[test]
    fn test_empty_input_is_an_error() {
        let err = ChunkedInference::new(Identity::new(), 10, 10).unwrap().run(&[]).unwrap_err();
        assert!(matches!(err, DcError::EmptyInput));
    }

    #[test]
    fn test_zero_frame_length_is_rejected() {
        assert!(matches!(
            ChunkedInference::new(Identity::new(), 0, 10),
            Err(DcError::Config(_))
        ));
        assert!(ChunkedInference::new(Identity::new(), 10, 0).is_err());
    }

    #[test]
    fn test_wrong_chunk_length_is_an_error() {
        assert!(ChunkedInference::new(Truncating, 10, 10).unwrap().run(&[1.0; 15]).is_err());
    }
}
