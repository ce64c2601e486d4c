//! Centered short-time Fourier transform and its overlap-add inverse.
//!
//! Conventions (those the DCUNet-20 weights were trained with):
//!
//! - rectangular window of `n_fft` samples, hop `hop_length`
//! - input reflect-padded by `n_fft / 2` on both sides ("centered" frames)
//! - one-sided spectrum of `n_fft / 2 + 1` bins
//! - orthonormal scaling: forward multiplies by `1/√n_fft`, inverse undoes it
//!
//! A signal of `L` samples yields `1 + L / hop_length` frames. FFT plans and
//! scratch sizes are computed once in [`SpectralTransform::new`].

use crate::complex::ComplexSpectrogram;
use crate::config::DenoiseConfig;
use crate::{DcError, Result};
use ndarray::Ix2;
use num_complex::Complex32;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use std::fmt;
use std::sync::Arc;

/// Overlap-add positions whose window envelope falls below this are not invertible.
const ENVELOPE_EPS: f32 = 1e-11;

// ─────────────────────── SpectralTransform ───────────────────────

pub struct SpectralTransform {
    n_fft: usize,
    hop_length: usize,
    /// FFT plan (forward: real → complex).
    fft_forward: Arc<dyn RealToComplex<f32>>,
    /// FFT plan (inverse: complex → real).
    fft_inverse: Arc<dyn ComplexToReal<f32>>,
}

impl fmt::Debug for SpectralTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectralTransform")
            .field("n_fft", &self.n_fft)
            .field("hop_length", &self.hop_length)
            .finish()
    }
}

impl Clone for SpectralTransform {
    fn clone(&self) -> Self {
        Self {
            n_fft: self.n_fft,
            hop_length: self.hop_length,
            fft_forward: Arc::clone(&self.fft_forward),
            fft_inverse: Arc::clone(&self.fft_inverse),
        }
    }
}

impl SpectralTransform {
    pub fn new(n_fft: usize, hop_length: usize) -> Result<Self> {
        if n_fft < 2 || n_fft % 2 != 0 {
            return Err(DcError::Config(format!("n_fft must be even and >= 2, got {}", n_fft)));
        }
        if hop_length == 0 || hop_length > n_fft {
            return Err(DcError::Config(format!(
                "hop_length must be in 1..={}, got {}",
                n_fft, hop_length
            )));
        }
        let mut planner = RealFftPlanner::<f32>::new();
        Ok(Self {
            n_fft,
            hop_length,
            fft_forward: planner.plan_fft_forward(n_fft),
            fft_inverse: planner.plan_fft_inverse(n_fft),
        })
    }

    pub fn from_config(config: &DenoiseConfig) -> Result<Self> {
        Self::new(config.n_fft(), config.hop_length())
    }

    pub fn n_fft(&self) -> usize {
        self.n_fft
    }

    pub fn hop_length(&self) -> usize {
        self.hop_length
    }

    /// Number of one-sided frequency bins: `n_fft / 2 + 1`.
    pub fn freq_bins(&self) -> usize {
        self.n_fft / 2 + 1
    }

    /// Frames produced for a signal of `len` samples.
    pub fn num_frames(&self, len: usize) -> usize {
        1 + len / self.hop_length
    }

    /// Spectrogram of shape `(freq_bins, num_frames(signal.len()))`.
    ///
    /// The signal must be longer than `n_fft / 2` for reflect padding.
    pub fn forward(&self, signal: &[f32]) -> Result<ComplexSpectrogram> {
        let padded = reflect_pad(signal, self.n_fft / 2)?;
        let frames = self.num_frames(signal.len());
        let mut spec = ComplexSpectrogram::zeros(Ix2(self.freq_bins(), frames));

        let mut fft_buf = self.fft_forward.make_input_vec();
        let mut bins = self.fft_forward.make_output_vec();
        let mut scratch = self.fft_forward.make_scratch_vec();
        let norm = 1.0 / (self.n_fft as f32).sqrt();

        for t in 0..frames {
            let start = t * self.hop_length;
            fft_buf.copy_from_slice(&padded[start..start + self.n_fft]);
            self.fft_forward
                .process_with_scratch(&mut fft_buf, &mut bins, &mut scratch)?;
            for (f, c) in bins.iter().enumerate() {
                spec.re[[f, t]] = c.re * norm;
                spec.im[[f, t]] = c.im * norm;
            }
        }
        Ok(spec)
    }

    /// Overlap-add inverse of [`forward`](Self::forward).
    ///
    /// Without `length` the output has `hop_length · (frames − 1)` samples.
    /// With `length` the output is cut to, or zero-padded up to, exactly that many.
    pub fn inverse(&self, spec: &ComplexSpectrogram, length: Option<usize>) -> Result<Vec<f32>> {
        let (freq_bins, frames) = spec.re.dim();
        if freq_bins != self.freq_bins() {
            return Err(DcError::Config(format!(
                "spectrogram has {} bins, transform expects {}",
                freq_bins,
                self.freq_bins()
            )));
        }
        if frames == 0 {
            return Err(DcError::Config("spectrogram has no frames".to_string()));
        }

        let full_len = self.n_fft + self.hop_length * (frames - 1);
        let mut signal = vec![0.0f32; full_len];
        let mut envelope = vec![0.0f32; full_len];

        let mut bins = self.fft_inverse.make_input_vec();
        let mut frame = self.fft_inverse.make_output_vec();
        let mut scratch = self.fft_inverse.make_scratch_vec();
        // realfft's inverse is unnormalized: √n (undo forward) · 1/n (inverse DFT)
        let norm = 1.0 / (self.n_fft as f32).sqrt();

        for t in 0..frames {
            for (f, c) in bins.iter_mut().enumerate() {
                *c = Complex32::new(spec.re[[f, t]], spec.im[[f, t]]);
            }
            // DC and Nyquist of a real signal are real
            bins[0].im = 0.0;
            bins[freq_bins - 1].im = 0.0;
            self.fft_inverse
                .process_with_scratch(&mut bins, &mut frame, &mut scratch)?;

            let start = t * self.hop_length;
            for (k, &v) in frame.iter().enumerate() {
                signal[start + k] += v * norm;
                envelope[start + k] += 1.0;
            }
        }

        let pad = self.n_fft / 2;
        let length = length.unwrap_or(full_len - 2 * pad);
        let end = (pad + length).min(full_len);
        let mut out = Vec::with_capacity(length);
        for i in pad..end {
            if envelope[i] < ENVELOPE_EPS {
                return Err(DcError::Config(format!(
                    "window envelope vanishes at sample {}",
                    i - pad
                )));
            }
            out.push(signal[i] / envelope[i]);
        }
        out.resize(length, 0.0);
        Ok(out)
    }
}

/// Mirror `pad` samples at each end, excluding the edge sample itself.
fn reflect_pad(signal: &[f32], pad: usize) -> Result<Vec<f32>> {
    let n = signal.len();
    if pad >= n {
        return Err(DcError::Config(format!(
            "reflect padding of {} needs more than {} samples",
            pad, n
        )));
    }
    let mut padded = Vec::with_capacity(n + 2 * pad);
    padded.extend(signal[1..=pad].iter().rev());
    padded.extend_from_slice(signal);
    padded.extend(signal[n - 1 - pad..n - 1].iter().rev());
    Ok(padded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FRAME_LENGTH, FREQ_SIZE, HOP_LENGTH, N_FFT};

    fn chirp(len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| {
                let t = i as f32 / 64.0;
                0.5 * (t * (1.0 + t * 0.01)).sin() + 0.1 * (i as f32 * 0.37).cos()
            })
            .collect()
    }

    #[test]
    fn test_reflect_pad() {
        let padded = reflect_pad(&[1.0, 2.0, 3.0, 4.0, 5.0], 2).unwrap();
        assert_eq!(padded, vec![3.0, 2.0, 1.0, 2.0, 3.0, 4.0, 5.0, 4.0, 3.0]);
        assert!(reflect_pad(&[1.0, 2.0], 2).is_err());
    }

    #[test]
    fn test_full_frame_shape() {
        let transform = SpectralTransform::new(N_FFT, HOP_LENGTH).unwrap();
        assert_eq!(transform.num_frames(FRAME_LENGTH), 215);
        let spec = transform.forward(&vec![0.0; FRAME_LENGTH]).unwrap();
        assert_eq!(spec.shape(), &[FREQ_SIZE, 215]);
    }

    #[test]
    fn test_constant_signal_is_dc_only() {
        let transform = SpectralTransform::new(16, 4).unwrap();
        let spec = transform.forward(&vec![1.0; 64]).unwrap();
        // 16 ones / √16 = 4 in the DC bin, nothing elsewhere
        for t in 0..spec.re.ncols() {
            assert!((spec.re[[0, t]] - 4.0).abs() < 1e-4);
            for f in 1..spec.re.nrows() {
                assert!(spec.re[[f, t]].abs() < 1e-4);
                assert!(spec.im[[f, t]].abs() < 1e-4);
            }
        }
    }

    #[test]
    fn test_inverse_reconstructs_input() {
        let transform = SpectralTransform::new(64, 16).unwrap();
        let signal = chirp(1000);
        let spec = transform.forward(&signal).unwrap();
        let restored = transform.inverse(&spec, Some(signal.len())).unwrap();
        assert_eq!(restored.len(), signal.len());
        for (a, b) in signal.iter().zip(&restored) {
            assert!((a - b).abs() < 1e-4, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_inverse_default_length() {
        let transform = SpectralTransform::new(N_FFT, HOP_LENGTH).unwrap();
        let spec = transform.forward(&chirp(FRAME_LENGTH)).unwrap();
        let restored = transform.inverse(&spec, None).unwrap();
        assert_eq!(restored.len(), HOP_LENGTH * 214);
    }

    #[test]
    fn test_inverse_zero_pads_past_available_samples() {
        let transform = SpectralTransform::new(8, 2).unwrap();
        let spec = transform.forward(&chirp(10)).unwrap();
        let restored = transform.inverse(&spec, Some(40)).unwrap();
        assert_eq!(restored.len(), 40);
        assert!(restored[20..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_rejects_wrong_bin_count() {
        let transform = SpectralTransform::new(16, 4).unwrap();
        let spec = ComplexSpectrogram::zeros(Ix2(5, 3));
        assert!(transform.inverse(&spec, None).is_err());
    }

    #[test]
    fn test_invalid_geometry() {
        assert!(SpectralTransform::new(15, 4).is_err());
        assert!(SpectralTransform::new(16, 0).is_err());
        assert!(SpectralTransform::new(16, 17).is_err());
    }
}
