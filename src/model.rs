//! DCUNet-20: ten complex encoder stages, ten mirrored decoder stages with
//! skip connections, and a bounded complex mask as output.
//!
//! ```text
//! spec ─▶ E0 ─▶ E1 ─▶ … ─▶ E9 ─▶ D0 ─┬▶ D1 ─┬▶ … ─▶ D9 ─▶ mask ⊙ spec
//!          │     │          └────────┘     │
//!          │     └──────────── … ──────────┘   (Di output ++ input of E(9−i))
//! ```
//!
//! Tensors are unbatched: `(channels, freq, time)`.

use crate::complex::ComplexTensor;
use crate::config::{DenoiseConfig, MaskArithmetic, DEFAULT_MODEL_DEPTH};
use crate::layers::{leaky_relu, ComplexBatchNorm2d, ComplexConv2d, ComplexConvTranspose2d, ConvGeometry};
use crate::stft::SpectralTransform;
use crate::weights::{ModelWeights, ParamSource};
use crate::{DcError, Result};
use ndarray::Zip;

/// Encoder (and decoder) stages per side.
pub const MODEL_LENGTH: usize = DEFAULT_MODEL_DEPTH / 2;
pub const BOTTLENECK_CHANNELS: usize = 128;
const MASK_EPS: f32 = 1e-8;

const ENC_KERNELS: [(usize, usize); MODEL_LENGTH] = [
    (7, 1), (1, 7), (6, 4), (7, 5), (5, 3),
    (5, 3), (5, 3), (5, 3), (5, 3), (5, 3),
];
const ENC_STRIDES: [(usize, usize); MODEL_LENGTH] = [
    (1, 1), (1, 1), (2, 2), (2, 1), (2, 2),
    (2, 1), (2, 2), (2, 1), (2, 2), (2, 1),
];
const ENC_PADDINGS: [(usize, usize); MODEL_LENGTH] = [
    (3, 0), (0, 3), (0, 0), (0, 0), (0, 0),
    (0, 0), (0, 0), (0, 0), (0, 0), (0, 0),
];
const DEC_KERNELS: [(usize, usize); MODEL_LENGTH] = [
    (6, 3), (6, 3), (6, 3), (6, 4), (6, 3),
    (6, 4), (8, 5), (7, 5), (1, 7), (7, 1),
];
const DEC_STRIDES: [(usize, usize); MODEL_LENGTH] = [
    (2, 1), (2, 2), (2, 1), (2, 2), (2, 1),
    (2, 2), (2, 1), (2, 2), (1, 1), (1, 1),
];
const DEC_PADDINGS: [(usize, usize); MODEL_LENGTH] = [
    (0, 0), (0, 0), (0, 0), (0, 0), (0, 0),
    (0, 0), (0, 0), (0, 0), (0, 3), (3, 0),
];
const DEC_OUTPUT_PADDINGS: [(usize, usize); MODEL_LENGTH] = [(0, 0); MODEL_LENGTH];

/// Channel counts and convolution geometry of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageSpec {
    pub in_channels: usize,
    pub out_channels: usize,
    pub geometry: ConvGeometry,
}

/// Channel count and spatial extent observed after one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageTrace {
    pub stage: String,
    pub channels: usize,
    pub freq: usize,
    pub time: usize,
}

/// The fixed layer table of a DCUNet of a given depth and complexity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchitectureTable {
    complexity: usize,
    encoders: Vec<StageSpec>,
    decoders: Vec<StageSpec>,
}

impl ArchitectureTable {
    /// Only depth 20 has a defined table.
    pub fn new(depth: usize, complexity: usize) -> Result<Self> {
        if depth != DEFAULT_MODEL_DEPTH {
            return Err(DcError::Config(format!(
                "unsupported model depth {}, only {} is defined",
                depth, DEFAULT_MODEL_DEPTH
            )));
        }
        if complexity == 0 {
            return Err(DcError::Config("model complexity must be positive".to_string()));
        }
        let c = complexity;
        let enc_channels = [1, c, c, 2 * c, 2 * c, 2 * c, 2 * c, 2 * c, 2 * c, 2 * c, BOTTLENECK_CHANNELS];
        let dec_channels = [0, 2 * c, 2 * c, 2 * c, 2 * c, 2 * c, 2 * c, 2 * c, c, c, 1];

        let encoders = (0..MODEL_LENGTH)
            .map(|i| StageSpec {
                in_channels: enc_channels[i],
                out_channels: enc_channels[i + 1],
                geometry: ConvGeometry {
                    kernel: ENC_KERNELS[i],
                    stride: ENC_STRIDES[i],
                    padding: ENC_PADDINGS[i],
                    output_padding: (0, 0),
                },
            })
            .collect();
        // Decoder i also receives the skip input of encoder MODEL_LENGTH - i
        let decoders = (0..MODEL_LENGTH)
            .map(|i| StageSpec {
                in_channels: dec_channels[i] + enc_channels[MODEL_LENGTH - i],
                out_channels: dec_channels[i + 1],
                geometry: ConvGeometry {
                    kernel: DEC_KERNELS[i],
                    stride: DEC_STRIDES[i],
                    padding: DEC_PADDINGS[i],
                    output_padding: DEC_OUTPUT_PADDINGS[i],
                },
            })
            .collect();

        Ok(Self {
            complexity,
            encoders,
            decoders,
        })
    }

    pub fn complexity(&self) -> usize {
        self.complexity
    }

    pub fn encoders(&self) -> &[StageSpec] {
        &self.encoders
    }

    pub fn decoders(&self) -> &[StageSpec] {
        &self.decoders
    }

    /// Propagate a `(freq, time)` input extent through the table, checking
    /// that every skip connection lines up and the mask matches the input.
    pub fn trace_shapes(&self, input: (usize, usize)) -> Result<Vec<StageTrace>> {
        let mut traces = Vec::with_capacity(2 * MODEL_LENGTH);
        let mut skips = Vec::with_capacity(MODEL_LENGTH);
        let mut extent = input;

        for (i, spec) in self.encoders.iter().enumerate() {
            skips.push(extent);
            extent = spec.geometry.conv_output(extent).ok_or_else(|| {
                DcError::Config(format!("encoder{} cannot reduce an extent of {:?}", i, extent))
            })?;
            traces.push(trace(format!("encoder{}", i), spec.out_channels, extent));
        }

        for (i, spec) in self.decoders.iter().enumerate() {
            extent = spec.geometry.transposed_output(extent).ok_or_else(|| {
                DcError::Config(format!("decoder{} cannot expand an extent of {:?}", i, extent))
            })?;
            traces.push(trace(format!("decoder{}", i), spec.out_channels, extent));
            if i + 1 < MODEL_LENGTH && skips[MODEL_LENGTH - 1 - i] != extent {
                return Err(DcError::Config(format!(
                    "decoder{} output {:?} does not line up with skip {:?}",
                    i,
                    extent,
                    skips[MODEL_LENGTH - 1 - i]
                )));
            }
        }

        if extent != input {
            return Err(DcError::Config(format!(
                "mask extent {:?} differs from input {:?}",
                extent, input
            )));
        }
        Ok(traces)
    }
}

fn trace(stage: String, channels: usize, (freq, time): (usize, usize)) -> StageTrace {
    StageTrace {
        stage,
        channels,
        freq,
        time,
    }
}

// ─────────────────────────── Stages ───────────────────────────

/// Complex conv → complex batch norm → leaky ReLU.
#[derive(Debug, Clone)]
pub struct Encoder {
    conv: ComplexConv2d,
    norm: ComplexBatchNorm2d,
}

impl Encoder {
    fn load(params: &mut ParamSource, index: usize, spec: &StageSpec) -> Result<Self> {
        let prefix = format!("encoder{}", index);
        Ok(Self {
            conv: ComplexConv2d::load(
                params,
                &format!("{}.cconv", prefix),
                spec.in_channels,
                spec.out_channels,
                &spec.geometry,
            )?,
            norm: ComplexBatchNorm2d::load(params, &format!("{}.cbn", prefix), spec.out_channels)?,
        })
    }

    fn export(&self, prefix: &str, weights: &mut ModelWeights) {
        self.conv.export(&format!("{}.cconv", prefix), weights);
        self.norm.export(&format!("{}.cbn", prefix), weights);
    }

    pub fn forward(&self, x: &ComplexTensor) -> Result<ComplexTensor> {
        let mut y = self.conv.forward(x)?;
        self.norm.forward_inplace(&mut y)?;
        Ok(y.map_planes(leaky_relu))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderOutput {
    Activation,
    Mask(MaskArithmetic),
}

/// Complex transposed conv, then either batch norm + leaky ReLU or, for the
/// final stage, the bounded mask. The final stage still owns batch-norm
/// parameters; they are loaded and validated but never applied.
#[derive(Debug, Clone)]
pub struct Decoder {
    conv: ComplexConvTranspose2d,
    norm: ComplexBatchNorm2d,
    output: DecoderOutput,
}

impl Decoder {
    fn load(params: &mut ParamSource, index: usize, spec: &StageSpec, output: DecoderOutput) -> Result<Self> {
        let prefix = format!("decoder{}", index);
        Ok(Self {
            conv: ComplexConvTranspose2d::load(
                params,
                &format!("{}.cconvt", prefix),
                spec.in_channels,
                spec.out_channels,
                &spec.geometry,
            )?,
            norm: ComplexBatchNorm2d::load(params, &format!("{}.cbn", prefix), spec.out_channels)?,
            output,
        })
    }

    fn export(&self, prefix: &str, weights: &mut ModelWeights) {
        self.conv.export(&format!("{}.cconvt", prefix), weights);
        self.norm.export(&format!("{}.cbn", prefix), weights);
    }

    pub fn is_mask_stage(&self) -> bool {
        matches!(self.output, DecoderOutput::Mask(_))
    }

    pub fn forward(&self, x: &ComplexTensor) -> Result<ComplexTensor> {
        let mut y = self.conv.forward(x)?;
        match self.output {
            DecoderOutput::Activation => {
                self.norm.forward_inplace(&mut y)?;
                Ok(y.map_planes(leaky_relu))
            }
            DecoderOutput::Mask(arithmetic) => Ok(bounded_mask(y, arithmetic)),
        }
    }
}

/// `tanh(|z|) · z / (|z| + ε)`: magnitude squashed below 1, phase kept.
fn bounded_mask(mut z: ComplexTensor, arithmetic: MaskArithmetic) -> ComplexTensor {
    match arithmetic {
        MaskArithmetic::Complex => {
            Zip::from(&mut z.re).and(&mut z.im).for_each(|re, im| {
                let magnitude = re.hypot(*im);
                let gain = magnitude.tanh() / (magnitude + MASK_EPS);
                *re *= gain;
                *im *= gain;
            });
            z
        }
        MaskArithmetic::RealView => z.map_planes(|v| {
            let magnitude = v.abs();
            v / (magnitude + MASK_EPS) * magnitude.tanh()
        }),
    }
}

// ─────────────────────────── DcUnet20 ─────────────────────────

/// The full network plus the transform used to turn its output back into audio.
///
/// Immutable once built; share it freely between threads.
#[derive(Debug, Clone)]
pub struct DcUnet20 {
    table: ArchitectureTable,
    encoders: Vec<Encoder>,
    decoders: Vec<Decoder>,
    transform: SpectralTransform,
    mask_arithmetic: MaskArithmetic,
}

impl DcUnet20 {
    /// Build from a weight set. Every tensor the table requires must be present
    /// with the exact shape and nothing else may be; otherwise nothing is built.
    pub fn new(config: &DenoiseConfig, weights: &ModelWeights) -> Result<Self> {
        Self::build(config, ParamSource::loaded(weights))
    }

    /// Build with seeded Glorot-uniform convolution weights and identity batch norms.
    pub fn random(config: &DenoiseConfig, seed: u64) -> Result<Self> {
        Self::build(config, ParamSource::random(seed))
    }

    fn build(config: &DenoiseConfig, mut params: ParamSource) -> Result<Self> {
        config.validate()?;
        let table = ArchitectureTable::new(config.model_depth, config.model_complexity)?;
        let transform = SpectralTransform::from_config(config)?;

        let encoders = table
            .encoders()
            .iter()
            .enumerate()
            .map(|(i, spec)| Encoder::load(&mut params, i, spec))
            .collect::<Result<Vec<_>>>()?;
        let decoders = table
            .decoders()
            .iter()
            .enumerate()
            .map(|(i, spec)| {
                let output = if i + 1 == MODEL_LENGTH {
                    DecoderOutput::Mask(config.mask_arithmetic)
                } else {
                    DecoderOutput::Activation
                };
                Decoder::load(&mut params, i, spec, output)
            })
            .collect::<Result<Vec<_>>>()?;
        let count = params.finish()?;

        log::info!(
            "DCUNet-20 ready: complexity {}, {} tensors, {} parameters, {:?} mask",
            table.complexity(),
            count.tensors,
            count.scalars,
            config.mask_arithmetic
        );

        Ok(Self {
            table,
            encoders,
            decoders,
            transform,
            mask_arithmetic: config.mask_arithmetic,
        })
    }

    /// Masked spectrogram for a `(1, freq, time)` input spectrogram.
    pub fn forward(&self, spec: &ComplexTensor) -> Result<ComplexTensor> {
        self.run(spec, None)
    }

    /// Like [`forward`](Self::forward), also reporting the shape after every stage.
    pub fn forward_traced(&self, spec: &ComplexTensor) -> Result<(ComplexTensor, Vec<StageTrace>)> {
        let mut traces = Vec::with_capacity(2 * MODEL_LENGTH);
        let output = self.run(spec, Some(&mut traces))?;
        Ok((output, traces))
    }

    /// Masked spectrogram converted back to audio. `length` fixes the number of
    /// output samples; without it the transform's natural length is used.
    pub fn forward_istft(&self, spec: &ComplexTensor, length: Option<usize>) -> Result<Vec<f32>> {
        let masked = self.forward(spec)?.squeeze_channel()?;
        self.transform.inverse(&masked, length)
    }

    fn run(&self, spec: &ComplexTensor, mut traces: Option<&mut Vec<StageTrace>>) -> Result<ComplexTensor> {
        if spec.channels() != 1 {
            return Err(DcError::Config(format!(
                "model input must have 1 channel, got {}",
                spec.channels()
            )));
        }

        let mut skips = Vec::with_capacity(MODEL_LENGTH);
        let mut x = spec.clone();
        for (i, encoder) in self.encoders.iter().enumerate() {
            let y = encoder.forward(&x)?;
            record(&mut traces, || format!("encoder{}", i), &y);
            skips.push(std::mem::replace(&mut x, y));
        }

        for (i, decoder) in self.decoders.iter().enumerate() {
            x = decoder.forward(&x)?;
            record(&mut traces, || format!("decoder{}", i), &x);
            if decoder.is_mask_stage() {
                break;
            }
            x = x.concat_channels(&skips[MODEL_LENGTH - 1 - i])?;
        }

        log::trace!("mask extent {:?}", x.shape());
        match self.mask_arithmetic {
            MaskArithmetic::Complex => x.complex_mul(spec),
            MaskArithmetic::RealView => x.mul_real_view(spec),
        }
    }

    /// The parameters the network runs with, by name. Built on each call.
    pub fn weights(&self) -> ModelWeights {
        let mut weights = ModelWeights::new();
        for (i, encoder) in self.encoders.iter().enumerate() {
            encoder.export(&format!("encoder{}", i), &mut weights);
        }
        for (i, decoder) in self.decoders.iter().enumerate() {
            decoder.export(&format!("decoder{}", i), &mut weights);
        }
        weights
    }

    pub fn table(&self) -> &ArchitectureTable {
        &self.table
    }

    pub fn transform(&self) -> &SpectralTransform {
        &self.transform
    }

    pub fn mask_arithmetic(&self) -> MaskArithmetic {
        self.mask_arithmetic
    }
}

fn record(traces: &mut Option<&mut Vec<StageTrace>>, stage: impl FnOnce() -> String, x: &ComplexTensor) {
    if let Some(traces) = traces {
        traces.push(trace(stage(), x.channels(), x.spatial()));
    }
}
