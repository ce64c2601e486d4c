//! Named parameter tensors and their safetensors storage.
//!
//! Tensors keep the training framework's names and layouts, e.g.
//! `encoder3.cconv.real_conv.weight` with shape `(out, in, kh, kw)` and
//! `decoder2.cconvt.im_convt.weight` with shape `(in, out, kh, kw)`.

use crate::{DcError, Result};
use ndarray::{ArrayD, IxDyn};
use rand::{rngs::StdRng, Rng, SeedableRng};
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Batch-norm step counters are training bookkeeping with no effect on inference.
const IGNORED_SUFFIX: &str = "num_batches_tracked";

/// A flat name → tensor map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelWeights {
    tensors: BTreeMap<String, ArrayD<f32>>,
}

impl ModelWeights {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a `.safetensors` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let buffer = std::fs::read(path).map_err(|e| {
            DcError::Weights(format!("cannot read {}: {}", path.display(), e))
        })?;
        let weights = Self::from_bytes(&buffer)?;
        log::info!("Loaded {} tensors from {}", weights.len(), path.display());
        Ok(weights)
    }

    /// Parse an in-memory safetensors buffer. Only `F32` tensors are accepted;
    /// integer step counters are skipped.
    pub fn from_bytes(buffer: &[u8]) -> Result<Self> {
        let st = SafeTensors::deserialize(buffer)?;
        let mut tensors = BTreeMap::new();
        for (name, view) in st.tensors() {
            match view.dtype() {
                Dtype::F32 => {
                    let values: Vec<f32> = view
                        .data()
                        .chunks_exact(4)
                        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                        .collect();
                    let array = ArrayD::from_shape_vec(IxDyn(view.shape()), values)?;
                    tensors.insert(name, array);
                }
                Dtype::I64 if name.ends_with(IGNORED_SUFFIX) => {
                    log::trace!("Skipping {}", name);
                }
                other => {
                    return Err(DcError::Weights(format!(
                        "{}: unsupported dtype {:?}, expected F32",
                        name, other
                    )))
                }
            }
        }
        Ok(Self { tensors })
    }

    /// Write every tensor as little-endian `F32`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let encoded: Vec<(&String, Vec<u8>, Vec<usize>)> = self
            .tensors
            .iter()
            .map(|(name, array)| {
                let bytes = array.iter().flat_map(|v| v.to_le_bytes()).collect();
                (name, bytes, array.shape().to_vec())
            })
            .collect();
        let mut views = Vec::with_capacity(encoded.len());
        for (name, bytes, shape) in &encoded {
            views.push((name.as_str(), TensorView::new(Dtype::F32, shape.clone(), bytes)?));
        }
        safetensors::serialize_to_file(views, &None, path.as_ref())?;
        Ok(())
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: ArrayD<f32>) {
        self.tensors.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.tensors.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<ArrayD<f32>> {
        self.tensors.remove(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Total number of scalar parameters.
    pub fn parameter_count(&self) -> usize {
        self.tensors.values().map(|t| t.len()).sum()
    }
}

/// How a freshly created parameter is filled.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Init {
    /// Uniform in `[-bound, bound)`.
    Uniform(f32),
    Const(f32),
}

impl Init {
    /// Glorot-uniform: `±√(6 / (fan_in + fan_out))`.
    pub(crate) fn glorot(fan_in: usize, fan_out: usize) -> Self {
        Init::Uniform((6.0 / (fan_in + fan_out).max(1) as f32).sqrt())
    }

    /// `±1/√fan_in`, used for biases.
    pub(crate) fn fan_in(fan_in: usize) -> Self {
        Init::Uniform(1.0 / (fan_in.max(1) as f32).sqrt())
    }
}

enum Origin<'a> {
    Loaded(&'a ModelWeights),
    Random(StdRng),
}

/// Hands out parameters to layer constructors, either from a loaded weight set
/// (validating names and shapes) or freshly initialized from a seeded RNG.
///
/// Names handed out are recorded so that leftovers in a loaded set can be reported.
pub(crate) struct ParamSource<'a> {
    origin: Origin<'a>,
    used: BTreeSet<String>,
    scalars: usize,
}

/// What a finished [`ParamSource`] handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ParamCount {
    pub tensors: usize,
    pub scalars: usize,
}

impl<'a> ParamSource<'a> {
    pub(crate) fn loaded(weights: &'a ModelWeights) -> Self {
        Self {
            origin: Origin::Loaded(weights),
            used: BTreeSet::new(),
            scalars: 0,
        }
    }

    pub(crate) fn random(seed: u64) -> Self {
        Self {
            origin: Origin::Random(StdRng::seed_from_u64(seed)),
            used: BTreeSet::new(),
            scalars: 0,
        }
    }

    /// Fetch `name`, which must have exactly `shape`.
    pub(crate) fn get(&mut self, name: &str, shape: &[usize], init: Init) -> Result<ArrayD<f32>> {
        let tensor = match &mut self.origin {
            Origin::Loaded(weights) => {
                let found = weights
                    .get(name)
                    .ok_or_else(|| DcError::Weights(format!("missing tensor {}", name)))?;
                if found.shape() != shape {
                    return Err(DcError::Weights(format!(
                        "{}: expected shape {:?}, found {:?}",
                        name,
                        shape,
                        found.shape()
                    )));
                }
                found.clone()
            }
            Origin::Random(rng) => match init {
                Init::Uniform(bound) => ArrayD::from_shape_simple_fn(IxDyn(shape), || {
                    rng.random_range(-bound..bound)
                }),
                Init::Const(value) => ArrayD::from_elem(IxDyn(shape), value),
            },
        };
        self.used.insert(name.to_string());
        self.scalars += tensor.len();
        Ok(tensor)
    }

    /// Complete loading. A loaded weight set must not contain tensors that
    /// no layer asked for.
    pub(crate) fn finish(self) -> Result<ParamCount> {
        if let Origin::Loaded(weights) = &self.origin {
            let unexpected: Vec<&str> = weights
                .names()
                .filter(|n| !self.used.contains(*n))
                .collect();
            if !unexpected.is_empty() {
                return Err(DcError::Weights(format!(
                    "{} unexpected tensor(s), first: {}",
                    unexpected.len(),
                    unexpected[0]
                )));
            }
        }
        Ok(ParamCount {
            tensors: self.used.len(),
            scalars: self.scalars,
        })
    }
}
