//! Complex feature maps stored as two parallel real arrays.
//!
//! The network normalizes real and imaginary planes as separate feature maps,
//! so values are never packed into a native complex type. The interleaved
//! layout with a trailing axis of size 2 is available through
//! [`ComplexArray::to_interleaved`] / [`ComplexArray::from_interleaved`].

use crate::{DcError, Result};
use ndarray::{concatenate, stack, Array, ArrayD, Axis, Dimension, ErrorKind, Ix2, Ix3, ShapeError, Zip};

/// Real and imaginary planes of identical shape.
#[derive(Debug, Clone, PartialEq)]
pub struct ComplexArray<D: Dimension> {
    pub re: Array<f32, D>,
    pub im: Array<f32, D>,
}

/// `(channels, freq, time)` feature map.
pub type ComplexTensor = ComplexArray<Ix3>;
/// `(freq, time)` spectrogram.
pub type ComplexSpectrogram = ComplexArray<Ix2>;

impl<D: Dimension> ComplexArray<D> {
    pub fn new(re: Array<f32, D>, im: Array<f32, D>) -> Result<Self> {
        if re.shape() != im.shape() {
            return Err(DcError::Shape(ShapeError::from_kind(ErrorKind::IncompatibleShape)));
        }
        Ok(Self { re, im })
    }

    pub fn zeros(shape: D) -> Self {
        Self {
            re: Array::zeros(shape.clone()),
            im: Array::zeros(shape),
        }
    }

    pub fn shape(&self) -> &[usize] {
        self.re.shape()
    }

    /// Apply `f` to every element of both planes.
    pub fn map_planes(mut self, f: impl Fn(f32) -> f32) -> Self {
        self.re.mapv_inplace(&f);
        self.im.mapv_inplace(&f);
        self
    }

    /// Elementwise complex modulus.
    pub fn magnitude(&self) -> Array<f32, D> {
        Zip::from(&self.re)
            .and(&self.im)
            .map_collect(|&re, &im| re.hypot(im))
    }

    /// Elementwise complex product `(a + bi)(c + di)`.
    pub fn complex_mul(&self, other: &Self) -> Result<Self> {
        self.check_same_shape(other)?;
        let re = &self.re * &other.re - &(&self.im * &other.im);
        let im = &self.re * &other.im + &(&self.im * &other.re);
        Ok(Self { re, im })
    }

    /// Component-by-component product `(a·c) + (b·d)i`.
    pub fn mul_real_view(&self, other: &Self) -> Result<Self> {
        self.check_same_shape(other)?;
        Ok(Self {
            re: &self.re * &other.re,
            im: &self.im * &other.im,
        })
    }

    /// Pack into one array whose trailing axis has size 2 (real, imaginary).
    pub fn to_interleaved(&self) -> Result<ArrayD<f32>> {
        let axis = Axis(self.re.ndim());
        Ok(stack(axis, &[self.re.view().into_dyn(), self.im.view().into_dyn()])?)
    }

    /// Split an array with a trailing axis of size 2 into planes.
    pub fn from_interleaved(packed: &ArrayD<f32>) -> Result<Self> {
        let last = match packed.shape().last() {
            Some(&2) => packed.ndim() - 1,
            _ => {
                return Err(DcError::Config(format!(
                    "complex tensor needs a trailing axis of size 2, got shape {:?}",
                    packed.shape()
                )))
            }
        };
        let re = packed.index_axis(Axis(last), 0).to_owned().into_dimensionality::<D>()?;
        let im = packed.index_axis(Axis(last), 1).to_owned().into_dimensionality::<D>()?;
        Ok(Self { re, im })
    }

    fn check_same_shape(&self, other: &Self) -> Result<()> {
        if self.shape() != other.shape() {
            return Err(DcError::Config(format!(
                "complex operands differ in shape: {:?} vs {:?}",
                self.shape(),
                other.shape()
            )));
        }
        Ok(())
    }
}

impl ComplexTensor {
    pub fn channels(&self) -> usize {
        self.re.dim().0
    }

    /// Spatial `(freq, time)` extent.
    pub fn spatial(&self) -> (usize, usize) {
        let (_, h, w) = self.re.dim();
        (h, w)
    }

    /// Concatenate along the channel axis: `self` first, then `other`.
    pub fn concat_channels(&self, other: &Self) -> Result<Self> {
        if self.spatial() != other.spatial() {
            return Err(DcError::Config(format!(
                "cannot concatenate feature maps of extent {:?} and {:?}",
                self.spatial(),
                other.spatial()
            )));
        }
        Ok(Self {
            re: concatenate(Axis(0), &[self.re.view(), other.re.view()])?,
            im: concatenate(Axis(0), &[self.im.view(), other.im.view()])?,
        })
    }

    /// Drop a singleton channel axis.
    pub fn squeeze_channel(self) -> Result<ComplexSpectrogram> {
        if self.channels() != 1 {
            return Err(DcError::Config(format!(
                "cannot squeeze {} channels into a spectrogram",
                self.channels()
            )));
        }
        Ok(ComplexSpectrogram {
            re: self.re.index_axis_move(Axis(0), 0),
            im: self.im.index_axis_move(Axis(0), 0),
        })
    }
}

impl ComplexSpectrogram {
    /// Add a leading channel axis of size 1.
    pub fn into_tensor(self) -> ComplexTensor {
        ComplexTensor {
            re: self.re.insert_axis(Axis(0)),
            im: self.im.insert_axis(Axis(0)),
        }
    }
}
