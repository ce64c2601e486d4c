//! Convolution and normalization layers, real and complex.
//!
//! All layers work on one unbatched feature map of shape `(channels, H, W)`.
//! A convolution is evaluated tap by tap: for every kernel position the strided
//! input patch is flattened to `(in, Ho·Wo)` and multiplied by the tap's
//! `(out, in)` weight matrix.

use crate::complex::ComplexTensor;
use crate::weights::{Init, ModelWeights, ParamSource};
use crate::{DcError, Result};
use ndarray::linalg::general_mat_mul;
use ndarray::{s, Array1, Array2, Array3, Array4, ArrayView2, Axis, CowArray, Ix1, Ix3, Ix4};

pub const BATCH_NORM_EPS: f32 = 1e-5;
pub const LEAKY_RELU_SLOPE: f32 = 0.01;

/// Kernel, stride and padding of one convolution, all as `(freq, time)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub kernel: (usize, usize),
    pub stride: (usize, usize),
    pub padding: (usize, usize),
    /// Extra rows/columns appended by a transposed convolution.
    pub output_padding: (usize, usize),
}

impl ConvGeometry {
    /// Spatial output of a forward convolution over `(h, w)`.
    pub fn conv_output(&self, (h, w): (usize, usize)) -> Option<(usize, usize)> {
        let hp = h + 2 * self.padding.0;
        let wp = w + 2 * self.padding.1;
        if hp < self.kernel.0 || wp < self.kernel.1 {
            return None;
        }
        Some((
            (hp - self.kernel.0) / self.stride.0 + 1,
            (wp - self.kernel.1) / self.stride.1 + 1,
        ))
    }

    /// Spatial output of a transposed convolution over `(h, w)`:
    /// `(H − 1)·stride − 2·padding + kernel + output_padding`.
    pub fn transposed_output(&self, (h, w): (usize, usize)) -> Option<(usize, usize)> {
        if h == 0 || w == 0 {
            return None;
        }
        let full_h = (h - 1) * self.stride.0 + self.kernel.0 + self.output_padding.0;
        let full_w = (w - 1) * self.stride.1 + self.kernel.1 + self.output_padding.1;
        let out_h = full_h.checked_sub(2 * self.padding.0)?;
        let out_w = full_w.checked_sub(2 * self.padding.1)?;
        if out_h == 0 || out_w == 0 {
            return None;
        }
        Some((out_h, out_w))
    }
}

// ─────────────────────────── Conv2d ───────────────────────────

#[derive(Debug, Clone)]
pub struct Conv2d {
    /// `(out, in, kh, kw)`
    weight: Array4<f32>,
    bias: Array1<f32>,
    geometry: ConvGeometry,
}

impl Conv2d {
    /// Build from a weight of shape `(out, in, kh, kw)` and a bias of shape `(out,)`.
    pub fn from_weights(
        weight: Array4<f32>,
        bias: Array1<f32>,
        stride: (usize, usize),
        padding: (usize, usize),
    ) -> Result<Self> {
        let (out_channels, _, kh, kw) = weight.dim();
        if bias.len() != out_channels {
            return Err(DcError::Weights(format!(
                "conv bias has {} entries for {} output channels",
                bias.len(),
                out_channels
            )));
        }
        if stride.0 == 0 || stride.1 == 0 {
            return Err(DcError::Config("convolution stride must be positive".to_string()));
        }
        Ok(Self {
            weight,
            bias,
            geometry: ConvGeometry {
                kernel: (kh, kw),
                stride,
                padding,
                output_padding: (0, 0),
            },
        })
    }

    pub(crate) fn load(
        params: &mut ParamSource,
        prefix: &str,
        in_channels: usize,
        out_channels: usize,
        geometry: &ConvGeometry,
    ) -> Result<Self> {
        let (kh, kw) = geometry.kernel;
        let (fan_in, fan_out) = (in_channels * kh * kw, out_channels * kh * kw);
        let weight = params
            .get(
                &format!("{}.weight", prefix),
                &[out_channels, in_channels, kh, kw],
                Init::glorot(fan_in, fan_out),
            )?
            .into_dimensionality::<Ix4>()?;
        let bias = params
            .get(&format!("{}.bias", prefix), &[out_channels], Init::fan_in(fan_in))?
            .into_dimensionality::<Ix1>()?;
        Self::from_weights(weight, bias, geometry.stride, geometry.padding)
    }

    pub(crate) fn export(&self, prefix: &str, weights: &mut ModelWeights) {
        weights.insert(format!("{}.weight", prefix), self.weight.clone().into_dyn());
        weights.insert(format!("{}.bias", prefix), self.bias.clone().into_dyn());
    }

    pub fn in_channels(&self) -> usize {
        self.weight.dim().1
    }

    pub fn out_channels(&self) -> usize {
        self.bias.len()
    }

    /// The `(out, in)` weight matrix of kernel position `(i, j)`.
    fn tap(&self, i: usize, j: usize) -> ArrayView2<'_, f32> {
        self.weight.slice(s![.., .., i, j])
    }

    pub fn forward(&self, x: &Array3<f32>) -> Result<Array3<f32>> {
        let (cin, h, w) = x.dim();
        if cin != self.in_channels() {
            return Err(DcError::Config(format!(
                "conv expects {} input channels, got {}",
                self.in_channels(),
                cin
            )));
        }
        let g = &self.geometry;
        let (ho, wo) = g.conv_output((h, w)).ok_or_else(|| {
            DcError::Config(format!("input {}x{} smaller than kernel {:?}", h, w, g.kernel))
        })?;

        let (ph, pw) = g.padding;
        let padded: CowArray<f32, Ix3> = if ph == 0 && pw == 0 {
            x.view().into()
        } else {
            let mut p = Array3::zeros((cin, h + 2 * ph, w + 2 * pw));
            p.slice_mut(s![.., ph..ph + h, pw..pw + w]).assign(x);
            p.into()
        };

        let (sh, sw) = g.stride;
        let (kh, kw) = g.kernel;
        let mut out = Array2::<f32>::zeros((self.out_channels(), ho * wo));
        for i in 0..kh {
            for j in 0..kw {
                let patch = padded
                    .slice(s![.., i..i + (ho - 1) * sh + 1;sh, j..j + (wo - 1) * sw + 1;sw])
                    .to_owned()
                    .into_shape_with_order((cin, ho * wo))?;
                general_mat_mul(1.0, &self.tap(i, j), &patch, 1.0, &mut out);
            }
        }
        out += &self.bias.view().insert_axis(Axis(1));
        Ok(out.into_shape_with_order((self.out_channels(), ho, wo))?)
    }
}

// ─────────────────────── ConvTranspose2d ───────────────────────

#[derive(Debug, Clone)]
pub struct ConvTranspose2d {
    /// `(in, out, kh, kw)`
    weight: Array4<f32>,
    bias: Array1<f32>,
    geometry: ConvGeometry,
}

impl ConvTranspose2d {
    /// Build from a weight of shape `(in, out, kh, kw)` and a bias of shape `(out,)`.
    pub fn from_weights(
        weight: Array4<f32>,
        bias: Array1<f32>,
        stride: (usize, usize),
        padding: (usize, usize),
        output_padding: (usize, usize),
    ) -> Result<Self> {
        let (_, out_channels, kh, kw) = weight.dim();
        if bias.len() != out_channels {
            return Err(DcError::Weights(format!(
                "transposed conv bias has {} entries for {} output channels",
                bias.len(),
                out_channels
            )));
        }
        if stride.0 == 0 || stride.1 == 0 {
            return Err(DcError::Config("convolution stride must be positive".to_string()));
        }
        Ok(Self {
            weight,
            bias,
            geometry: ConvGeometry {
                kernel: (kh, kw),
                stride,
                padding,
                output_padding,
            },
        })
    }

    pub(crate) fn load(
        params: &mut ParamSource,
        prefix: &str,
        in_channels: usize,
        out_channels: usize,
        geometry: &ConvGeometry,
    ) -> Result<Self> {
        let (kh, kw) = geometry.kernel;
        let (fan_in, fan_out) = (in_channels * kh * kw, out_channels * kh * kw);
        let weight = params
            .get(
                &format!("{}.weight", prefix),
                &[in_channels, out_channels, kh, kw],
                Init::glorot(fan_in, fan_out),
            )?
            .into_dimensionality::<Ix4>()?;
        let bias = params
            .get(&format!("{}.bias", prefix), &[out_channels], Init::fan_in(fan_in))?
            .into_dimensionality::<Ix1>()?;
        Self::from_weights(
            weight,
            bias,
            geometry.stride,
            geometry.padding,
            geometry.output_padding,
        )
    }

    pub(crate) fn export(&self, prefix: &str, weights: &mut ModelWeights) {
        weights.insert(format!("{}.weight", prefix), self.weight.clone().into_dyn());
        weights.insert(format!("{}.bias", prefix), self.bias.clone().into_dyn());
    }

    pub fn in_channels(&self) -> usize {
        self.weight.dim().0
    }

    pub fn out_channels(&self) -> usize {
        self.bias.len()
    }

    /// The `(out, in)` weight matrix of kernel position `(i, j)`.
    fn tap(&self, i: usize, j: usize) -> ArrayView2<'_, f32> {
        self.weight.slice(s![.., .., i, j]).reversed_axes()
    }

    pub fn forward(&self, x: &Array3<f32>) -> Result<Array3<f32>> {
        let (cin, h, w) = x.dim();
        if cin != self.in_channels() {
            return Err(DcError::Config(format!(
                "transposed conv expects {} input channels, got {}",
                self.in_channels(),
                cin
            )));
        }
        let g = &self.geometry;
        let (ho, wo) = g.transposed_output((h, w)).ok_or_else(|| {
            DcError::Config(format!("transposed conv cannot produce output from {}x{}", h, w))
        })?;

        let (sh, sw) = g.stride;
        let (kh, kw) = g.kernel;
        let cout = self.out_channels();
        let flat = x.to_shape((cin, h * w))?;

        // Scatter every tap's contribution into the uncropped output
        let mut full = Array3::<f32>::zeros((
            cout,
            (h - 1) * sh + kh + g.output_padding.0,
            (w - 1) * sw + kw + g.output_padding.1,
        ));
        let mut product = Array2::<f32>::zeros((cout, h * w));
        for i in 0..kh {
            for j in 0..kw {
                general_mat_mul(1.0, &self.tap(i, j), &flat, 0.0, &mut product);
                let contribution = product.view().into_shape_with_order((cout, h, w))?;
                let mut target = full.slice_mut(s![.., i..i + (h - 1) * sh + 1;sh, j..j + (w - 1) * sw + 1;sw]);
                target += &contribution;
            }
        }

        let (ph, pw) = g.padding;
        let mut out = full.slice(s![.., ph..ph + ho, pw..pw + wo]).to_owned();
        out += &self.bias.view().insert_axis(Axis(1)).insert_axis(Axis(2));
        Ok(out)
    }
}

// ───────────────────────── BatchNorm2d ─────────────────────────

/// Inference-mode batch normalization folded into a per-channel affine map.
#[derive(Debug, Clone)]
pub struct BatchNorm2d {
    weight: Array1<f32>,
    bias: Array1<f32>,
    running_mean: Array1<f32>,
    running_var: Array1<f32>,
    scale: Array1<f32>,
    shift: Array1<f32>,
}

impl BatchNorm2d {
    pub fn from_stats(
        weight: Array1<f32>,
        bias: Array1<f32>,
        running_mean: Array1<f32>,
        running_var: Array1<f32>,
        eps: f32,
    ) -> Result<Self> {
        let n = weight.len();
        if bias.len() != n || running_mean.len() != n || running_var.len() != n {
            return Err(DcError::Weights(format!(
                "batch norm statistics disagree in length ({}/{}/{}/{})",
                n,
                bias.len(),
                running_mean.len(),
                running_var.len()
            )));
        }
        let scale = &weight / &running_var.mapv(|v| (v + eps).sqrt());
        let shift = &bias - &(&running_mean * &scale);
        Ok(Self {
            weight,
            bias,
            running_mean,
            running_var,
            scale,
            shift,
        })
    }

    pub(crate) fn load(params: &mut ParamSource, prefix: &str, channels: usize) -> Result<Self> {
        let mut stat = |name: &str, value: f32| -> Result<Array1<f32>> {
            Ok(params
                .get(&format!("{}.{}", prefix, name), &[channels], Init::Const(value))?
                .into_dimensionality::<Ix1>()?)
        };
        let weight = stat("weight", 1.0)?;
        let bias = stat("bias", 0.0)?;
        let running_mean = stat("running_mean", 0.0)?;
        let running_var = stat("running_var", 1.0)?;
        Self::from_stats(weight, bias, running_mean, running_var, BATCH_NORM_EPS)
    }

    pub(crate) fn export(&self, prefix: &str, weights: &mut ModelWeights) {
        for (name, stat) in [
            ("weight", &self.weight),
            ("bias", &self.bias),
            ("running_mean", &self.running_mean),
            ("running_var", &self.running_var),
        ] {
            weights.insert(format!("{}.{}", prefix, name), stat.clone().into_dyn());
        }
    }

    pub fn forward_inplace(&self, x: &mut Array3<f32>) -> Result<()> {
        if x.dim().0 != self.scale.len() {
            return Err(DcError::Config(format!(
                "batch norm over {} channels applied to {}",
                self.scale.len(),
                x.dim().0
            )));
        }
        for (c, mut plane) in x.axis_iter_mut(Axis(0)).enumerate() {
            let (scale, shift) = (self.scale[c], self.shift[c]);
            plane.mapv_inplace(|v| v * scale + shift);
        }
        Ok(())
    }
}

pub fn leaky_relu(x: f32) -> f32 {
    if x >= 0.0 {
        x
    } else {
        LEAKY_RELU_SLOPE * x
    }
}

// ─────────────────────── Complex wrappers ──────────────────────

/// `W * x` for complex `W = Wr + i·Wi` and `x = xr + i·xi`, from two real convolutions.
#[derive(Debug, Clone)]
pub struct ComplexConv2d {
    pub real: Conv2d,
    pub imag: Conv2d,
}

impl ComplexConv2d {
    pub(crate) fn load(
        params: &mut ParamSource,
        prefix: &str,
        in_channels: usize,
        out_channels: usize,
        geometry: &ConvGeometry,
    ) -> Result<Self> {
        Ok(Self {
            real: Conv2d::load(params, &format!("{}.real_conv", prefix), in_channels, out_channels, geometry)?,
            imag: Conv2d::load(params, &format!("{}.im_conv", prefix), in_channels, out_channels, geometry)?,
        })
    }

    pub(crate) fn export(&self, prefix: &str, weights: &mut ModelWeights) {
        self.real.export(&format!("{}.real_conv", prefix), weights);
        self.imag.export(&format!("{}.im_conv", prefix), weights);
    }

    pub fn forward(&self, x: &ComplexTensor) -> Result<ComplexTensor> {
        let re = self.real.forward(&x.re)? - self.imag.forward(&x.im)?;
        let im = self.imag.forward(&x.re)? + self.real.forward(&x.im)?;
        ComplexTensor::new(re, im)
    }
}

#[derive(Debug, Clone)]
pub struct ComplexConvTranspose2d {
    pub real: ConvTranspose2d,
    pub imag: ConvTranspose2d,
}

impl ComplexConvTranspose2d {
    pub(crate) fn load(
        params: &mut ParamSource,
        prefix: &str,
        in_channels: usize,
        out_channels: usize,
        geometry: &ConvGeometry,
    ) -> Result<Self> {
        Ok(Self {
            real: ConvTranspose2d::load(params, &format!("{}.real_convt", prefix), in_channels, out_channels, geometry)?,
            imag: ConvTranspose2d::load(params, &format!("{}.im_convt", prefix), in_channels, out_channels, geometry)?,
        })
    }

    pub(crate) fn export(&self, prefix: &str, weights: &mut ModelWeights) {
        self.real.export(&format!("{}.real_convt", prefix), weights);
        self.imag.export(&format!("{}.im_convt", prefix), weights);
    }

    pub fn forward(&self, x: &ComplexTensor) -> Result<ComplexTensor> {
        let re = self.real.forward(&x.re)? - self.imag.forward(&x.im)?;
        let im = self.imag.forward(&x.re)? + self.real.forward(&x.im)?;
        ComplexTensor::new(re, im)
    }
}

/// Independent batch normalization of the real and imaginary planes.
#[derive(Debug, Clone)]
pub struct ComplexBatchNorm2d {
    pub real: BatchNorm2d,
    pub imag: BatchNorm2d,
}

impl ComplexBatchNorm2d {
    pub(crate) fn load(params: &mut ParamSource, prefix: &str, channels: usize) -> Result<Self> {
        Ok(Self {
            real: BatchNorm2d::load(params, &format!("{}.real_b", prefix), channels)?,
            imag: BatchNorm2d::load(params, &format!("{}.im_b", prefix), channels)?,
        })
    }

    pub(crate) fn export(&self, prefix: &str, weights: &mut ModelWeights) {
        self.real.export(&format!("{}.real_b", prefix), weights);
        self.imag.export(&format!("{}.im_b", prefix), weights);
    }

    pub fn forward_inplace(&self, x: &mut ComplexTensor) -> Result<()> {
        self.real.forward_inplace(&mut x.re)?;
        self.imag.forward_inplace(&mut x.im)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use num_complex::Complex32;

    fn geometry(kernel: (usize, usize), stride: (usize, usize), padding: (usize, usize)) -> ConvGeometry {
        ConvGeometry {
            kernel,
            stride,
            padding,
            output_padding: (0, 0),
        }
    }

    /// Direct-loop reference convolution.
    fn naive_conv(x: &Array3<f32>, w: &Array4<f32>, b: &Array1<f32>, g: &ConvGeometry) -> Array3<f32> {
        let (cin, h, wd) = x.dim();
        let (cout, _, kh, kw) = w.dim();
        let (ho, wo) = g.conv_output((h, wd)).unwrap();
        let mut out = Array3::zeros((cout, ho, wo));
        for o in 0..cout {
            for y in 0..ho {
                for z in 0..wo {
                    let mut acc = b[o];
                    for c in 0..cin {
                        for i in 0..kh {
                            for j in 0..kw {
                                let yy = (y * g.stride.0 + i) as isize - g.padding.0 as isize;
                                let zz = (z * g.stride.1 + j) as isize - g.padding.1 as isize;
                                if yy >= 0 && zz >= 0 && (yy as usize) < h && (zz as usize) < wd {
                                    acc += w[[o, c, i, j]] * x[[c, yy as usize, zz as usize]];
                                }
                            }
                        }
                    }
                    out[[o, y, z]] = acc;
                }
            }
        }
        out
    }

    fn ramp3(shape: (usize, usize, usize)) -> Array3<f32> {
        Array3::from_shape_fn(shape, |(a, b, c)| ((a * 7 + b * 3 + c) % 11) as f32 * 0.1 - 0.5)
    }

    fn ramp4(shape: (usize, usize, usize, usize)) -> Array4<f32> {
        Array4::from_shape_fn(shape, |(a, b, c, d)| ((a * 5 + b * 3 + c * 2 + d) % 7) as f32 * 0.2 - 0.6)
    }

    #[test]
    fn test_conv_matches_direct_loop() {
        let x = ramp3((2, 9, 8));
        let w = ramp4((3, 2, 3, 2));
        let b = array![0.1, -0.2, 0.3];
        for g in [
            geometry((3, 2), (1, 1), (0, 0)),
            geometry((3, 2), (2, 1), (0, 0)),
            geometry((3, 2), (2, 2), (1, 1)),
        ] {
            let conv = Conv2d::from_weights(w.clone(), b.clone(), g.stride, g.padding).unwrap();
            let got = conv.forward(&x).unwrap();
            let expected = naive_conv(&x, &w, &b, &g);
            assert_eq!(got.dim(), expected.dim());
            for (a, e) in got.iter().zip(expected.iter()) {
                assert!((a - e).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_conv_rejects_wrong_channels() {
        let conv = Conv2d::from_weights(Array4::zeros((1, 2, 1, 1)), Array1::zeros(1), (1, 1), (0, 0)).unwrap();
        assert!(conv.forward(&Array3::zeros((3, 4, 4))).is_err());
    }

    #[test]
    fn test_transposed_conv_is_adjoint_of_conv() {
        // <conv(x), y> == <convT(y), x> with zero biases and the same weight tensor
        let g = geometry((3, 2), (2, 2), (0, 0));
        let w = ramp4((3, 2, 3, 2));
        let x = ramp3((2, 9, 8));
        let conv = Conv2d::from_weights(w.clone(), Array1::zeros(3), g.stride, g.padding).unwrap();
        let cx = conv.forward(&x).unwrap();
        let y = ramp3(cx.dim()).mapv(|v| v + 0.05);

        // (out, in, kh, kw) doubles as (in, out, kh, kw) for the adjoint
        let convt = ConvTranspose2d::from_weights(w, Array1::zeros(2), g.stride, g.padding, (0, 0)).unwrap();
        let ty = convt.forward(&y).unwrap();
        assert_eq!(ty.dim(), (2, 9, 8));

        let lhs: f32 = (&cx * &y).sum();
        let rhs: f32 = (&ty * &x).sum();
        assert!((lhs - rhs).abs() < 1e-3, "{} vs {}", lhs, rhs);
    }

    #[test]
    fn test_transposed_output_size() {
        let g = ConvGeometry {
            kernel: (6, 3),
            stride: (2, 1),
            padding: (0, 0),
            output_padding: (0, 0),
        };
        assert_eq!(g.transposed_output((2, 8)), Some((8, 10)));
        let padded = ConvGeometry {
            kernel: (1, 7),
            stride: (1, 1),
            padding: (0, 3),
            output_padding: (0, 0),
        };
        assert_eq!(padded.transposed_output((1537, 215)), Some((1537, 215)));
    }

    #[test]
    fn test_transposed_conv_bias_and_crop() {
        let w = Array4::from_elem((1, 1, 1, 3), 1.0);
        let convt = ConvTranspose2d::from_weights(w, array![0.5], (1, 1), (0, 1), (0, 0)).unwrap();
        let y = convt.forward(&Array3::from_elem((1, 1, 4), 1.0)).unwrap();
        // full row is [1,2,3,3,2,1]; cropping one column each side leaves [2,3,3,2]
        assert_eq!(y.into_raw_vec_and_offset().0, vec![2.5, 3.5, 3.5, 2.5]);
    }

    #[test]
    fn test_batch_norm_folds_statistics() {
        let bn = BatchNorm2d::from_stats(array![2.0], array![1.0], array![3.0], array![4.0], 0.0).unwrap();
        let mut x = Array3::from_elem((1, 1, 2), 5.0);
        bn.forward_inplace(&mut x).unwrap();
        // 2 * (5 - 3) / 2 + 1
        assert!(x.iter().all(|&v| (v - 3.0).abs() < 1e-6));
    }

    #[test]
    fn test_complex_conv_is_complex_multiplication() {
        // 1x1 kernels: Wr = 2, Wi = 3, no bias. (2 + 3i)(1 - 1i) = 5 + 1i
        let real = Conv2d::from_weights(Array4::from_elem((1, 1, 1, 1), 2.0), array![0.0], (1, 1), (0, 0)).unwrap();
        let imag = Conv2d::from_weights(Array4::from_elem((1, 1, 1, 1), 3.0), array![0.0], (1, 1), (0, 0)).unwrap();
        let conv = ComplexConv2d { real, imag };
        let x = ComplexTensor::new(Array3::from_elem((1, 2, 2), 1.0), Array3::from_elem((1, 2, 2), -1.0)).unwrap();
        let y = conv.forward(&x).unwrap();
        assert!(y.re.iter().all(|&v| (v - 5.0).abs() < 1e-6));
        assert!(y.im.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    fn wave4(shape: (usize, usize, usize, usize)) -> Array4<f32> {
        Array4::from_shape_fn(shape, |(a, b, c, d)| ((a * 3 + b * 7 + c * 5 + d * 2) as f32 * 0.9).sin() * 0.4)
    }

    fn complex_input(shape: (usize, usize, usize)) -> ComplexTensor {
        let im = Array3::from_shape_fn(shape, |(a, b, c)| ((a * 2 + b * 5 + c * 3) as f32 * 0.7).cos() * 0.3);
        ComplexTensor::new(ramp3(shape), im).unwrap()
    }

    fn assert_close(got: &ComplexTensor, expected: &Array3<Complex32>) {
        assert_eq!(got.re.dim(), expected.dim());
        for ((re, im), e) in got.re.iter().zip(got.im.iter()).zip(expected.iter()) {
            assert!((re - e.re).abs() < 1e-4, "re {} vs {}", re, e.re);
            assert!((im - e.im).abs() < 1e-4, "im {} vs {}", im, e.im);
        }
    }

    /// Each real layer adds its own bias, so `(Wr + iWi) * x` gains `(br - bi) + i(br + bi)`.
    fn complex_bias(br: f32, bi: f32) -> Complex32 {
        Complex32::new(br - bi, br + bi)
    }

    #[test]
    fn test_complex_conv_matches_direct_loop() {
        let g = geometry((3, 2), (2, 2), (1, 1));
        let (wr, wi) = (ramp4((2, 3, 3, 2)), wave4((2, 3, 3, 2)));
        let (br, bi) = (array![0.3, -0.1], array![-0.2, 0.4]);
        let conv = ComplexConv2d {
            real: Conv2d::from_weights(wr.clone(), br.clone(), g.stride, g.padding).unwrap(),
            imag: Conv2d::from_weights(wi.clone(), bi.clone(), g.stride, g.padding).unwrap(),
        };
        let x = complex_input((3, 9, 8));
        let got = conv.forward(&x).unwrap();

        let (ho, wo) = g.conv_output((9, 8)).unwrap();
        let mut expected = Array3::<Complex32>::zeros((2, ho, wo));
        for ((o, y, z), out) in expected.indexed_iter_mut() {
            let mut acc = complex_bias(br[o], bi[o]);
            for c in 0..3 {
                for i in 0..3 {
                    for j in 0..2 {
                        let yy = (y * g.stride.0 + i) as isize - g.padding.0 as isize;
                        let zz = (z * g.stride.1 + j) as isize - g.padding.1 as isize;
                        if yy < 0 || zz < 0 || yy >= 9 || zz >= 8 {
                            continue;
                        }
                        let (yy, zz) = (yy as usize, zz as usize);
                        let w = Complex32::new(wr[[o, c, i, j]], wi[[o, c, i, j]]);
                        acc += w * Complex32::new(x.re[[c, yy, zz]], x.im[[c, yy, zz]]);
                    }
                }
            }
            *out = acc;
        }
        assert_close(&got, &expected);
    }

    #[test]
    fn test_complex_transposed_conv_matches_scatter_loop() {
        let g = geometry((3, 2), (2, 1), (1, 0));
        // (in, out, kh, kw)
        let (wr, wi) = (ramp4((3, 2, 3, 2)), wave4((3, 2, 3, 2)));
        let (br, bi) = (array![0.25, -0.5], array![0.1, 0.35]);
        let convt = ComplexConvTranspose2d {
            real: ConvTranspose2d::from_weights(wr.clone(), br.clone(), g.stride, g.padding, (0, 0)).unwrap(),
            imag: ConvTranspose2d::from_weights(wi.clone(), bi.clone(), g.stride, g.padding, (0, 0)).unwrap(),
        };
        let x = complex_input((3, 4, 5));
        let got = convt.forward(&x).unwrap();

        let (ho, wo) = g.transposed_output((4, 5)).unwrap();
        assert_eq!((ho, wo), (7, 6));
        let mut full = Array3::<Complex32>::zeros((2, 3 * 2 + 3, 4 + 2));
        for ((c, y, z), re) in x.re.indexed_iter() {
            let v = Complex32::new(*re, x.im[[c, y, z]]);
            for o in 0..2 {
                for i in 0..3 {
                    for j in 0..2 {
                        let w = Complex32::new(wr[[c, o, i, j]], wi[[c, o, i, j]]);
                        full[[o, y * g.stride.0 + i, z * g.stride.1 + j]] += w * v;
                    }
                }
            }
        }
        let mut expected = full.slice(s![.., 1..1 + ho, 0..wo]).to_owned();
        for (o, mut plane) in expected.axis_iter_mut(Axis(0)).enumerate() {
            let bias = complex_bias(br[o], bi[o]);
            plane.mapv_inplace(|v| v + bias);
        }
        assert_close(&got, &expected);
    }

    #[test]
    fn test_complex_batch_norm_keeps_planes_apart() {
        let mut weights = ModelWeights::new();
        let stats: [(&str, [f32; 2]); 8] = [
            ("real_b.weight", [2.0, 1.0]),
            ("real_b.bias", [1.0, 0.0]),
            ("real_b.running_mean", [3.0, 5.0]),
            ("real_b.running_var", [4.0, 1.0]),
            ("im_b.weight", [0.5, 3.0]),
            ("im_b.bias", [-1.0, 2.0]),
            ("im_b.running_mean", [1.0, -5.0]),
            ("im_b.running_var", [16.0, 9.0]),
        ];
        for (name, values) in stats {
            weights.insert(format!("cbn.{}", name), Array1::from(values.to_vec()).into_dyn());
        }
        let mut params = ParamSource::loaded(&weights);
        let norm = ComplexBatchNorm2d::load(&mut params, "cbn", 2).unwrap();
        params.finish().unwrap();

        let mut x = ComplexTensor::new(Array3::from_elem((2, 2, 3), 5.0), Array3::from_elem((2, 2, 3), 5.0)).unwrap();
        norm.forward_inplace(&mut x).unwrap();
        // real: 2·(5−3)/2 + 1 and 1·(5−5)/1 + 0; imag: 0.5·(5−1)/4 − 1 and 3·(5+5)/3 + 2
        for (c, (re, im)) in [(3.0, -0.5), (0.0, 12.0)].into_iter().enumerate() {
            assert!(x.re.index_axis(Axis(0), c).iter().all(|v| (v - re).abs() < 1e-3));
            assert!(x.im.index_axis(Axis(0), c).iter().all(|v| (v - im).abs() < 1e-3));
        }
    }

    #[test]
    fn test_export_restores_loaded_names() {
        let mut params = ParamSource::random(9);
        let g = geometry((3, 2), (2, 1), (1, 0));
        let conv = ComplexConvTranspose2d::load(&mut params, "dec.cconvt", 3, 2, &g).unwrap();
        let norm = ComplexBatchNorm2d::load(&mut params, "dec.cbn", 2).unwrap();
        params.finish().unwrap();

        let mut exported = ModelWeights::new();
        conv.export("dec.cconvt", &mut exported);
        norm.export("dec.cbn", &mut exported);
        assert_eq!(exported.len(), 12);
        assert_eq!(exported.get("dec.cconvt.im_convt.weight").map(|w| w.shape().to_vec()), Some(vec![3, 2, 3, 2]));

        let mut reloaded = ParamSource::loaded(&exported);
        let again = ComplexConvTranspose2d::load(&mut reloaded, "dec.cconvt", 3, 2, &g).unwrap();
        ComplexBatchNorm2d::load(&mut reloaded, "dec.cbn", 2).unwrap();
        reloaded.finish().unwrap();
        let x = complex_input((3, 4, 5));
        assert_eq!(conv.forward(&x).unwrap(), again.forward(&x).unwrap());
    }

    #[test]
    fn test_leaky_relu() {
        assert_eq!(leaky_relu(2.0), 2.0);
        assert!((leaky_relu(-2.0) + 0.02).abs() < 1e-7);
    }
}
