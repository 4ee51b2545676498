use candle_core::{Result, Tensor};
use candle_nn::{batch_norm, conv2d_no_bias, Conv2d, Conv2dConfig, Module, VarBuilder};

use crate::error::{ensure_divisible, ensure_positive, BlockError};
use crate::traits::Block;

/// Epsilon of the batch-norm layers folded into each [`Conv`].
pub const BN_EPS: f64 = 1e-3;

/// Activation applied after a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Activation {
    /// `x * sigmoid(x)`.
    #[default]
    Silu,
    /// `max(x, 0)`.
    Relu,
    /// No activation.
    Identity,
}

impl Activation {
    /// Applies the activation to `xs`.
    pub fn apply(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Activation::Silu => candle_nn::ops::silu(xs),
            Activation::Relu => xs.relu(),
            Activation::Identity => Ok(xs.clone()),
        }
    }
}

/// Layout of a [`Conv`] layer beyond its channel counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvConfig {
    /// Square kernel size.
    pub kernel: usize,
    /// Spatial stride.
    pub stride: usize,
    /// Number of channel groups.
    pub groups: usize,
    /// Activation applied to the output.
    pub act: Activation,
}

impl Default for ConvConfig {
    fn default() -> Self {
        Self {
            kernel: 1,
            stride: 1,
            groups: 1,
            act: Activation::Silu,
        }
    }
}

impl ConvConfig {
    /// Creates a config with the given kernel and stride, one group and SiLU.
    pub fn new(kernel: usize, stride: usize) -> Self {
        Self {
            kernel,
            stride,
            ..Default::default()
        }
    }

    /// Sets the number of channel groups.
    pub fn with_groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    /// Sets the activation.
    pub fn with_act(mut self, act: Activation) -> Self {
        self.act = act;
        self
    }
}

/// Convolution with folded batch normalization and an activation.
///
/// The padding is `kernel / 2` so that a stride-1 convolution keeps the spatial size.
#[derive(Debug, Clone)]
pub struct Conv {
    conv: Conv2d,
    act: Activation,
    out_channels: usize,
}

impl Conv {
    /// Loads a `kernel x kernel` convolution with SiLU activation.
    ///
    /// # Arguments
    ///
    /// * `vb` - Variable builder holding the `conv` and `bn` weights.
    /// * `c1` - Input channels.
    /// * `c2` - Output channels.
    /// * `kernel` - Kernel size.
    /// * `stride` - Spatial stride.
    pub fn load(
        vb: VarBuilder,
        c1: usize,
        c2: usize,
        kernel: usize,
        stride: usize,
    ) -> std::result::Result<Self, BlockError> {
        Self::load_with(vb, c1, c2, ConvConfig::new(kernel, stride))
    }

    /// Loads a convolution with an explicit [`ConvConfig`].
    ///
    /// # Errors
    ///
    /// Fails if any width is zero or if `c1`/`c2` are not divisible by the number of groups.
    pub fn load_with(
        vb: VarBuilder,
        c1: usize,
        c2: usize,
        cfg: ConvConfig,
    ) -> std::result::Result<Self, BlockError> {
        ensure_positive("conv.c1", c1)?;
        ensure_positive("conv.c2", c2)?;
        ensure_positive("conv.kernel", cfg.kernel)?;
        ensure_positive("conv.stride", cfg.stride)?;
        ensure_positive("conv.groups", cfg.groups)?;
        ensure_divisible("conv input channels", c1, cfg.groups)?;
        ensure_divisible("conv output channels", c2, cfg.groups)?;

        let conv_cfg = Conv2dConfig {
            padding: cfg.kernel / 2,
            stride: cfg.stride,
            groups: cfg.groups,
            ..Default::default()
        };
        let bn = batch_norm(c2, BN_EPS, vb.pp("bn"))?;
        let conv = conv2d_no_bias(c1, c2, cfg.kernel, conv_cfg, vb.pp("conv"))?.absorb_bn(&bn)?;

        Ok(Self {
            conv,
            act: cfg.act,
            out_channels: c2,
        })
    }
}

impl Module for Conv {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = self.conv.forward(xs)?;
        self.act.apply(&ys)
    }
}

impl Block for Conv {
    fn out_channels(&self) -> usize {
        self.out_channels
    }
}

/// Greatest common divisor, used to pick the group count of depthwise convolutions.
pub fn gcd(a: usize, b: usize) -> usize {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// Depthwise convolution: a [`Conv`] with `gcd(c1, c2)` groups.
pub fn dw_conv(
    vb: VarBuilder,
    c1: usize,
    c2: usize,
    kernel: usize,
    stride: usize,
    act: Activation,
) -> std::result::Result<Conv, BlockError> {
    let cfg = ConvConfig::new(kernel, stride)
        .with_groups(gcd(c1, c2))
        .with_act(act);
    Conv::load_with(vb, c1, c2, cfg)
}

/// Light convolution: a linear 1x1 projection followed by a depthwise `k x k` ReLU convolution.
#[derive(Debug, Clone)]
pub struct LightConv {
    conv1: Conv,
    conv2: Conv,
}

impl LightConv {
    /// Loads the two stages from `vb.pp("conv1")` and `vb.pp("conv2")`.
    pub fn load(
        vb: VarBuilder,
        c1: usize,
        c2: usize,
        kernel: usize,
    ) -> std::result::Result<Self, BlockError> {
        let conv1 = Conv::load_with(
            vb.pp("conv1"),
            c1,
            c2,
            ConvConfig::new(1, 1).with_act(Activation::Identity),
        )?;
        let conv2 = dw_conv(vb.pp("conv2"), c2, c2, kernel, 1, Activation::Relu)?;
        Ok(Self { conv1, conv2 })
    }
}

impl Module for LightConv {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.conv2.forward(&self.conv1.forward(xs)?)
    }
}

impl Block for LightConv {
    fn out_channels(&self) -> usize {
        self.conv2.out_channels()
    }
}

/// Re-parameterizable convolution in its training layout: the sum of a `k x k` and a 1x1
/// linear branch followed by SiLU.
#[derive(Debug, Clone)]
pub struct RepConv {
    conv1: Conv,
    conv2: Conv,
}

impl RepConv {
    /// Loads the `k x k` branch from `vb.pp("conv1")` and the 1x1 branch from `vb.pp("conv2")`.
    pub fn load(
        vb: VarBuilder,
        c1: usize,
        c2: usize,
        kernel: usize,
        stride: usize,
    ) -> std::result::Result<Self, BlockError> {
        let linear = |k| ConvConfig::new(k, stride).with_act(Activation::Identity);
        let conv1 = Conv::load_with(vb.pp("conv1"), c1, c2, linear(kernel))?;
        let conv2 = Conv::load_with(vb.pp("conv2"), c1, c2, linear(1))?;
        Ok(Self { conv1, conv2 })
    }
}

impl Module for RepConv {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = (self.conv1.forward(xs)? + self.conv2.forward(xs)?)?;
        candle_nn::ops::silu(&ys)
    }
}

impl Block for RepConv {
    fn out_channels(&self) -> usize {
        self.conv1.out_channels()
    }
}

/// Max pooling with `kernel / 2` padding.
///
/// The border is replicated instead of filled with `-inf`; every pooling window still contains
/// the edge element it replicates, so the result matches a `-inf` padded pool.
pub fn max_pool_same(xs: &Tensor, kernel: usize, stride: usize) -> Result<Tensor> {
    let pad = kernel / 2;
    xs.pad_with_same(2, pad, pad)?
        .pad_with_same(3, pad, pad)?
        .max_pool2d_with_stride(kernel, stride)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use std::error::Error;

    #[test]
    fn conv_keeps_spatial_size_at_stride_one() -> std::result::Result<(), Box<dyn Error>> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let conv = Conv::load(vb, 3, 8, 3, 1)?;
        let xs = Tensor::randn(0f32, 1f32, (2, 3, 10, 12), &Device::Cpu)?;
        let ys = conv.forward(&xs)?;
        assert_eq!(ys.dims4()?, (2, 8, 10, 12));
        assert_eq!(conv.out_channels(), 8);
        Ok(())
    }

    #[test]
    fn conv_rejects_bad_groups() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let res = Conv::load_with(vb, 6, 8, ConvConfig::new(3, 1).with_groups(4));
        assert!(matches!(res, Err(BlockError::Indivisible { .. })));
    }

    #[test]
    fn light_conv_and_rep_conv_shapes() -> std::result::Result<(), Box<dyn Error>> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let xs = Tensor::randn(0f32, 1f32, (1, 4, 9, 9), &Device::Cpu)?;

        let light = LightConv::load(vb.pp("light"), 4, 6, 3)?;
        assert_eq!(light.forward(&xs)?.dims4()?, (1, 6, 9, 9));

        let rep = RepConv::load(vb.pp("rep"), 4, 4, 3, 2)?;
        assert_eq!(rep.forward(&xs)?.dims4()?, (1, 4, 5, 5));
        Ok(())
    }

    #[test]
    fn max_pool_same_matches_manual_max() -> std::result::Result<(), Box<dyn Error>> {
        let data: Vec<f32> = vec![-1.0, -5.0, -3.0, -2.0, -4.0, -6.0, -7.0, -8.0, -9.0];
        let xs = Tensor::from_vec(data, (1, 1, 3, 3), &Device::Cpu)?;
        let ys = max_pool_same(&xs, 3, 1)?;
        assert_eq!(ys.dims4()?, (1, 1, 3, 3));
        let ys = ys.flatten_all()?.to_vec1::<f32>()?;
        // all values are negative: zero padding would have leaked 0.0 into the corners
        assert_eq!(ys, vec![-1.0, -1.0, -3.0, -1.0, -1.0, -3.0, -2.0, -2.0, -4.0]);
        Ok(())
    }

    #[test]
    fn gcd_picks_depthwise_groups() {
        assert_eq!(gcd(64, 64), 64);
        assert_eq!(gcd(32, 48), 16);
        assert_eq!(gcd(7, 3), 1);
    }
}
