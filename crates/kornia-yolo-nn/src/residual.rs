//! Residual family: blocks computing `x + F(x)`.
//!
//! Every constructor checks that `F` maps the input width back onto itself, so a block that
//! would need a broadcast or a projection on the identity path cannot be built.

use candle_core::{Result, Tensor, D};
use candle_nn::{linear, Linear, Module, VarBuilder};

use crate::chain::{Chain, Stacked};
use crate::conv::{max_pool_same, Activation, Conv, ConvConfig};
use crate::error::{ensure_channels, ensure_divisible, ensure_positive, BlockError};
use crate::traits::Block;

type BlockResult<T> = std::result::Result<T, BlockError>;

macro_rules! impl_residual {
    ($($ty:ty),* $(,)?) => {$(
        impl Module for $ty {
            fn forward(&self, xs: &Tensor) -> Result<Tensor> {
                xs + self.body(xs)?
            }
        }

        impl Block for $ty {
            fn out_channels(&self) -> usize {
                self.channels
            }
        }
    )*};
}

fn grouped(kernel: usize, stride: usize, groups: usize) -> ConvConfig {
    ConvConfig::new(kernel, stride).with_groups(groups)
}

/// `x + Conv3x3(Conv1x1(x))` with a bottleneck of `c2 / ratio` channels.
#[derive(Debug, Clone)]
pub struct ResidualBlock {
    m: Chain<Conv>,
    channels: usize,
}

impl ResidualBlock {
    /// Loads the block; requires `c1 == c2`.
    pub fn load(vb: VarBuilder, c1: usize, c2: usize, ratio: usize) -> BlockResult<Self> {
        ensure_positive("residual.ratio", ratio)?;
        ensure_channels(c1, c2)?;
        let c3 = ensure_positive("residual.hidden", c2 / ratio)?;
        let vb = vb.pp("m");
        let m = Chain::new(
            c1,
            vec![
                Conv::load(vb.pp("0"), c1, c3, 1, 1)?,
                Conv::load(vb.pp("1"), c3, c2, 3, 1)?,
            ],
        );
        Ok(Self { m, channels: c2 })
    }

    fn body(&self, xs: &Tensor) -> Result<Tensor> {
        self.m.forward(xs)
    }
}

/// Four-conv residual block with a bottleneck no narrower than 8 channels.
#[derive(Debug, Clone)]
pub struct ResidualBlock2 {
    m: Chain<Conv>,
    channels: usize,
}

impl ResidualBlock2 {
    /// Loads the block; requires `c1 == c2`.
    pub fn load(vb: VarBuilder, c1: usize, c2: usize, ratio: usize) -> BlockResult<Self> {
        ensure_positive("residual.ratio", ratio)?;
        ensure_channels(c1, c2)?;
        let c3 = (c2 / ratio).max(8);
        let vb = vb.pp("m");
        let m = Chain::new(
            c1,
            vec![
                Conv::load(vb.pp("0"), c1, c3, 1, 1)?,
                Conv::load(vb.pp("1"), c3, c3, 3, 1)?,
                Conv::load(vb.pp("2"), c3, c3, 1, 1)?,
                Conv::load(vb.pp("3"), c3, c2, 3, 1)?,
            ],
        );
        Ok(Self { m, channels: c2 })
    }

    fn body(&self, xs: &Tensor) -> Result<Tensor> {
        self.m.forward(xs)
    }
}

/// 1x1 / 3x3 / 1x1 bottleneck residual block.
#[derive(Debug, Clone)]
pub struct ResidualBlock3 {
    m: Chain<Conv>,
    channels: usize,
}

impl ResidualBlock3 {
    /// Loads the block; requires `c1 == c2`.
    pub fn load(vb: VarBuilder, c1: usize, c2: usize, ratio: usize) -> BlockResult<Self> {
        ensure_positive("residual.ratio", ratio)?;
        ensure_channels(c1, c2)?;
        let c3 = ensure_positive("residual.hidden", c2 / ratio)?;
        let vb = vb.pp("m");
        let m = Chain::new(
            c1,
            vec![
                Conv::load(vb.pp("0"), c1, c3, 1, 1)?,
                Conv::load(vb.pp("1"), c3, c3, 3, 1)?,
                Conv::load(vb.pp("2"), c3, c2, 1, 1)?,
            ],
        );
        Ok(Self { m, channels: c2 })
    }

    fn body(&self, xs: &Tensor) -> Result<Tensor> {
        self.m.forward(xs)
    }
}

/// Residual block whose identity path can be dropped once the auxiliary training signal
/// has been folded in.
#[derive(Debug, Clone)]
pub struct FuseResidualBlock {
    conv1: Conv,
    conv2: Conv,
    channels: usize,
}

impl FuseResidualBlock {
    /// Loads the block with a hidden width of `max(c1 * e, 8)`; requires `c1 == c2`.
    pub fn load(vb: VarBuilder, c1: usize, c2: usize, e: f64) -> BlockResult<Self> {
        ensure_channels(c1, c2)?;
        let c3 = ((c1 as f64 * e) as usize).max(8);
        Ok(Self {
            conv1: Conv::load(vb.pp("conv1"), c1, c3, 1, 1)?,
            conv2: Conv::load(vb.pp("conv2"), c3, c2, 3, 1)?,
            channels: c2,
        })
    }

    fn body(&self, xs: &Tensor) -> Result<Tensor> {
        self.conv2.forward(&self.conv1.forward(xs)?)
    }

    /// Deployment form without the identity path.
    pub fn forward_fuse(&self, xs: &Tensor) -> Result<Tensor> {
        self.body(xs)
    }
}

/// Squeeze-and-excitation channel gate.
#[derive(Debug, Clone)]
pub struct SeBlock {
    fc1: Linear,
    fc2: Linear,
    channels: usize,
}

impl SeBlock {
    /// Loads the gate with a squeeze width of `c1 / ratio`.
    pub fn load(vb: VarBuilder, c1: usize, ratio: usize) -> BlockResult<Self> {
        ensure_positive("se.ratio", ratio)?;
        let hidden = ensure_positive("se.hidden", c1 / ratio)?;
        Ok(Self {
            fc1: linear(c1, hidden, vb.pp("fc1"))?,
            fc2: linear(hidden, c1, vb.pp("fc2"))?,
            channels: c1,
        })
    }
}

impl Module for SeBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, c, _, _) = xs.dims4()?;
        // squeeze
        let ys = xs.mean(D::Minus1)?.mean(D::Minus1)?;
        // excitation
        let ys = self.fc1.forward(&ys)?.relu()?;
        let ys = candle_nn::ops::sigmoid(&self.fc2.forward(&ys)?)?;
        // scale
        xs.broadcast_mul(&ys.reshape((b, c, 1, 1))?)
    }
}

impl Block for SeBlock {
    fn out_channels(&self) -> usize {
        self.channels
    }
}

/// `x + Conv3x3(SE(x))`.
#[derive(Debug, Clone)]
pub struct SeResidualBlock {
    se: SeBlock,
    conv: Conv,
    channels: usize,
}

impl SeResidualBlock {
    /// Loads the block; requires `c1 == c2`.
    pub fn load(vb: VarBuilder, c1: usize, c2: usize, ratio: usize) -> BlockResult<Self> {
        ensure_channels(c1, c2)?;
        Ok(Self {
            se: SeBlock::load(vb.pp("se"), c1, ratio)?,
            conv: Conv::load(vb.pp("conv"), c1, c2, 3, 1)?,
            channels: c2,
        })
    }

    fn body(&self, xs: &Tensor) -> Result<Tensor> {
        self.conv.forward(&self.se.forward(xs)?)
    }
}

/// `x + Conv3x3(MaxPool(x))`.
#[derive(Debug, Clone)]
pub struct PoolResidualBlock {
    conv: Conv,
    pool_kernel: usize,
    channels: usize,
}

impl PoolResidualBlock {
    /// Loads the block; requires `c1 == c2`.
    pub fn load(vb: VarBuilder, c1: usize, c2: usize, pool_kernel: usize) -> BlockResult<Self> {
        ensure_channels(c1, c2)?;
        ensure_positive("pool.kernel", pool_kernel)?;
        Ok(Self {
            conv: Conv::load(vb.pp("conv"), c1, c2, 3, 1)?,
            pool_kernel,
            channels: c2,
        })
    }

    fn body(&self, xs: &Tensor) -> Result<Tensor> {
        self.conv
            .forward(&max_pool_same(xs, self.pool_kernel, 1)?)
    }
}

/// Grouped 3x3 conv followed by a 1x1 conv, added to the input.
#[derive(Debug, Clone)]
pub struct DwResidualBlock {
    conv1: Conv,
    conv2: Conv,
    channels: usize,
}

impl DwResidualBlock {
    /// Loads the block with `c1 / dwratio` groups; requires `c1 == c2`.
    pub fn load(vb: VarBuilder, c1: usize, c2: usize, dwratio: usize) -> BlockResult<Self> {
        ensure_channels(c1, c2)?;
        ensure_positive("dw.ratio", dwratio)?;
        let groups = ensure_positive("dw.groups", c1 / dwratio)?;
        Ok(Self {
            conv1: Conv::load_with(vb.pp("conv1"), c1, c2, grouped(3, 1, groups))?,
            conv2: Conv::load(vb.pp("conv2"), c2, c2, 1, 1)?,
            channels: c2,
        })
    }

    fn body(&self, xs: &Tensor) -> Result<Tensor> {
        self.conv2.forward(&self.conv1.forward(xs)?)
    }
}

/// Four-conv depthwise bottleneck residual block.
#[derive(Debug, Clone)]
pub struct DwResidualBlock2 {
    m: Chain<Conv>,
    channels: usize,
}

impl DwResidualBlock2 {
    /// Loads the block; the last conv is grouped only when `btratio == 1`.
    pub fn load(
        vb: VarBuilder,
        c1: usize,
        c2: usize,
        dwratio: usize,
        btratio: usize,
    ) -> BlockResult<Self> {
        ensure_channels(c1, c2)?;
        ensure_positive("dw.ratio", dwratio)?;
        ensure_positive("dw.btratio", btratio)?;
        let c3 = ensure_positive("dw.hidden", c2 / btratio)?;
        let g3 = ensure_positive("dw.groups", c3 / dwratio)?;
        let g4 = if btratio == 1 {
            ensure_positive("dw.groups", c2 / dwratio)?
        } else {
            1
        };
        let m = Chain::new(
            c1,
            vec![
                Conv::load(vb.pp("conv1"), c1, c3, 1, 1)?,
                Conv::load_with(vb.pp("conv2"), c3, c3, grouped(3, 1, g3))?,
                Conv::load(vb.pp("conv3"), c3, c3, 1, 1)?,
                Conv::load_with(vb.pp("conv4"), c3, c2, grouped(3, 1, g4))?,
            ],
        );
        Ok(Self { m, channels: c2 })
    }

    fn body(&self, xs: &Tensor) -> Result<Tensor> {
        self.m.forward(xs)
    }
}

/// 1x1 / grouped 3x3 / 1x1 bottleneck residual block.
#[derive(Debug, Clone)]
pub struct DwResidualBlock3 {
    m: Chain<Conv>,
    channels: usize,
}

impl DwResidualBlock3 {
    /// Loads the block; `dwratio == 0` selects an ungrouped middle conv.
    pub fn load(
        vb: VarBuilder,
        c1: usize,
        c2: usize,
        dwratio: usize,
        btratio: usize,
    ) -> BlockResult<Self> {
        ensure_channels(c1, c2)?;
        ensure_positive("dw.btratio", btratio)?;
        let c3 = ensure_positive("dw.hidden", c2 / btratio)?;
        let groups = if dwratio != 0 {
            ensure_positive("dw.groups", c3 / dwratio)?
        } else {
            1
        };
        let vb = vb.pp("m");
        let m = Chain::new(
            c1,
            vec![
                Conv::load(vb.pp("0"), c1, c3, 1, 1)?,
                Conv::load_with(vb.pp("1"), c3, c3, grouped(3, 1, groups))?,
                Conv::load(vb.pp("2"), c3, c2, 1, 1)?,
            ],
        );
        Ok(Self { m, channels: c2 })
    }

    fn body(&self, xs: &Tensor) -> Result<Tensor> {
        self.m.forward(xs)
    }
}

/// ResNeXt-style residual block with a grouped 3x3 conv of width `c1 * expand`.
#[derive(Debug, Clone)]
pub struct ResNextBlock {
    m: Chain<Conv>,
    channels: usize,
}

impl ResNextBlock {
    /// Loads the block; requires `c1 == c2`.
    pub fn load(
        vb: VarBuilder,
        c1: usize,
        c2: usize,
        expand: f64,
        dwratio: usize,
    ) -> BlockResult<Self> {
        ensure_channels(c1, c2)?;
        ensure_positive("resnext.dwratio", dwratio)?;
        let c3 = ensure_positive("resnext.hidden", (c1 as f64 * expand) as usize)?;
        let groups = ensure_positive("resnext.groups", c3 / dwratio)?;
        let m = Chain::new(
            c1,
            vec![
                Conv::load(vb.pp("conv1"), c1, c3, 1, 1)?,
                Conv::load_with(vb.pp("conv2"), c3, c3, grouped(3, 1, groups))?,
                Conv::load(vb.pp("conv3"), c3, c2, 1, 1)?,
            ],
        );
        Ok(Self { m, channels: c2 })
    }

    fn body(&self, xs: &Tensor) -> Result<Tensor> {
        self.m.forward(xs)
    }
}

/// Fire module: a 1x1 squeeze whose halves feed parallel 1x1 and 3x3 expansions.
#[derive(Debug, Clone)]
pub struct FireModule {
    conv1: Conv,
    conv2: Conv,
    conv3: Conv,
    channels: usize,
}

impl FireModule {
    /// Loads the module: a squeeze to `c2 / expand` channels, split into a 1x1 and a 3x3
    /// expansion of `c2 / 2` channels each; requires `c1 == c2`.
    pub fn load(vb: VarBuilder, c1: usize, c2: usize, expand: usize) -> BlockResult<Self> {
        ensure_channels(c1, c2)?;
        ensure_positive("fire.expand", expand)?;
        ensure_divisible("fire output channels", c2, 2)?;
        let c3 = ensure_positive("fire.squeeze", c2 / expand)?;
        ensure_divisible("fire squeeze channels", c3, 2)?;
        Ok(Self {
            conv1: Conv::load(vb.pp("conv1"), c1, c3, 1, 1)?,
            conv2: Conv::load(vb.pp("conv2"), c3 / 2, c2 / 2, 1, 1)?,
            conv3: Conv::load(vb.pp("conv3"), c3 / 2, c2 / 2, 3, 1)?,
            channels: c2,
        })
    }

    fn body(&self, xs: &Tensor) -> Result<Tensor> {
        let squeezed = self.conv1.forward(xs)?;
        let half = squeezed.dim(1)? / 2;
        let x1 = squeezed.narrow(1, 0, half)?;
        let x2 = squeezed.narrow(1, half, half)?;
        Tensor::cat(&[self.conv2.forward(&x1)?, self.conv3.forward(&x2)?], 1)
    }
}

impl_residual!(
    ResidualBlock,
    ResidualBlock2,
    ResidualBlock3,
    FuseResidualBlock,
    SeResidualBlock,
    PoolResidualBlock,
    DwResidualBlock,
    DwResidualBlock2,
    DwResidualBlock3,
    ResNextBlock,
    FireModule,
);

/// Inverted-bottleneck block with squeeze-excitation; residual only at stride 1.
#[derive(Debug, Clone)]
pub struct EfficientBlock {
    conv1: Conv,
    conv2: Conv,
    se: SeBlock,
    conv3: Conv,
    residual: bool,
}

impl EfficientBlock {
    /// Loads the block with an expansion width of `c1 * expand`.
    ///
    /// At stride 1 the identity path is active and `c1 == c2` is required.
    pub fn load(
        vb: VarBuilder,
        c1: usize,
        c2: usize,
        expand: f64,
        ratio: usize,
        stride: usize,
    ) -> BlockResult<Self> {
        let residual = stride == 1;
        if residual {
            ensure_channels(c1, c2)?;
        }
        let c3 = ensure_positive("efficient.hidden", (c1 as f64 * expand) as usize)?;
        Ok(Self {
            conv1: Conv::load(vb.pp("conv1"), c1, c3, 1, 1)?,
            conv2: Conv::load_with(vb.pp("conv2"), c3, c3, grouped(3, stride, c3))?,
            se: SeBlock::load(vb.pp("se"), c3, ratio)?,
            conv3: Conv::load_with(
                vb.pp("conv3"),
                c3,
                c2,
                ConvConfig::new(1, 1).with_act(Activation::Identity),
            )?,
            residual,
        })
    }
}

impl Module for EfficientBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = self.conv1.forward(xs)?;
        let ys = self.se.forward(&self.conv2.forward(&ys)?)?;
        let ys = self.conv3.forward(&ys)?;
        if self.residual {
            xs + ys
        } else {
            Ok(ys)
        }
    }
}

impl Block for EfficientBlock {
    fn out_channels(&self) -> usize {
        self.conv3.out_channels()
    }
}

/// Depthwise-separable convolution (MobileNet v1 unit).
#[derive(Debug, Clone)]
pub struct MobileBlock {
    conv1: Conv,
    conv2: Conv,
}

impl MobileBlock {
    /// Loads the depthwise 3x3 and pointwise 1x1 stages.
    pub fn load(vb: VarBuilder, c1: usize, c2: usize, stride: usize) -> BlockResult<Self> {
        Ok(Self {
            conv1: Conv::load_with(vb.pp("conv1"), c1, c1, grouped(3, stride, c1))?,
            conv2: Conv::load(vb.pp("conv2"), c1, c2, 1, 1)?,
        })
    }
}

impl Module for MobileBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.conv2.forward(&self.conv1.forward(xs)?)
    }
}

impl Block for MobileBlock {
    fn out_channels(&self) -> usize {
        self.conv2.out_channels()
    }
}

/// Inverted residual (MobileNet v2 unit); residual at stride 1 when `c1 == c2`.
#[derive(Debug, Clone)]
pub struct MobileBlockV2 {
    conv1: Conv,
    conv2: Conv,
    conv3: Conv,
    residual: bool,
}

impl MobileBlockV2 {
    /// Loads the block with an expansion width of `c1 * t`.
    pub fn load(vb: VarBuilder, c1: usize, c2: usize, stride: usize, t: usize) -> BlockResult<Self> {
        let c3 = ensure_positive("mobile.hidden", c1 * t)?;
        Ok(Self {
            conv1: Conv::load(vb.pp("conv1"), c1, c3, 1, 1)?,
            conv2: Conv::load_with(vb.pp("conv2"), c3, c3, grouped(3, stride, c3))?,
            conv3: Conv::load_with(
                vb.pp("conv3"),
                c3,
                c2,
                ConvConfig::new(1, 1).with_act(Activation::Identity),
            )?,
            residual: stride == 1 && c1 == c2,
        })
    }
}

impl Module for MobileBlockV2 {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = self
            .conv3
            .forward(&self.conv2.forward(&self.conv1.forward(xs)?)?)?;
        if self.residual {
            xs + ys
        } else {
            Ok(ys)
        }
    }
}

impl Block for MobileBlockV2 {
    fn out_channels(&self) -> usize {
        self.conv3.out_channels()
    }
}

/// Pointwise conv followed by a grouped 3x3 conv with `c2 / ratio` groups.
#[derive(Debug, Clone)]
pub struct XceptionBlock {
    conv1: Conv,
    conv2: Conv,
}

impl XceptionBlock {
    /// Loads the block.
    pub fn load(vb: VarBuilder, c1: usize, c2: usize, ratio: usize) -> BlockResult<Self> {
        ensure_positive("xception.ratio", ratio)?;
        let groups = ensure_positive("xception.groups", c2 / ratio)?;
        Ok(Self {
            conv1: Conv::load(vb.pp("conv1"), c1, c2, 1, 1)?,
            conv2: Conv::load_with(vb.pp("conv2"), c2, c2, grouped(3, 1, groups))?,
        })
    }
}

impl Module for XceptionBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.conv2.forward(&self.conv1.forward(xs)?)
    }
}

impl Block for XceptionBlock {
    fn out_channels(&self) -> usize {
        self.conv2.out_channels()
    }
}

/// `n` [`ResidualBlock`]s closed by a 1x1 conv.
pub type ResidualBlocks = Stacked<ResidualBlock>;
/// `n` [`ResidualBlock2`]s closed by a 1x1 conv.
pub type ResidualBlocks2 = Stacked<ResidualBlock2>;
/// `n` [`ResidualBlock3`]s closed by a 1x1 conv.
pub type ResidualBlocks3 = Stacked<ResidualBlock3>;
/// `n` [`FuseResidualBlock`]s closed by a 1x1 conv.
pub type FuseResidualBlocks = Stacked<FuseResidualBlock>;
/// `n` [`SeResidualBlock`]s closed by a 1x1 conv.
pub type SeResidualBlocks = Stacked<SeResidualBlock>;
/// `n` [`PoolResidualBlock`]s closed by a 1x1 conv.
pub type PoolResidualBlocks = Stacked<PoolResidualBlock>;
/// `n` [`DwResidualBlock`]s closed by a 1x1 conv.
pub type DwResidualBlocks = Stacked<DwResidualBlock>;
/// `n` [`DwResidualBlock2`]s closed by a 1x1 conv.
pub type DwResidualBlocks2 = Stacked<DwResidualBlock2>;
/// `n` [`DwResidualBlock3`]s closed by a 1x1 conv.
pub type DwResidualBlocks3 = Stacked<DwResidualBlock3>;
/// `n` [`ResNextBlock`]s closed by a 1x1 conv.
pub type ResNextBlocks = Stacked<ResNextBlock>;
/// `n` stride-1 [`EfficientBlock`]s closed by a 1x1 conv.
pub type EfficientBlocks = Stacked<EfficientBlock>;

/// Builds [`ResidualBlocks`].
pub fn residual_blocks(
    vb: VarBuilder,
    c1: usize,
    c2: usize,
    n: usize,
    ratio: usize,
) -> BlockResult<ResidualBlocks> {
    Stacked::load(vb, c1, c2, n, |vb, _| ResidualBlock::load(vb, c1, c2, ratio))
}

/// Builds [`ResidualBlocks2`].
pub fn residual_blocks2(
    vb: VarBuilder,
    c1: usize,
    c2: usize,
    n: usize,
    ratio: usize,
) -> BlockResult<ResidualBlocks2> {
    Stacked::load(vb, c1, c2, n, |vb, _| ResidualBlock2::load(vb, c1, c2, ratio))
}

/// Builds [`ResidualBlocks3`].
pub fn residual_blocks3(
    vb: VarBuilder,
    c1: usize,
    c2: usize,
    n: usize,
    ratio: usize,
) -> BlockResult<ResidualBlocks3> {
    Stacked::load(vb, c1, c2, n, |vb, _| ResidualBlock3::load(vb, c1, c2, ratio))
}

/// Builds [`FuseResidualBlocks`].
pub fn fuse_residual_blocks(
    vb: VarBuilder,
    c1: usize,
    c2: usize,
    n: usize,
    e: f64,
) -> BlockResult<FuseResidualBlocks> {
    Stacked::load(vb, c1, c2, n, |vb, _| FuseResidualBlock::load(vb, c1, c2, e))
}

/// Builds [`SeResidualBlocks`].
pub fn se_residual_blocks(
    vb: VarBuilder,
    c1: usize,
    c2: usize,
    n: usize,
    ratio: usize,
) -> BlockResult<SeResidualBlocks> {
    Stacked::load(vb, c1, c2, n, |vb, _| SeResidualBlock::load(vb, c1, c2, ratio))
}

/// Builds [`PoolResidualBlocks`].
pub fn pool_residual_blocks(
    vb: VarBuilder,
    c1: usize,
    c2: usize,
    n: usize,
    pool_kernel: usize,
) -> BlockResult<PoolResidualBlocks> {
    Stacked::load(vb, c1, c2, n, |vb, _| {
        PoolResidualBlock::load(vb, c1, c2, pool_kernel)
    })
}

/// Builds [`DwResidualBlocks`].
pub fn dw_residual_blocks(
    vb: VarBuilder,
    c1: usize,
    c2: usize,
    n: usize,
    dwratio: usize,
) -> BlockResult<DwResidualBlocks> {
    Stacked::load(vb, c1, c2, n, |vb, _| DwResidualBlock::load(vb, c1, c2, dwratio))
}

/// Builds [`DwResidualBlocks2`].
pub fn dw_residual_blocks2(
    vb: VarBuilder,
    c1: usize,
    c2: usize,
    n: usize,
    dwratio: usize,
    btratio: usize,
) -> BlockResult<DwResidualBlocks2> {
    Stacked::load(vb, c1, c2, n, |vb, _| {
        DwResidualBlock2::load(vb, c1, c2, dwratio, btratio)
    })
}

/// Builds [`DwResidualBlocks3`].
pub fn dw_residual_blocks3(
    vb: VarBuilder,
    c1: usize,
    c2: usize,
    n: usize,
    dwratio: usize,
    btratio: usize,
) -> BlockResult<DwResidualBlocks3> {
    Stacked::load(vb, c1, c2, n, |vb, _| {
        DwResidualBlock3::load(vb, c1, c2, dwratio, btratio)
    })
}

/// Builds [`ResNextBlocks`].
pub fn resnext_blocks(
    vb: VarBuilder,
    c1: usize,
    c2: usize,
    n: usize,
    expand: f64,
    dwratio: usize,
) -> BlockResult<ResNextBlocks> {
    Stacked::load(vb, c1, c2, n, |vb, _| {
        ResNextBlock::load(vb, c1, c2, expand, dwratio)
    })
}

/// Builds [`EfficientBlocks`].
pub fn efficient_blocks(
    vb: VarBuilder,
    c1: usize,
    c2: usize,
    n: usize,
    expand: f64,
    ratio: usize,
) -> BlockResult<EfficientBlocks> {
    Stacked::load(vb, c1, c2, n, |vb, _| {
        EfficientBlock::load(vb, c1, c2, expand, ratio, 1)
    })
}
