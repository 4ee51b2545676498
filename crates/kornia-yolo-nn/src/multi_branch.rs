//! Multi-branch blocks that concatenate parallel paths along the channel axis.

use candle_core::{Result, Tensor};
use candle_nn::{Module, VarBuilder};

use crate::conv::{max_pool_same, Conv};
use crate::error::{ensure_divisible, ensure_positive, BlockError};
use crate::traits::Block;

type BlockResult<T> = std::result::Result<T, BlockError>;

/// Four parallel branches of `c2 / 4` channels each.
///
/// The branches are a 1x1/3x3/3x3 tower, a 1x1/3x3 tower, a 5x5 max pool followed by a 1x1
/// conv and a plain 1x1 conv.
#[derive(Debug, Clone)]
pub struct InceptionBlock {
    conv1: Conv,
    conv2: Conv,
    conv3: Conv,
    conv4: Conv,
    conv5: Conv,
    conv6: Conv,
    conv7: Conv,
    channels: usize,
}

impl InceptionBlock {
    /// Kernel of the pooling branch.
    pub const POOL_KERNEL: usize = 5;

    /// Loads the block.
    ///
    /// # Errors
    ///
    /// Fails unless `c2` is a positive multiple of 4.
    pub fn load(vb: VarBuilder, c1: usize, c2: usize) -> BlockResult<Self> {
        ensure_divisible("inception output channels", c2, 4)?;
        let c3 = ensure_positive("inception.branch", c2 / 4)?;
        Ok(Self {
            conv1: Conv::load(vb.pp("conv1"), c1, c3, 1, 1)?,
            conv2: Conv::load(vb.pp("conv2"), c3, c3, 3, 1)?,
            conv3: Conv::load(vb.pp("conv3"), c3, c3, 3, 1)?,
            conv4: Conv::load(vb.pp("conv4"), c1, c3, 1, 1)?,
            conv5: Conv::load(vb.pp("conv5"), c3, c3, 3, 1)?,
            conv6: Conv::load(vb.pp("conv6"), c1, c3, 1, 1)?,
            conv7: Conv::load(vb.pp("conv7"), c1, c3, 1, 1)?,
            channels: c2,
        })
    }

    /// Output widths of the four branches, in concatenation order.
    pub fn branch_widths(&self) -> [usize; 4] {
        [
            self.conv3.out_channels(),
            self.conv5.out_channels(),
            self.conv6.out_channels(),
            self.conv7.out_channels(),
        ]
    }
}

impl Module for InceptionBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let y1 = self
            .conv3
            .forward(&self.conv2.forward(&self.conv1.forward(xs)?)?)?;
        let y2 = self.conv5.forward(&self.conv4.forward(xs)?)?;
        let y3 = self
            .conv6
            .forward(&max_pool_same(xs, Self::POOL_KERNEL, 1)?)?;
        let y4 = self.conv7.forward(xs)?;
        Tensor::cat(&[y1, y2, y3, y4], 1)
    }
}

impl Block for InceptionBlock {
    fn out_channels(&self) -> usize {
        self.channels
    }
}

/// Spatial pyramid pooling with a CSP bypass, using three independent pool sizes.
#[derive(Debug, Clone)]
pub struct SppCsp {
    cv1: Conv,
    cv2: Conv,
    cv3: Conv,
    cv4: Conv,
    kernels: [usize; 3],
}

impl SppCsp {
    /// Default pool kernels.
    pub const DEFAULT_KERNELS: [usize; 3] = [5, 9, 13];

    /// Loads the block; requires an even `c2`.
    pub fn load(vb: VarBuilder, c1: usize, c2: usize, kernels: [usize; 3]) -> BlockResult<Self> {
        ensure_divisible("spp output channels", c2, 2)?;
        for k in kernels {
            ensure_positive("spp.kernel", k)?;
        }
        let c3 = c2 / 2;
        Ok(Self {
            cv1: Conv::load(vb.pp("cv1"), c1, c3, 1, 1)?,
            cv2: Conv::load(vb.pp("cv2"), c1, c3, 1, 1)?,
            cv3: Conv::load(vb.pp("cv3"), c3 * 4, c3, 1, 1)?,
            cv4: Conv::load(vb.pp("cv4"), c3 * 2, c2, 1, 1)?,
            kernels,
        })
    }
}

impl Module for SppCsp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let x1 = self.cv1.forward(xs)?;
        let x2 = self.cv2.forward(xs)?;
        let mut pyramid = vec![x1.clone()];
        for k in self.kernels {
            pyramid.push(max_pool_same(&x1, k, 1)?);
        }
        let y1 = self.cv3.forward(&Tensor::cat(&pyramid, 1)?)?;
        self.cv4.forward(&Tensor::cat(&[x2, y1], 1)?)
    }
}

impl Block for SppCsp {
    fn out_channels(&self) -> usize {
        self.cv4.out_channels()
    }
}

fn pool_cascade(xs: &Tensor, kernel: usize) -> Result<[Tensor; 3]> {
    let y1 = max_pool_same(xs, kernel, 1)?;
    let y2 = max_pool_same(&y1, kernel, 1)?;
    let y3 = max_pool_same(&y2, kernel, 1)?;
    Ok([y1, y2, y3])
}

/// Fast spatial pyramid pooling (one pool applied three times) with a CSP bypass.
#[derive(Debug, Clone)]
pub struct SppfCsp {
    conv1: Conv,
    conv2: Conv,
    conv3: Conv,
    conv4: Conv,
    kernel: usize,
}

impl SppfCsp {
    /// Loads the block; requires an even `c2`.
    pub fn load(vb: VarBuilder, c1: usize, c2: usize, kernel: usize) -> BlockResult<Self> {
        ensure_divisible("sppf output channels", c2, 2)?;
        ensure_positive("sppf.kernel", kernel)?;
        let c3 = c2 / 2;
        Ok(Self {
            conv1: Conv::load(vb.pp("conv1"), c1, c3, 1, 1)?,
            conv2: Conv::load(vb.pp("conv2"), c1, c3, 1, 1)?,
            conv3: Conv::load(vb.pp("conv3"), c3 * 4, c3, 1, 1)?,
            conv4: Conv::load(vb.pp("conv4"), c3 * 2, c2, 1, 1)?,
            kernel,
        })
    }
}

impl Module for SppfCsp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let x1 = self.conv1.forward(xs)?;
        let x2 = self.conv2.forward(xs)?;
        let [y1, y2, y3] = pool_cascade(&x2, self.kernel)?;
        let pooled = self.conv3.forward(&Tensor::cat(&[&x2, &y1, &y2, &y3], 1)?)?;
        self.conv4.forward(&Tensor::cat(&[x1, pooled], 1)?)
    }
}

impl Block for SppfCsp {
    fn out_channels(&self) -> usize {
        self.conv4.out_channels()
    }
}

/// Flat variant of [`SppfCsp`]: both branches and all three pools feed one 1x1 conv.
#[derive(Debug, Clone)]
pub struct SppfCspF {
    conv1: Conv,
    conv2: Conv,
    conv3: Conv,
    kernel: usize,
}

impl SppfCspF {
    /// Loads the block; requires an even `c2`.
    pub fn load(vb: VarBuilder, c1: usize, c2: usize, kernel: usize) -> BlockResult<Self> {
        ensure_divisible("sppf output channels", c2, 2)?;
        ensure_positive("sppf.kernel", kernel)?;
        let c3 = c2 / 2;
        Ok(Self {
            conv1: Conv::load(vb.pp("conv1"), c1, c3, 1, 1)?,
            conv2: Conv::load(vb.pp("conv2"), c1, c3, 1, 1)?,
            conv3: Conv::load(vb.pp("conv3"), c3 * 5, c2, 1, 1)?,
            kernel,
        })
    }
}

impl Module for SppfCspF {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let x1 = self.conv1.forward(xs)?;
        let x2 = self.conv2.forward(xs)?;
        let [y1, y2, y3] = pool_cascade(&x2, self.kernel)?;
        self.conv3.forward(&Tensor::cat(&[x1, x2, y1, y2, y3], 1)?)
    }
}

impl Block for SppfCspF {
    fn out_channels(&self) -> usize {
        self.conv3.out_channels()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use std::error::Error;

    #[test]
    fn inception_concatenates_four_equal_branches() -> std::result::Result<(), Box<dyn Error>> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let block = InceptionBlock::load(vb, 8, 32)?;
        assert_eq!(block.branch_widths(), [8, 8, 8, 8]);
        let xs = Tensor::randn(0f32, 1f32, (1, 8, 7, 7), &Device::Cpu)?;
        assert_eq!(block.forward(&xs)?.dims4()?, (1, 32, 7, 7));
        Ok(())
    }

    #[test]
    fn inception_requires_multiple_of_four() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(matches!(
            InceptionBlock::load(vb, 8, 30),
            Err(BlockError::Indivisible { divisor: 4, .. })
        ));
    }

    #[test]
    fn spp_variants_keep_spatial_size() -> std::result::Result<(), Box<dyn Error>> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let xs = Tensor::randn(0f32, 1f32, (2, 16, 10, 10), &Device::Cpu)?;

        let spp = SppCsp::load(vb.pp("spp"), 16, 32, SppCsp::DEFAULT_KERNELS)?;
        assert_eq!(spp.forward(&xs)?.dims4()?, (2, 32, 10, 10));

        let sppf = SppfCsp::load(vb.pp("sppf"), 16, 24, 5)?;
        assert_eq!(sppf.forward(&xs)?.dims4()?, (2, 24, 10, 10));

        let spp_flat = SppfCspF::load(vb.pp("sppf_flat"), 16, 8, 5)?;
        assert_eq!(spp_flat.forward(&xs)?.dims4()?, (2, 8, 10, 10));

        assert!(SppfCsp::load(vb.pp("odd"), 16, 7, 5).is_err());
        Ok(())
    }
}
