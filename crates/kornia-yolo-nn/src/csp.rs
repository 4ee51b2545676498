//! Cross-stage-partial wrappers.
//!
//! A CSP block projects its input twice to `c2 / 2` channels, runs an inner block on the
//! second projection, concatenates `[first, inner(second)]` and mixes the result with a 1x1
//! conv back to `c2` channels.

use candle_core::{Result, Tensor};
use candle_nn::{Module, VarBuilder};

use crate::chain::{Chain, Stacked};
use crate::conv::Conv;
use crate::error::{ensure_channels, ensure_divisible, ensure_positive, BlockError};
use crate::multi_branch::InceptionBlock;
use crate::residual::{
    dw_residual_blocks, dw_residual_blocks2, dw_residual_blocks3, DwResidualBlock,
    DwResidualBlock2, DwResidualBlock3, EfficientBlock, FireModule, MobileBlock, ResidualBlock,
    XceptionBlock,
};
use crate::traits::Block;

type BlockResult<T> = std::result::Result<T, BlockError>;

/// CSP wrapper around an inner block `M`.
#[derive(Debug, Clone)]
pub struct Csp<M> {
    conv1: Conv,
    conv2: Conv,
    inner: M,
    conv3: Conv,
}

impl<M: Block> Csp<M> {
    /// Builds the wrapper.
    ///
    /// # Arguments
    ///
    /// * `vb` - Variable builder of the whole block.
    /// * `c1` - Input channels.
    /// * `c2` - Output channels, must be even.
    /// * `inner_name` - Prefix of the inner block's weights.
    /// * `build` - Builds the inner block given its variable builder and the branch width.
    ///
    /// # Errors
    ///
    /// Fails if `c2` is odd or if the inner block does not keep the branch width.
    pub fn load<F>(
        vb: VarBuilder,
        c1: usize,
        c2: usize,
        inner_name: &str,
        build: F,
    ) -> BlockResult<Self>
    where
        F: FnOnce(VarBuilder, usize) -> BlockResult<M>,
    {
        ensure_divisible("csp output channels", c2, 2)?;
        let c3 = ensure_positive("csp.branch", c2 / 2)?;
        let inner = build(vb.pp(inner_name), c3)?;
        ensure_channels(c3, inner.out_channels())?;
        Ok(Self {
            conv1: Conv::load(vb.pp("conv1"), c1, c3, 1, 1)?,
            conv2: Conv::load(vb.pp("conv2"), c1, c3, 1, 1)?,
            inner,
            conv3: Conv::load(vb.pp("conv3"), c2, c2, 1, 1)?,
        })
    }

    /// Widths of the bypass and the processed branch, in concatenation order.
    pub fn branch_widths(&self) -> [usize; 2] {
        [self.conv1.out_channels(), self.inner.out_channels()]
    }

    /// The inner block.
    pub fn inner(&self) -> &M {
        &self.inner
    }
}

impl<M: Block> Module for Csp<M> {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let x1 = self.conv1.forward(xs)?;
        let y = self.inner.forward(&self.conv2.forward(xs)?)?;
        self.conv3.forward(&Tensor::cat(&[x1, y], 1)?)
    }
}

impl<M: Block> Block for Csp<M> {
    fn out_channels(&self) -> usize {
        self.conv3.out_channels()
    }
}

/// CSP around `n` [`ResidualBlock`]s.
pub type CspResidualBlocks = Csp<Chain<ResidualBlock>>;
/// CSP around a stack of [`DwResidualBlock`]s.
pub type CspDwResidualBlocks = Csp<Stacked<DwResidualBlock>>;
/// CSP around a stack of [`DwResidualBlock2`]s.
pub type CspDwResidualBlocks2 = Csp<Stacked<DwResidualBlock2>>;
/// CSP around a stack of [`DwResidualBlock3`]s.
pub type CspDwResidualBlocks3 = Csp<Stacked<DwResidualBlock3>>;
/// CSP around one stride-1 [`EfficientBlock`].
pub type CspEfficientBlock = Csp<EfficientBlock>;
/// CSP around one [`InceptionBlock`].
pub type CspInceptionBlock = Csp<InceptionBlock>;
/// CSP around one [`XceptionBlock`].
pub type CspXceptionBlock = Csp<XceptionBlock>;
/// CSP around one stride-1 [`MobileBlock`].
pub type CspMobileBlock = Csp<MobileBlock>;
/// CSP around `n` [`FireModule`]s.
pub type FireC3 = Csp<Chain<FireModule>>;

/// Builds [`CspResidualBlocks`].
pub fn csp_residual_blocks(
    vb: VarBuilder,
    c1: usize,
    c2: usize,
    n: usize,
    ratio: usize,
) -> BlockResult<CspResidualBlocks> {
    Csp::load(vb, c1, c2, "m", |vb, c| {
        Chain::load(vb, c, n, |vb, _| ResidualBlock::load(vb, c, c, ratio))
    })
}

/// Builds [`CspDwResidualBlocks`].
pub fn csp_dw_residual_blocks(
    vb: VarBuilder,
    c1: usize,
    c2: usize,
    n: usize,
    dwratio: usize,
) -> BlockResult<CspDwResidualBlocks> {
    Csp::load(vb, c1, c2, "m", |vb, c| dw_residual_blocks(vb, c, c, n, dwratio))
}

/// Builds [`CspDwResidualBlocks2`].
pub fn csp_dw_residual_blocks2(
    vb: VarBuilder,
    c1: usize,
    c2: usize,
    n: usize,
    dwratio: usize,
    btratio: usize,
) -> BlockResult<CspDwResidualBlocks2> {
    Csp::load(vb, c1, c2, "m", |vb, c| {
        dw_residual_blocks2(vb, c, c, n, dwratio, btratio)
    })
}

/// Builds [`CspDwResidualBlocks3`].
pub fn csp_dw_residual_blocks3(
    vb: VarBuilder,
    c1: usize,
    c2: usize,
    n: usize,
    dwratio: usize,
    btratio: usize,
) -> BlockResult<CspDwResidualBlocks3> {
    Csp::load(vb, c1, c2, "m", |vb, c| {
        dw_residual_blocks3(vb, c, c, n, dwratio, btratio)
    })
}

/// Builds [`CspEfficientBlock`].
pub fn csp_efficient_block(
    vb: VarBuilder,
    c1: usize,
    c2: usize,
    expand: f64,
    ratio: usize,
) -> BlockResult<CspEfficientBlock> {
    Csp::load(vb, c1, c2, "efficient", |vb, c| {
        EfficientBlock::load(vb, c, c, expand, ratio, 1)
    })
}

/// Builds [`CspInceptionBlock`].
pub fn csp_inception_block(vb: VarBuilder, c1: usize, c2: usize) -> BlockResult<CspInceptionBlock> {
    Csp::load(vb, c1, c2, "inception", |vb, c| InceptionBlock::load(vb, c, c))
}

/// Builds [`CspXceptionBlock`].
pub fn csp_xception_block(
    vb: VarBuilder,
    c1: usize,
    c2: usize,
    ratio: usize,
) -> BlockResult<CspXceptionBlock> {
    Csp::load(vb, c1, c2, "xception", |vb, c| XceptionBlock::load(vb, c, c, ratio))
}

/// Builds [`CspMobileBlock`].
pub fn csp_mobile_block(vb: VarBuilder, c1: usize, c2: usize) -> BlockResult<CspMobileBlock> {
    Csp::load(vb, c1, c2, "mobile", |vb, c| MobileBlock::load(vb, c, c, 1))
}

/// Builds [`FireC3`].
pub fn fire_c3(vb: VarBuilder, c1: usize, c2: usize, n: usize, expand: usize) -> BlockResult<FireC3> {
    Csp::load(vb, c1, c2, "m", |vb, c| {
        Chain::load(vb, c, n, |vb, _| FireModule::load(vb, c, c, expand))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use std::error::Error;

    #[test]
    fn csp_family_shapes() -> std::result::Result<(), Box<dyn Error>> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let xs = Tensor::randn(0f32, 1f32, (1, 12, 6, 6), &Device::Cpu)?;

        let blocks: Vec<Box<dyn Block>> = vec![
            Box::new(csp_residual_blocks(vb.pp("a"), 12, 32, 2, 1)?),
            Box::new(csp_dw_residual_blocks(vb.pp("b"), 12, 32, 1, 2)?),
            Box::new(csp_dw_residual_blocks2(vb.pp("c"), 12, 32, 1, 2, 2)?),
            Box::new(csp_dw_residual_blocks3(vb.pp("d"), 12, 32, 2, 1, 1)?),
            Box::new(csp_efficient_block(vb.pp("e"), 12, 32, 2.0, 4)?),
            Box::new(csp_inception_block(vb.pp("f"), 12, 32)?),
            Box::new(csp_xception_block(vb.pp("g"), 12, 32, 4)?),
            Box::new(csp_mobile_block(vb.pp("h"), 12, 32)?),
            Box::new(fire_c3(vb.pp("i"), 12, 32, 2, 2)?),
        ];
        for block in blocks {
            assert_eq!(block.forward(&xs)?.dims4()?, (1, 32, 6, 6));
            assert_eq!(block.out_channels(), 32);
        }
        Ok(())
    }

    #[test]
    fn csp_branches_split_evenly() -> std::result::Result<(), Box<dyn Error>> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let block = csp_residual_blocks(vb.pp("a"), 8, 16, 1, 1)?;
        assert_eq!(block.branch_widths(), [8, 8]);
        assert_eq!(block.inner().len(), 1);

        assert!(matches!(
            csp_residual_blocks(vb.pp("b"), 8, 15, 1, 1),
            Err(BlockError::Indivisible { divisor: 2, .. })
        ));
        // inception needs a branch width divisible by 4
        assert!(csp_inception_block(vb.pp("c"), 8, 12).is_err());
        Ok(())
    }
}
