//! C2-style split blocks.
//!
//! The input is projected to `c2` channels and cut into two halves of `c2 / 2` channels. The
//! plain variants process one half and concatenate it with the other; the `F` variants keep
//! every intermediate output and concatenate all of them. `forward_split` cuts the halves with
//! explicit widths instead of chunking and yields the same tensor.

use candle_core::{bail, Result, Tensor};
use candle_nn::{Module, VarBuilder};

use crate::chain::Chain;
use crate::conv::{Conv, ConvConfig, RepConv};
use crate::error::{ensure_divisible, ensure_positive, BlockError};
use crate::ops::split_channels;
use crate::residual::{DwResidualBlock3, FireModule};
use crate::traits::Block;

type BlockResult<T> = std::result::Result<T, BlockError>;

/// How the projected input is cut into halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cut {
    Chunk,
    Split,
}

fn halves(xs: &Tensor, cut: Cut) -> Result<(Tensor, Tensor)> {
    let c = xs.dim(1)? / 2;
    let parts = match cut {
        Cut::Chunk => xs.chunk(2, 1)?,
        Cut::Split => split_channels(xs, &[c, c])?,
    };
    match <[Tensor; 2]>::try_from(parts) {
        Ok([a, b]) => Ok((a, b)),
        Err(parts) => bail!("expected two halves, got {}", parts.len()),
    }
}

/// Appends `block(last)` for every block, feeding each one the previous output.
fn extend_progressive<'a, B: Block + 'a>(
    ys: &mut Vec<Tensor>,
    blocks: impl Iterator<Item = &'a B>,
) -> Result<()> {
    for block in blocks {
        let last = match ys.last() {
            Some(last) => last,
            None => bail!("progressive concat needs a seed tensor"),
        };
        let next = block.forward(last)?;
        ys.push(next);
    }
    Ok(())
}

fn check_halves(c2: usize) -> BlockResult<usize> {
    ensure_divisible("split block output channels", c2, 2)?;
    ensure_positive("split block half", c2 / 2)
}

/// `conv2([b, m(a)])` where `a, b` are the halves of `conv1(x)`.
#[derive(Debug, Clone)]
pub struct C2Tiny {
    conv1: Conv,
    conv2: Conv,
    m: Chain<DwResidualBlock3>,
}

impl C2Tiny {
    /// Loads the block with `n` sequential [`DwResidualBlock3`]s.
    pub fn load(
        vb: VarBuilder,
        c1: usize,
        c2: usize,
        n: usize,
        dwratio: usize,
        btratio: usize,
    ) -> BlockResult<Self> {
        let c = check_halves(c2)?;
        Ok(Self {
            conv1: Conv::load(vb.pp("conv1"), c1, c2, 1, 1)?,
            conv2: Conv::load(vb.pp("conv2"), c2, c2, 1, 1)?,
            m: Chain::load(vb.pp("m"), c, n, |vb, _| {
                DwResidualBlock3::load(vb, c, c, dwratio, btratio)
            })?,
        })
    }
}

impl Module for C2Tiny {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (a, b) = halves(&self.conv1.forward(xs)?, Cut::Chunk)?;
        let y = self.m.forward(&a)?;
        self.conv2.forward(&Tensor::cat(&[b, y], 1)?)
    }
}

impl Block for C2Tiny {
    fn out_channels(&self) -> usize {
        self.conv2.out_channels()
    }
}

/// Progressive variant of [`C2Tiny`]: concatenates both halves and every block output.
#[derive(Debug, Clone)]
pub struct C2TinyF {
    conv1: Conv,
    conv2: Conv,
    m: Chain<DwResidualBlock3>,
}

impl C2TinyF {
    /// Loads the block with `n` [`DwResidualBlock3`]s.
    pub fn load(
        vb: VarBuilder,
        c1: usize,
        c2: usize,
        n: usize,
        dwratio: usize,
        btratio: usize,
    ) -> BlockResult<Self> {
        let c = check_halves(c2)?;
        Ok(Self {
            conv1: Conv::load(vb.pp("conv1"), c1, c2, 1, 1)?,
            conv2: Conv::load(vb.pp("conv2"), (n + 2) * c, c2, 1, 1)?,
            m: Chain::load(vb.pp("m"), c, n, |vb, _| {
                DwResidualBlock3::load(vb, c, c, dwratio, btratio)
            })?,
        })
    }

    fn run(&self, xs: &Tensor, cut: Cut) -> Result<Tensor> {
        let (a, b) = halves(&self.conv1.forward(xs)?, cut)?;
        let mut ys = vec![a, b];
        extend_progressive(&mut ys, self.m.iter())?;
        self.conv2.forward(&Tensor::cat(&ys, 1)?)
    }

    /// Same as [`Module::forward`], cutting the halves with explicit widths.
    pub fn forward_split(&self, xs: &Tensor) -> Result<Tensor> {
        self.run(xs, Cut::Split)
    }
}

impl Module for C2TinyF {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.run(xs, Cut::Chunk)
    }
}

impl Block for C2TinyF {
    fn out_channels(&self) -> usize {
        self.conv2.out_channels()
    }
}

/// Pointwise plus depthwise augmentation of the bypass half, concatenated after the
/// processed half.
#[derive(Debug, Clone)]
struct AugBranch {
    conv3: Conv,
    conv4: Conv,
}

impl AugBranch {
    fn load(vb: &VarBuilder, c2: usize) -> BlockResult<Self> {
        let q = ensure_positive("aug.quarter", c2 / 4)?;
        Ok(Self {
            conv3: Conv::load(vb.pp("conv3"), c2 / 2, q, 1, 1)?,
            conv4: Conv::load_with(vb.pp("conv4"), q, q, ConvConfig::new(3, 1).with_groups(q))?,
        })
    }

    /// Returns `(conv3(x), conv4(conv3(x)))`.
    fn forward(&self, xs: &Tensor) -> Result<(Tensor, Tensor)> {
        let y1 = self.conv3.forward(xs)?;
        let y2 = self.conv4.forward(&y1)?;
        Ok((y1, y2))
    }
}

/// `conv2([m(a), conv4(conv3(b)), conv3(b)])`; requires `c2 % 4 == 0`.
#[derive(Debug, Clone)]
pub struct C2Aug {
    conv1: Conv,
    conv2: Conv,
    aug: AugBranch,
    m: Chain<DwResidualBlock3>,
}

impl C2Aug {
    /// Loads the block with `n` sequential [`DwResidualBlock3`]s.
    pub fn load(
        vb: VarBuilder,
        c1: usize,
        c2: usize,
        n: usize,
        dwratio: usize,
        btratio: usize,
    ) -> BlockResult<Self> {
        ensure_divisible("aug output channels", c2, 4)?;
        let c = check_halves(c2)?;
        Ok(Self {
            conv1: Conv::load(vb.pp("conv1"), c1, c2, 1, 1)?,
            conv2: Conv::load(vb.pp("conv2"), c2, c2, 1, 1)?,
            aug: AugBranch::load(&vb, c2)?,
            m: Chain::load(vb.pp("m"), c, n, |vb, _| {
                DwResidualBlock3::load(vb, c, c, dwratio, btratio)
            })?,
        })
    }
}

impl Module for C2Aug {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (a, b) = halves(&self.conv1.forward(xs)?, Cut::Chunk)?;
        let y1 = self.m.forward(&a)?;
        let (x2, y2) = self.aug.forward(&b)?;
        self.conv2.forward(&Tensor::cat(&[y1, y2, x2], 1)?)
    }
}

impl Block for C2Aug {
    fn out_channels(&self) -> usize {
        self.conv2.out_channels()
    }
}

/// Progressive variant of [`C2Aug`]; the augmentation reads the first half.
#[derive(Debug, Clone)]
pub struct C2AugF {
    conv1: Conv,
    conv2: Conv,
    aug: AugBranch,
    m: Chain<DwResidualBlock3>,
}

impl C2AugF {
    /// Loads the block with `n` [`DwResidualBlock3`]s; requires `c2 % 4 == 0`.
    pub fn load(
        vb: VarBuilder,
        c1: usize,
        c2: usize,
        n: usize,
        dwratio: usize,
        btratio: usize,
    ) -> BlockResult<Self> {
        ensure_divisible("aug output channels", c2, 4)?;
        let c = check_halves(c2)?;
        Ok(Self {
            conv1: Conv::load(vb.pp("conv1"), c1, c2, 1, 1)?,
            conv2: Conv::load(vb.pp("conv2"), (n + 3) * c, c2, 1, 1)?,
            aug: AugBranch::load(&vb, c2)?,
            m: Chain::load(vb.pp("m"), c, n, |vb, _| {
                DwResidualBlock3::load(vb, c, c, dwratio, btratio)
            })?,
        })
    }

    fn run(&self, xs: &Tensor, cut: Cut) -> Result<Tensor> {
        let (a, b) = halves(&self.conv1.forward(xs)?, cut)?;
        let (y1, y2) = self.aug.forward(&a)?;
        let mut ys = vec![a, b];
        extend_progressive(&mut ys, self.m.iter())?;
        ys.push(Tensor::cat(&[y1, y2], 1)?);
        self.conv2.forward(&Tensor::cat(&ys, 1)?)
    }

    /// Same as [`Module::forward`], cutting the halves with explicit widths.
    pub fn forward_split(&self, xs: &Tensor) -> Result<Tensor> {
        self.run(xs, Cut::Split)
    }
}

impl Module for C2AugF {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.run(xs, Cut::Chunk)
    }
}

impl Block for C2AugF {
    fn out_channels(&self) -> usize {
        self.conv2.out_channels()
    }
}

/// `conv2([a, m(b)])` with `n` sequential [`FireModule`]s.
#[derive(Debug, Clone)]
pub struct FireC2 {
    conv1: Conv,
    conv2: Conv,
    m: Chain<FireModule>,
}

impl FireC2 {
    /// Loads the block.
    pub fn load(vb: VarBuilder, c1: usize, c2: usize, n: usize, expand: usize) -> BlockResult<Self> {
        let c = check_halves(c2)?;
        Ok(Self {
            conv1: Conv::load(vb.pp("conv1"), c1, c2, 1, 1)?,
            conv2: Conv::load(vb.pp("conv2"), c2, c2, 1, 1)?,
            m: Chain::load(vb.pp("m"), c, n, |vb, _| FireModule::load(vb, c, c, expand))?,
        })
    }
}

impl Module for FireC2 {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (a, b) = halves(&self.conv1.forward(xs)?, Cut::Chunk)?;
        let y = self.m.forward(&b)?;
        self.conv2.forward(&Tensor::cat(&[a, y], 1)?)
    }
}

impl Block for FireC2 {
    fn out_channels(&self) -> usize {
        self.conv2.out_channels()
    }
}

/// Progressive split block built from 3x3 [`RepConv`]s.
#[derive(Debug, Clone)]
pub struct RepC2f {
    cv1: Conv,
    cv2: Conv,
    m: Chain<RepConv>,
}

impl RepC2f {
    /// Loads the block with `n` [`RepConv`]s.
    pub fn load(vb: VarBuilder, c1: usize, c2: usize, n: usize) -> BlockResult<Self> {
        let c = check_halves(c2)?;
        Ok(Self {
            cv1: Conv::load(vb.pp("cv1"), c1, c2, 1, 1)?,
            cv2: Conv::load(vb.pp("cv2"), (n + 2) * c, c2, 1, 1)?,
            m: Chain::load(vb.pp("m"), c, n, |vb, _| RepConv::load(vb, c, c, 3, 1))?,
        })
    }

    fn run(&self, xs: &Tensor, cut: Cut) -> Result<Tensor> {
        let (a, b) = halves(&self.cv1.forward(xs)?, cut)?;
        let mut ys = vec![a, b];
        extend_progressive(&mut ys, self.m.iter())?;
        self.cv2.forward(&Tensor::cat(&ys, 1)?)
    }

    /// Same as [`Module::forward`], cutting the halves with explicit widths.
    pub fn forward_split(&self, xs: &Tensor) -> Result<Tensor> {
        self.run(xs, Cut::Split)
    }
}

impl Module for RepC2f {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.run(xs, Cut::Chunk)
    }
}

impl Block for RepC2f {
    fn out_channels(&self) -> usize {
        self.cv2.out_channels()
    }
}

/// `x + conv2(rep(conv1(x)))` with a bottleneck of `c / 2` channels.
#[derive(Debug, Clone)]
struct RelanUnit {
    conv1: Conv,
    rep: RepConv,
    conv2: Conv,
}

impl RelanUnit {
    fn load(vb: VarBuilder, c: usize) -> BlockResult<Self> {
        let h = ensure_positive("relan.hidden", c / 2)?;
        Ok(Self {
            conv1: Conv::load(vb.pp("0"), c, h, 1, 1)?,
            rep: RepConv::load(vb.pp("1"), h, h, 3, 1)?,
            conv2: Conv::load(vb.pp("2"), h, c, 1, 1)?,
        })
    }
}

impl Module for RelanUnit {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let ys = self.conv1.forward(xs)?;
        let ys = self.conv2.forward(&self.rep.forward(&ys)?)?;
        ys + xs
    }
}

impl Block for RelanUnit {
    fn out_channels(&self) -> usize {
        self.conv2.out_channels()
    }
}

/// Residual ELAN block: progressive split block whose units are residual
/// 1x1 / [`RepConv`] / 1x1 bottlenecks.
#[derive(Debug, Clone)]
pub struct Relan {
    cv1: Conv,
    cv2: Conv,
    m1: Chain<RelanUnit>,
}

impl Relan {
    /// Default number of units.
    pub const DEFAULT_UNITS: usize = 2;

    /// Loads the block with `n` units.
    pub fn load(vb: VarBuilder, c1: usize, c2: usize, n: usize) -> BlockResult<Self> {
        let c = check_halves(c2)?;
        Ok(Self {
            cv1: Conv::load(vb.pp("cv1"), c1, c2, 1, 1)?,
            cv2: Conv::load(vb.pp("cv2"), (n + 2) * c, c2, 1, 1)?,
            m1: Chain::load(vb.pp("m1"), c, n, |vb, _| RelanUnit::load(vb, c))?,
        })
    }
}

impl Module for Relan {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (a, b) = halves(&self.cv1.forward(xs)?, Cut::Split)?;
        let mut ys = vec![a, b];
        extend_progressive(&mut ys, self.m1.iter())?;
        self.cv2.forward(&Tensor::cat(&ys, 1)?)
    }
}

impl Block for Relan {
    fn out_channels(&self) -> usize {
        self.cv2.out_channels()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;
    use std::error::Error;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        (a - b)?.abs()?.max_all()?.to_scalar::<f32>()
    }

    #[test]
    fn split_blocks_shapes() -> std::result::Result<(), Box<dyn Error>> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let xs = Tensor::randn(0f32, 1f32, (2, 8, 5, 5), &Device::Cpu)?;

        let blocks: Vec<Box<dyn Block>> = vec![
            Box::new(C2Tiny::load(vb.pp("a"), 8, 16, 2, 1, 1)?),
            Box::new(C2TinyF::load(vb.pp("b"), 8, 16, 2, 1, 1)?),
            Box::new(C2Aug::load(vb.pp("c"), 8, 16, 1, 2, 2)?),
            Box::new(C2AugF::load(vb.pp("d"), 8, 16, 2, 0, 1)?),
            Box::new(FireC2::load(vb.pp("e"), 8, 16, 1, 2)?),
            Box::new(RepC2f::load(vb.pp("f"), 8, 16, 1)?),
            Box::new(Relan::load(vb.pp("g"), 8, 16, Relan::DEFAULT_UNITS)?),
        ];
        for block in blocks {
            assert_eq!(block.forward(&xs)?.dims4()?, (2, 16, 5, 5));
            assert_eq!(block.out_channels(), 16);
        }
        Ok(())
    }

    #[test]
    fn forward_split_matches_forward() -> std::result::Result<(), Box<dyn Error>> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let xs = Tensor::randn(0f32, 1f32, (1, 6, 4, 4), &Device::Cpu)?;

        let tiny = C2TinyF::load(vb.pp("tiny"), 6, 8, 2, 1, 1)?;
        assert_relative_eq!(
            max_abs_diff(&tiny.forward(&xs)?, &tiny.forward_split(&xs)?)?,
            0.0
        );

        let aug = C2AugF::load(vb.pp("aug"), 6, 8, 1, 1, 1)?;
        assert_relative_eq!(
            max_abs_diff(&aug.forward(&xs)?, &aug.forward_split(&xs)?)?,
            0.0
        );

        let rep = RepC2f::load(vb.pp("rep"), 6, 8, 2)?;
        assert_relative_eq!(
            max_abs_diff(&rep.forward(&xs)?, &rep.forward_split(&xs)?)?,
            0.0
        );
        Ok(())
    }

    #[test]
    fn split_blocks_reject_odd_widths() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        assert!(C2Tiny::load(vb.pp("a"), 8, 9, 1, 1, 1).is_err());
        assert!(matches!(
            C2Aug::load(vb.pp("b"), 8, 10, 1, 1, 1),
            Err(BlockError::Indivisible { divisor: 4, .. })
        ));
    }
}
