use candle_core::{Result, Tensor};
use candle_nn::{Module, VarBuilder};

use crate::conv::{max_pool_same, Conv};
use crate::error::{ensure_positive, BlockError};
use crate::ops::{interleave_channels, split_channels};
use crate::traits::Block;

/// Channel-shuffle block.
///
/// The input is projected into two paths of `c2 / 2` channels each: path A goes through a
/// `k x k` conv and path B through a `k x k` max pool with the same stride. The results are
/// interleaved so that even output channels come from path A and odd ones from path B.
///
/// With `c1 == c2` a single 1x1 projection is split into the two paths; with `c1 == c2 / 2`
/// each path gets its own 1x1 projection.
#[derive(Debug, Clone)]
pub struct ShuffleConv {
    conv1: Conv,
    conv2: Option<Conv>,
    conv3: Conv,
    c_in: usize,
    kernel: usize,
    stride: usize,
}

impl ShuffleConv {
    /// Loads the block.
    ///
    /// # Arguments
    ///
    /// * `vb` - Variable builder holding `conv1`, `conv2` and `conv3`.
    /// * `c1` - Input channels.
    /// * `c2` - Output channels, `c1` or `2 * c1`.
    /// * `kernel` - Kernel of the conv path and of the pool path.
    /// * `stride` - Stride of both paths.
    ///
    /// # Errors
    ///
    /// Fails unless `c1 == c2` (with `c1` even) or `c1 == c2 / 2`.
    pub fn load(
        vb: VarBuilder,
        c1: usize,
        c2: usize,
        kernel: usize,
        stride: usize,
    ) -> std::result::Result<Self, BlockError> {
        ensure_positive("shuffle.kernel", kernel)?;
        let split = c1 == c2;
        if !(split && c1 % 2 == 0) && !(c2 % 2 == 0 && c1 == c2 / 2) {
            return Err(BlockError::InvalidArgument(format!(
                "channel shuffle needs c1 == c2 (even) or c1 == c2 / 2, got {c1} -> {c2}"
            )));
        }
        let c_in = ensure_positive("shuffle.path", if split { c1 / 2 } else { c1 })?;

        let conv1 = Conv::load(vb.pp("conv1"), c1, c1, 1, 1)?;
        let conv2 = if split {
            None
        } else {
            Some(Conv::load(vb.pp("conv2"), c1, c1, 1, 1)?)
        };
        let conv3 = Conv::load(vb.pp("conv3"), c_in, c_in, kernel, stride)?;
        Ok(Self {
            conv1,
            conv2,
            conv3,
            c_in,
            kernel,
            stride,
        })
    }

    /// Computes the two paths before interleaving, `(conv path, pool path)`.
    pub fn paths(&self, xs: &Tensor) -> Result<(Tensor, Tensor)> {
        let (x1, x2) = match &self.conv2 {
            None => {
                let parts = split_channels(&self.conv1.forward(xs)?, &[self.c_in, self.c_in])?;
                (parts[0].clone(), parts[1].clone())
            }
            Some(conv2) => (self.conv1.forward(xs)?, conv2.forward(xs)?),
        };
        let y1 = self.conv3.forward(&x1)?;
        let y2 = max_pool_same(&x2, self.kernel, self.stride)?;
        Ok((y1, y2))
    }
}

impl Module for ShuffleConv {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (y1, y2) = self.paths(xs)?;
        interleave_channels(&y1, &y2)
    }
}

impl Block for ShuffleConv {
    fn out_channels(&self) -> usize {
        2 * self.c_in
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::{DType, Device, IndexOp};
    use candle_nn::VarMap;
    use std::error::Error;

    #[test]
    fn shuffle_output_width() -> std::result::Result<(), Box<dyn Error>> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let xs = Tensor::randn(0f32, 1f32, (1, 8, 8, 8), &Device::Cpu)?;

        let same = ShuffleConv::load(vb.pp("same"), 8, 8, 3, 1)?;
        assert_eq!(same.forward(&xs)?.dims4()?, (1, 8, 8, 8));

        let widen = ShuffleConv::load(vb.pp("widen"), 8, 16, 3, 2)?;
        assert_eq!(widen.forward(&xs)?.dims4()?, (1, 16, 4, 4));
        assert_eq!(widen.out_channels(), 16);

        assert!(ShuffleConv::load(vb.pp("bad"), 8, 12, 3, 1).is_err());
        Ok(())
    }

    #[test]
    fn shuffle_places_conv_path_on_even_channels() -> std::result::Result<(), Box<dyn Error>> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let block = ShuffleConv::load(vb, 4, 8, 3, 1)?;
        let xs = Tensor::randn(0f32, 1f32, (1, 4, 5, 5), &Device::Cpu)?;

        let (a, b) = block.paths(&xs)?;
        let merged = block.forward(&xs)?;
        for i in 0..4 {
            let even = (merged.i((.., 2 * i))? - a.i((.., i))?)?;
            let odd = (merged.i((.., 2 * i + 1))? - b.i((.., i))?)?;
            assert_relative_eq!(even.abs()?.max_all()?.to_scalar::<f32>()?, 0.0);
            assert_relative_eq!(odd.abs()?.max_all()?.to_scalar::<f32>()?, 0.0);
        }
        Ok(())
    }
}
