use candle_core::{Result, Tensor};
use candle_nn::{Module, VarBuilder};

use crate::conv::Conv;
use crate::error::BlockError;
use crate::traits::Block;

/// Blocks applied one after another.
///
/// An empty chain is the identity.
#[derive(Debug, Clone)]
pub struct Chain<B> {
    layers: Vec<B>,
    in_channels: usize,
}

impl<B: Block> Chain<B> {
    /// Wraps `layers`; `in_channels` is reported as the output width when `layers` is empty.
    pub fn new(in_channels: usize, layers: Vec<B>) -> Self {
        Self {
            layers,
            in_channels,
        }
    }

    /// Builds `n` layers, the `i`-th one from `vb.pp(i)`.
    pub fn load<F>(
        vb: VarBuilder,
        in_channels: usize,
        n: usize,
        mut build: F,
    ) -> std::result::Result<Self, BlockError>
    where
        F: FnMut(VarBuilder, usize) -> std::result::Result<B, BlockError>,
    {
        let layers = (0..n)
            .map(|i| build(vb.pp(i.to_string()), i))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self::new(in_channels, layers))
    }

    /// Number of layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Whether the chain is the identity.
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Iterates the layers in application order.
    pub fn iter(&self) -> impl Iterator<Item = &B> {
        self.layers.iter()
    }
}

impl<B: Block> Module for Chain<B> {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.layers
            .iter()
            .try_fold(xs.clone(), |acc, layer| layer.forward(&acc))
    }
}

impl<B: Block> Block for Chain<B> {
    fn out_channels(&self) -> usize {
        self.layers
            .last()
            .map_or(self.in_channels, |layer| layer.out_channels())
    }
}

/// `n` repeated blocks followed by a 1x1 [`Conv`] mixing their output.
///
/// Weights follow the `m.{i}` layout: blocks at `m.0 .. m.{n-1}`, the closing conv at `m.{n}`.
#[derive(Debug, Clone)]
pub struct Stacked<B> {
    blocks: Chain<B>,
    tail: Conv,
}

impl<B: Block> Stacked<B> {
    /// Builds the stack.
    ///
    /// # Arguments
    ///
    /// * `vb` - Variable builder of the whole stack.
    /// * `c1` - Input channels of the first block.
    /// * `c2` - Output channels of every block and of the closing conv.
    /// * `n` - Number of repeated blocks.
    /// * `build` - Builds the `i`-th block from its variable builder.
    pub fn load<F>(
        vb: VarBuilder,
        c1: usize,
        c2: usize,
        n: usize,
        build: F,
    ) -> std::result::Result<Self, BlockError>
    where
        F: FnMut(VarBuilder, usize) -> std::result::Result<B, BlockError>,
    {
        let vb = vb.pp("m");
        let blocks = Chain::load(vb.clone(), c1, n, build)?;
        let tail = Conv::load(vb.pp(n.to_string()), blocks.out_channels(), c2, 1, 1)?;
        Ok(Self { blocks, tail })
    }
}

impl<B: Block> Module for Stacked<B> {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.tail.forward(&self.blocks.forward(xs)?)
    }
}

impl<B: Block> Block for Stacked<B> {
    fn out_channels(&self) -> usize {
        self.tail.out_channels()
    }
}
