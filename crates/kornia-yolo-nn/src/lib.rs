#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

/// Error types for block construction and evaluation.
///
/// Defines [`BlockError`] for invalid channel arithmetic and tensor engine failures.
pub mod error;

/// The [`Block`] trait shared by every layer of the catalog.
pub mod traits;

/// Convolution primitives: [`conv::Conv`] with folded batch norm, depthwise, light and
/// re-parameterizable convolutions, and same-padded max pooling.
pub mod conv;

/// Channel routing: chunk selection, exact splits, interleaving and the shortcut family.
pub mod ops;

/// Sequential containers.
pub mod chain;

/// Residual blocks and their stacked variants.
pub mod residual;

/// Cross-stage-partial blocks.
pub mod csp;

/// C2-style split blocks.
pub mod c2;

/// Inception and spatial pyramid pooling blocks.
pub mod multi_branch;

/// Channel-shuffle block.
pub mod shuffle;

pub use chain::{Chain, Stacked};
pub use conv::{Activation, Conv, ConvConfig, LightConv, RepConv};
pub use error::BlockError;
pub use traits::Block;
