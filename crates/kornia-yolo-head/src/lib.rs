#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

/// Error types for the detection head.
pub mod error;

/// Head configuration: variants, class count, per-scale widths and export formats.
pub mod config;

/// Output modes of a forward call.
pub mod mode;

/// Anchor grid construction and caching.
pub mod anchors;

/// Box decoding: the DFL integral and distance-to-box conversion.
pub mod decode;

mod branch;

/// The detection head.
pub mod head;

pub use anchors::AnchorCache;
pub use config::{ExportFormat, HeadConfig, HeadVariant, PriorStyle, BOX_CHANNELS, REG_MAX};
pub use error::HeadError;
pub use head::{DetectionHead, HeadOutput, HeadStreams};
pub use mode::HeadMode;
