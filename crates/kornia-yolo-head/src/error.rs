use kornia_yolo_nn::BlockError;

/// An error type for detection head construction, configuration and evaluation.
#[derive(thiserror::Error, Debug)]
pub enum HeadError {
    /// The head configuration is invalid.
    #[error("Invalid head configuration: {0}")]
    Config(String),

    /// The number of feature maps passed to the head does not match its number of scales.
    #[error("Expected {expected} feature maps, got {got}")]
    ScaleCountMismatch {
        /// Number of scales the head was built for.
        expected: usize,
        /// Number of feature maps received.
        got: usize,
    },

    /// A feature map has the wrong number of channels.
    #[error("Scale {scale}: expected {expected} channels, got {got}")]
    ChannelMismatch {
        /// Index of the offending scale.
        scale: usize,
        /// Number of channels expected.
        expected: usize,
        /// Number of channels received.
        got: usize,
    },

    /// A decoding forward pass was requested before the strides were set.
    #[error("Strides are not initialized; run a stride dry-run first")]
    StridesNotInitialized,

    /// Error raised while building a block.
    #[error(transparent)]
    Block(#[from] BlockError),

    /// Error raised by the tensor engine.
    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    /// Error raised while parsing a configuration.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Error raised while reading a configuration file.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
