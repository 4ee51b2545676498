use crate::config::ExportFormat;

/// Output coding selected for a forward call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HeadMode {
    /// Raw per-scale projections for the loss.
    #[default]
    Training,
    /// Decoded predictions together with the raw per-scale projections.
    Inference,
    /// Decoded predictions only, coded for the given deployment format.
    Export(ExportFormat),
}

impl HeadMode {
    /// Builds the mode from the framework flags.
    ///
    /// `training` takes precedence over `export`; `format` is only read in export mode.
    pub fn from_flags(training: bool, export: bool, format: &str) -> Self {
        if training {
            HeadMode::Training
        } else if export {
            HeadMode::Export(ExportFormat::from(format))
        } else {
            HeadMode::Inference
        }
    }

    /// Whether the head returns raw projections.
    pub fn is_training(&self) -> bool {
        matches!(self, HeadMode::Training)
    }

    /// The export format, if exporting.
    pub fn export_format(&self) -> Option<&ExportFormat> {
        match self {
            HeadMode::Export(format) => Some(format),
            _ => None,
        }
    }
}
