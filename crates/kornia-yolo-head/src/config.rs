use std::{fmt, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::HeadError;

/// Number of discretized distance bins per box side.
pub const REG_MAX: usize = 16;

/// Number of box channels of a projected scale, `4 * REG_MAX`.
pub const BOX_CHANNELS: usize = 4 * REG_MAX;

/// How the class prior of a head is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorStyle {
    /// `bias_init` writes the prior into the final projection biases.
    Bias,
    /// `bias_init` records a per-scale prior that every forward call adds to the raw logits,
    /// together with a constant `+1.0` on the box channels.
    Additive,
}

/// The detection head variants, named as in model descriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HeadVariant {
    /// Independent box and class stems, each a 1x1 conv plus a light conv.
    DetectorTiny,
    /// Shared stem to `no` channels; 1x1 projections read the box and class slices.
    #[serde(rename = "DetectorTinyv2")]
    DetectorTinyV2,
    /// Shared stem to `no` channels; both 1x1 projections read the whole stem output.
    #[serde(rename = "DetectorTinyv3")]
    DetectorTinyV3,
    /// Shared stem to `4 * REG_MAX + 32` channels.
    #[serde(rename = "DetectorTinyv4")]
    DetectorTinyV4,
    /// Shared conv plus light conv stem to `4 * REG_MAX + 32` channels.
    #[serde(rename = "DetectorTinyv5")]
    DetectorTinyV5,
    /// Shared conv plus light conv stem to `8 * REG_MAX` channels.
    #[serde(rename = "DetectorTinyv6")]
    DetectorTinyV6,
    /// Optional 1x1 projection to `no` channels followed by a per-channel 1x1 conv.
    DetectorPrototype,
    /// Inputs already carry `no` channels; 1x1 convs on the box and class slices.
    DetectorPrototype2,
    /// A single `k x k` conv to `no` channels.
    DetectorPrototype3,
    /// No projection: inputs already carry `no` channels.
    DetectorPrototype4,
    /// Four-layer fused stack per scale.
    NDetect,
    /// Fused stacks with a prunable auxiliary stream on every second scale.
    NDetectAux,
    /// Fused stacks with two prunable auxiliary streams on every second and third scale.
    NDetectAuxDual,
}

impl HeadVariant {
    /// Every variant, in declaration order.
    pub const ALL: [HeadVariant; 13] = [
        HeadVariant::DetectorTiny,
        HeadVariant::DetectorTinyV2,
        HeadVariant::DetectorTinyV3,
        HeadVariant::DetectorTinyV4,
        HeadVariant::DetectorTinyV5,
        HeadVariant::DetectorTinyV6,
        HeadVariant::DetectorPrototype,
        HeadVariant::DetectorPrototype2,
        HeadVariant::DetectorPrototype3,
        HeadVariant::DetectorPrototype4,
        HeadVariant::NDetect,
        HeadVariant::NDetectAux,
        HeadVariant::NDetectAuxDual,
    ];

    /// The model-description name of the variant.
    pub fn name(&self) -> &'static str {
        match self {
            HeadVariant::DetectorTiny => "DetectorTiny",
            HeadVariant::DetectorTinyV2 => "DetectorTinyv2",
            HeadVariant::DetectorTinyV3 => "DetectorTinyv3",
            HeadVariant::DetectorTinyV4 => "DetectorTinyv4",
            HeadVariant::DetectorTinyV5 => "DetectorTinyv5",
            HeadVariant::DetectorTinyV6 => "DetectorTinyv6",
            HeadVariant::DetectorPrototype => "DetectorPrototype",
            HeadVariant::DetectorPrototype2 => "DetectorPrototype2",
            HeadVariant::DetectorPrototype3 => "DetectorPrototype3",
            HeadVariant::DetectorPrototype4 => "DetectorPrototype4",
            HeadVariant::NDetect => "NDetect",
            HeadVariant::NDetectAux => "NDetectAux",
            HeadVariant::NDetectAuxDual => "NDetectAuxDual",
        }
    }

    /// Number of interleaved branch sets the scales are routed to.
    pub fn demux(&self) -> usize {
        match self {
            HeadVariant::NDetectAux => 2,
            HeadVariant::NDetectAuxDual => 3,
            _ => 1,
        }
    }

    /// Whether the head carries auxiliary streams that can be pruned.
    pub fn is_auxiliary(&self) -> bool {
        self.demux() > 1
    }

    /// How the class prior is applied.
    pub fn prior_style(&self) -> PriorStyle {
        match self {
            HeadVariant::DetectorPrototype3
            | HeadVariant::DetectorPrototype4
            | HeadVariant::NDetect
            | HeadVariant::NDetectAux
            | HeadVariant::NDetectAuxDual => PriorStyle::Additive,
            _ => PriorStyle::Bias,
        }
    }

    /// Whether the variant reads feature maps that already carry `no` channels.
    pub fn requires_projected_input(&self) -> bool {
        matches!(
            self,
            HeadVariant::DetectorPrototype2 | HeadVariant::DetectorPrototype4
        )
    }
}

impl fmt::Display for HeadVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HeadVariant {
    type Err = HeadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HeadVariant::ALL
            .iter()
            .find(|v| v.name() == s)
            .copied()
            .ok_or_else(|| HeadError::Config(format!("unknown head variant `{s}`")))
    }
}

fn default_kernel() -> usize {
    3
}

/// Construction parameters of a [`crate::DetectionHead`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadConfig {
    /// Branch structure.
    pub variant: HeadVariant,
    /// Number of classes.
    pub nc: usize,
    /// Input channels of each scale, finest scale first.
    pub ch: Vec<usize>,
    /// Kernel size of the [`HeadVariant::DetectorPrototype3`] projection.
    #[serde(default = "default_kernel")]
    pub k: usize,
    /// Recompute the anchors on every forward call.
    #[serde(default)]
    pub dynamic: bool,
}

impl HeadConfig {
    /// Creates a config with `k = 3` and cached anchors.
    pub fn new(variant: HeadVariant, nc: usize, ch: Vec<usize>) -> Self {
        Self {
            variant,
            nc,
            ch,
            k: default_kernel(),
            dynamic: false,
        }
    }

    /// Number of output channels per anchor, `nc + 4 * REG_MAX`.
    pub fn no(&self) -> usize {
        self.nc + BOX_CHANNELS
    }

    /// Number of detection scales.
    pub fn nl(&self) -> usize {
        self.ch.len()
    }

    /// Checks the channel arithmetic of the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`HeadError::Config`] if `nc` is zero, `ch` is empty or holds a zero width,
    /// `k` is not a positive odd number, the scale count is not a multiple of the variant's
    /// demux factor, or a variant reading projected maps gets a width other than `no`.
    pub fn validate(&self) -> Result<(), HeadError> {
        if self.nc == 0 {
            return Err(HeadError::Config("nc must be positive".into()));
        }
        if self.ch.is_empty() {
            return Err(HeadError::Config("at least one scale is required".into()));
        }
        if let Some(i) = self.ch.iter().position(|&c| c == 0) {
            return Err(HeadError::Config(format!("scale {i} has zero channels")));
        }
        if self.k == 0 || self.k % 2 == 0 {
            return Err(HeadError::Config(format!(
                "kernel size must be odd and positive, got {}",
                self.k
            )));
        }
        let demux = self.variant.demux();
        if self.nl() % demux != 0 {
            return Err(HeadError::Config(format!(
                "{} needs a multiple of {demux} scales, got {}",
                self.variant,
                self.nl()
            )));
        }
        if self.variant.requires_projected_input() {
            let no = self.no();
            if let Some((i, &c)) = self.ch.iter().enumerate().find(|(_, c)| **c != no) {
                return Err(HeadError::Config(format!(
                    "{} reads projected maps: scale {i} has {c} channels, expected {no}",
                    self.variant
                )));
            }
        }
        Ok(())
    }

    /// Parses a config from JSON.
    pub fn from_json_str(json: &str) -> Result<Self, HeadError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads a config from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, HeadError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }
}

/// Deployment format tags recognised by the export path.
///
/// Unknown tags are kept verbatim in [`ExportFormat::Other`] and behave like the generic
/// export path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ExportFormat {
    /// `torchscript`
    TorchScript,
    /// `onnx`
    Onnx,
    /// `openvino`
    OpenVino,
    /// `engine`
    Engine,
    /// `coreml`
    CoreMl,
    /// `saved_model`
    SavedModel,
    /// `pb`
    Pb,
    /// `tflite`
    TfLite,
    /// `edgetpu`
    EdgeTpu,
    /// `tfjs`
    TfJs,
    /// `paddle`
    Paddle,
    /// `ncnn`
    Ncnn,
    /// Any other tag.
    Other(String),
}

impl ExportFormat {
    /// The tag of the format.
    pub fn as_str(&self) -> &str {
        match self {
            ExportFormat::TorchScript => "torchscript",
            ExportFormat::Onnx => "onnx",
            ExportFormat::OpenVino => "openvino",
            ExportFormat::Engine => "engine",
            ExportFormat::CoreMl => "coreml",
            ExportFormat::SavedModel => "saved_model",
            ExportFormat::Pb => "pb",
            ExportFormat::TfLite => "tflite",
            ExportFormat::EdgeTpu => "edgetpu",
            ExportFormat::TfJs => "tfjs",
            ExportFormat::Paddle => "paddle",
            ExportFormat::Ncnn => "ncnn",
            ExportFormat::Other(tag) => tag,
        }
    }

    /// Whether the box/class split must be expressed as two slices instead of a split op.
    pub fn uses_slice_split(&self) -> bool {
        matches!(
            self,
            ExportFormat::SavedModel
                | ExportFormat::Pb
                | ExportFormat::TfLite
                | ExportFormat::EdgeTpu
                | ExportFormat::TfJs
        )
    }

    /// Whether decoded boxes are normalized by the image size.
    pub fn normalizes_boxes(&self) -> bool {
        matches!(self, ExportFormat::TfLite | ExportFormat::EdgeTpu)
    }
}

impl From<&str> for ExportFormat {
    fn from(tag: &str) -> Self {
        match tag {
            "torchscript" => ExportFormat::TorchScript,
            "onnx" => ExportFormat::Onnx,
            "openvino" => ExportFormat::OpenVino,
            "engine" => ExportFormat::Engine,
            "coreml" => ExportFormat::CoreMl,
            "saved_model" => ExportFormat::SavedModel,
            "pb" => ExportFormat::Pb,
            "tflite" => ExportFormat::TfLite,
            "edgetpu" => ExportFormat::EdgeTpu,
            "tfjs" => ExportFormat::TfJs,
            "paddle" => ExportFormat::Paddle,
            "ncnn" => ExportFormat::Ncnn,
            other => {
                log::debug!("unrecognised export format `{other}`, using the generic path");
                ExportFormat::Other(other.to_string())
            }
        }
    }
}

impl From<String> for ExportFormat {
    fn from(tag: String) -> Self {
        ExportFormat::from(tag.as_str())
    }
}

impl From<ExportFormat> for String {
    fn from(format: ExportFormat) -> Self {
        format.as_str().to_string()
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_names_round_trip() -> Result<(), Box<dyn std::error::Error>> {
        for variant in HeadVariant::ALL {
            assert_eq!(variant.name().parse::<HeadVariant>()?, variant);
            let json = serde_json::to_string(&variant)?;
            assert_eq!(json, format!("\"{}\"", variant.name()));
        }
        assert!("DetectorTinyv9".parse::<HeadVariant>().is_err());
        Ok(())
    }

    #[test]
    fn config_defaults_from_json() -> Result<(), Box<dyn std::error::Error>> {
        let config =
            HeadConfig::from_json_str(r#"{"variant": "NDetectAux", "nc": 3, "ch": [16, 16, 32, 32]}"#)?;
        assert_eq!(config.variant, HeadVariant::NDetectAux);
        assert_eq!(config.k, 3);
        assert!(!config.dynamic);
        assert_eq!(config.no(), 67);
        config.validate()?;
        Ok(())
    }

    #[test]
    fn config_validation() {
        let bad = [
            HeadConfig::new(HeadVariant::NDetect, 0, vec![16]),
            HeadConfig::new(HeadVariant::NDetect, 2, vec![]),
            HeadConfig::new(HeadVariant::NDetect, 2, vec![16, 0]),
            HeadConfig::new(HeadVariant::NDetectAux, 2, vec![16, 16, 16]),
            HeadConfig::new(HeadVariant::NDetectAuxDual, 2, vec![16, 16]),
            HeadConfig::new(HeadVariant::DetectorPrototype4, 2, vec![66, 65]),
            HeadConfig {
                k: 2,
                ..HeadConfig::new(HeadVariant::DetectorPrototype3, 2, vec![16])
            },
        ];
        for config in bad {
            assert!(
                matches!(config.validate(), Err(HeadError::Config(_))),
                "{config:?} should be rejected"
            );
        }
        assert!(HeadConfig::new(HeadVariant::DetectorPrototype2, 2, vec![66, 66])
            .validate()
            .is_ok());
    }

    #[test]
    fn export_format_tags() -> Result<(), Box<dyn std::error::Error>> {
        let slicing: Vec<_> = ["torchscript", "onnx", "saved_model", "pb", "tflite", "edgetpu", "tfjs"]
            .into_iter()
            .map(ExportFormat::from)
            .filter(ExportFormat::uses_slice_split)
            .map(|f| f.to_string())
            .collect();
        assert_eq!(slicing, ["saved_model", "pb", "tflite", "edgetpu", "tfjs"]);

        assert!(ExportFormat::from("tflite").normalizes_boxes());
        assert!(ExportFormat::from("edgetpu").normalizes_boxes());
        assert!(!ExportFormat::from("tfjs").normalizes_boxes());

        let other = ExportFormat::from("mnn");
        assert_eq!(other, ExportFormat::Other("mnn".into()));
        assert!(!other.uses_slice_split() && !other.normalizes_boxes());

        let parsed: ExportFormat = serde_json::from_str("\"coreml\"")?;
        assert_eq!(parsed, ExportFormat::CoreMl);
        Ok(())
    }
}
