use candle_core::{Device, Module, Tensor};
use candle_nn::VarBuilder;
use kornia_yolo_nn::ops::split_channels;

use crate::anchors::AnchorCache;
use crate::branch::ScaleBranch;
use crate::config::{ExportFormat, HeadConfig, PriorStyle, BOX_CHANNELS, REG_MAX};
use crate::decode::{dist2bbox, Dfl};
use crate::error::HeadError;
use crate::mode::HeadMode;

type HeadResult<T> = std::result::Result<T, HeadError>;

/// Reference image size of the detection prior.
const PRIOR_IMAGE_SIZE: f64 = 640.0;

/// Expected number of objects per reference image of the detection prior.
const PRIOR_OBJECTS: f64 = 5.0;

/// Which branch sets of a head are active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadStreams {
    /// One branch per scale.
    Single,
    /// Scale `i` is routed to branch set `i % demux`.
    Auxiliary {
        /// Number of interleaved branch sets.
        demux: usize,
    },
    /// Auxiliary head reduced to branch set 0; only scales `0, demux, 2 * demux, ...` are
    /// projected and decoded.
    Pruned {
        /// Number of interleaved branch sets of the unpruned head.
        demux: usize,
    },
}

/// Result of a forward call.
#[derive(Debug, Clone)]
pub enum HeadOutput {
    /// Raw per-scale projections, `(b, no, h_i, w_i)` each.
    Training(Vec<Tensor>),
    /// Decoded `(b, 4 + nc, A)` predictions and the raw per-scale projections.
    Inference {
        /// Boxes in pixels, center form, followed by class scores in `[0, 1]`.
        prediction: Tensor,
        /// Raw per-scale projections.
        raw: Vec<Tensor>,
    },
    /// Decoded predictions only.
    Export(Tensor),
}

impl HeadOutput {
    /// The decoded predictions, if any.
    pub fn prediction(&self) -> Option<&Tensor> {
        match self {
            HeadOutput::Training(_) => None,
            HeadOutput::Inference { prediction, .. } | HeadOutput::Export(prediction) => {
                Some(prediction)
            }
        }
    }

    /// The raw per-scale projections, if returned.
    pub fn raw(&self) -> Option<&[Tensor]> {
        match self {
            HeadOutput::Training(raw) | HeadOutput::Inference { raw, .. } => Some(raw),
            HeadOutput::Export(_) => None,
        }
    }

    /// Consumes the output and returns the decoded predictions, if any.
    pub fn into_prediction(self) -> Option<Tensor> {
        match self {
            HeadOutput::Training(_) => None,
            HeadOutput::Inference { prediction, .. } | HeadOutput::Export(prediction) => {
                Some(prediction)
            }
        }
    }
}

/// An anchor-free multi-scale detection head.
///
/// The head projects each feature map of a pyramid to `no = 4 * REG_MAX + nc` channels and,
/// outside of training, decodes the projections into boxes in pixels and class scores.
///
/// # Example
///
/// ```no_run
/// use candle_core::{DType, Device, Tensor};
/// use candle_nn::{VarBuilder, VarMap};
/// use kornia_yolo_head::{DetectionHead, HeadConfig, HeadMode, HeadVariant};
///
/// let varmap = VarMap::new();
/// let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
/// let config = HeadConfig::new(HeadVariant::NDetect, 80, vec![64, 128]);
/// let mut head = DetectionHead::new(config, vb).unwrap();
///
/// let features = vec![
///     Tensor::zeros((1, 64, 80, 80), DType::F32, &Device::Cpu).unwrap(),
///     Tensor::zeros((1, 128, 40, 40), DType::F32, &Device::Cpu).unwrap(),
/// ];
/// head.infer_strides((640, 640), &features).unwrap();
/// head.bias_init().unwrap();
/// head.set_mode(HeadMode::Inference);
/// let output = head.forward(&features).unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct DetectionHead {
    config: HeadConfig,
    branches: Vec<ScaleBranch>,
    streams: HeadStreams,
    stride: Vec<f64>,
    prior: Vec<f64>,
    mode: HeadMode,
    anchors: AnchorCache,
    dfl: Dfl,
    device: Device,
}

impl DetectionHead {
    /// Builds a head with all-zero strides in training mode.
    ///
    /// # Arguments
    ///
    /// * `config` - The head configuration.
    /// * `vb` - The variable builder holding the branch weights.
    ///
    /// # Errors
    ///
    /// Returns [`HeadError::Config`] if the configuration fails [`HeadConfig::validate`],
    /// [`HeadError::ChannelMismatch`] if a branch does not project to `no` channels, or the
    /// error raised while loading a branch.
    pub fn new(config: HeadConfig, vb: VarBuilder) -> HeadResult<Self> {
        config.validate()?;
        let branches = (0..config.nl())
            .map(|i| ScaleBranch::load(&vb, &config, i))
            .collect::<HeadResult<Vec<_>>>()?;
        let no = config.no();
        for (scale, (branch, &c)) in branches.iter().zip(&config.ch).enumerate() {
            let got = branch.out_channels(c);
            if got != no {
                return Err(HeadError::ChannelMismatch {
                    scale,
                    expected: no,
                    got,
                });
            }
        }
        let streams = if config.variant.is_auxiliary() {
            HeadStreams::Auxiliary {
                demux: config.variant.demux(),
            }
        } else {
            HeadStreams::Single
        };
        log::debug!(
            "built {} head: nc={} ch={:?} streams={streams:?}",
            config.variant,
            config.nc,
            config.ch
        );
        Ok(Self {
            stride: vec![0.0; config.nl()],
            prior: Vec::new(),
            mode: HeadMode::default(),
            anchors: AnchorCache::new(),
            dfl: Dfl::new(REG_MAX, vb.device())?,
            device: vb.device().clone(),
            branches,
            streams,
            config,
        })
    }

    /// The head configuration.
    pub fn config(&self) -> &HeadConfig {
        &self.config
    }

    /// The active branch sets.
    pub fn streams(&self) -> HeadStreams {
        self.streams
    }

    /// The current output mode.
    pub fn mode(&self) -> &HeadMode {
        &self.mode
    }

    /// Sets the output mode used by subsequent forward calls.
    pub fn set_mode(&mut self, mode: HeadMode) {
        self.mode = mode;
    }

    /// The stride of each scale; all zero until set.
    pub fn strides(&self) -> &[f64] {
        &self.stride
    }

    /// The per-scale class prior added by additive-prior variants; empty until
    /// [`Self::bias_init`].
    pub fn prior(&self) -> &[f64] {
        &self.prior
    }

    /// The anchor cache.
    pub fn anchor_cache(&self) -> &AnchorCache {
        &self.anchors
    }

    /// The DFL integral used to decode the box channels.
    pub fn dfl(&self) -> &Dfl {
        &self.dfl
    }

    /// Sets the stride of each scale and drops the cached anchors.
    ///
    /// # Errors
    ///
    /// Returns [`HeadError::ScaleCountMismatch`] if `strides` does not have one entry per scale.
    pub fn set_strides(&mut self, strides: &[f64]) -> HeadResult<()> {
        if strides.len() != self.config.nl() {
            return Err(HeadError::ScaleCountMismatch {
                expected: self.config.nl(),
                got: strides.len(),
            });
        }
        self.stride = strides.to_vec();
        self.anchors.invalidate();
        Ok(())
    }

    /// Derives the strides from a dry run: `stride_i = input_height / height_i`.
    ///
    /// # Arguments
    ///
    /// * `input_hw` - `(height, width)` of the image the features were computed from.
    /// * `features` - One feature map per scale.
    ///
    /// # Returns
    ///
    /// The strides that were set.
    pub fn infer_strides(
        &mut self,
        input_hw: (usize, usize),
        features: &[Tensor],
    ) -> HeadResult<&[f64]> {
        let strides = features
            .iter()
            .map(|xs| {
                let (_, _, h, _) = xs.dims4()?;
                Ok(input_hw.0 as f64 / h as f64)
            })
            .collect::<HeadResult<Vec<_>>>()?;
        self.set_strides(&strides)?;
        log::debug!("inferred strides {strides:?} for input {input_hw:?}");
        Ok(&self.stride)
    }

    /// Initializes the detection prior from the strides.
    ///
    /// The class prior of scale `i` is `ln(5 / nc / (640 / stride_i)^2)`. Bias-style variants
    /// write it into their final class biases and `1.0` into their box biases; additive
    /// variants replace the per-scale prior added on every forward call.
    ///
    /// # Errors
    ///
    /// Returns [`HeadError::StridesNotInitialized`] if a stride is not positive.
    pub fn bias_init(&mut self) -> HeadResult<()> {
        if self.stride.iter().any(|&s| s <= 0.0) {
            return Err(HeadError::StridesNotInitialized);
        }
        let nc = self.config.nc as f64;
        let prior = self
            .stride
            .iter()
            .map(|&s| (PRIOR_OBJECTS / nc / (PRIOR_IMAGE_SIZE / s).powi(2)).ln())
            .collect::<Vec<_>>();

        match self.config.variant.prior_style() {
            PriorStyle::Bias => {
                for i in self.active_scales() {
                    let b = self.branch_index(i);
                    self.branches[b].set_prior_bias(prior[i])?;
                }
            }
            PriorStyle::Additive => self.prior = prior.clone(),
        }
        log::info!(
            "initialized {} prior from strides {:?}: {prior:?}",
            self.config.variant,
            self.stride
        );
        Ok(())
    }

    /// Keeps only branch set 0 of an auxiliary head.
    ///
    /// The returned head still takes the full list of `nl` feature maps but projects and
    /// decodes only scales `0, demux, 2 * demux, ...`. Other heads are returned unchanged.
    pub fn prune_auxiliary(self) -> Self {
        let HeadStreams::Auxiliary { demux } = self.streams else {
            return self;
        };
        let branches = self
            .branches
            .into_iter()
            .enumerate()
            .filter(|(i, _)| i % demux == 0)
            .map(|(_, branch)| branch)
            .collect::<Vec<_>>();
        log::debug!(
            "pruned {} to {} of {} branches",
            self.config.variant,
            branches.len(),
            self.config.nl()
        );
        let mut anchors = self.anchors;
        anchors.invalidate();
        Self {
            branches,
            streams: HeadStreams::Pruned { demux },
            anchors,
            ..self
        }
    }

    /// Runs the head over one feature map per scale.
    ///
    /// # Errors
    ///
    /// Returns [`HeadError::ScaleCountMismatch`] or [`HeadError::ChannelMismatch`] if the
    /// features do not match the configuration, and [`HeadError::StridesNotInitialized`] if a
    /// decoding mode is requested while all strides are zero.
    pub fn forward(&mut self, xs: &[Tensor]) -> HeadResult<HeadOutput> {
        let nl = self.config.nl();
        if xs.len() != nl {
            return Err(HeadError::ScaleCountMismatch {
                expected: nl,
                got: xs.len(),
            });
        }
        for (scale, (x, &expected)) in xs.iter().zip(&self.config.ch).enumerate() {
            let (_, got, _, _) = x.dims4()?;
            if got != expected {
                return Err(HeadError::ChannelMismatch {
                    scale,
                    expected,
                    got,
                });
            }
        }
        let shape = xs[0].dims().to_vec();

        let scales = self.active_scales();
        let projected = scales
            .iter()
            .map(|&i| self.project(i, &xs[i]))
            .collect::<HeadResult<Vec<_>>>()?;

        let format = match &self.mode {
            HeadMode::Training => return Ok(HeadOutput::Training(projected)),
            HeadMode::Inference => None,
            HeadMode::Export(format) => Some(format.clone()),
        };

        let strides = scales.iter().map(|&i| self.stride[i]).collect::<Vec<_>>();
        if strides.iter().all(|&s| s == 0.0) {
            return Err(HeadError::StridesNotInitialized);
        }
        let (centers, per_anchor) =
            self.anchors
                .get_or_refresh(&shape, &projected, &strides, self.config.dynamic)?;

        let prediction = self.decode(
            &projected,
            &centers,
            &per_anchor,
            format.as_ref(),
            (shape[2], shape[3]),
        )?;
        Ok(match format {
            Some(_) => HeadOutput::Export(prediction),
            None => HeadOutput::Inference {
                prediction,
                raw: projected,
            },
        })
    }

    /// Converts DFL distances into center-form boxes around `anchors`.
    pub fn decode_bboxes(&self, bboxes: &Tensor, anchors: &Tensor) -> HeadResult<Tensor> {
        Ok(dist2bbox(bboxes, anchors, true)?)
    }

    fn active_scales(&self) -> Vec<usize> {
        let step = match self.streams {
            HeadStreams::Pruned { demux } => demux,
            _ => 1,
        };
        (0..self.config.nl()).step_by(step).collect()
    }

    fn branch_index(&self, scale: usize) -> usize {
        match self.streams {
            HeadStreams::Pruned { demux } => scale / demux,
            _ => scale,
        }
    }

    /// Projects scale `i` to `no` channels and adds the additive prior.
    fn project(&self, i: usize, xs: &Tensor) -> HeadResult<Tensor> {
        let ys = self.branches[self.branch_index(i)].forward(xs)?;
        if self.config.variant.prior_style() != PriorStyle::Additive {
            return Ok(ys);
        }
        let no = self.config.no();
        let cls = self.prior.get(i).copied().unwrap_or(0.0) as f32;
        let offset = (0..no)
            .map(|j| if j < BOX_CHANNELS { 1.0 } else { cls })
            .collect::<Vec<f32>>();
        let offset = Tensor::from_vec(offset, (1, no, 1, 1), &self.device)?
            .to_device(ys.device())?
            .to_dtype(ys.dtype())?;
        Ok(ys.broadcast_add(&offset)?)
    }

    fn decode(
        &self,
        projected: &[Tensor],
        centers: &Tensor,
        per_anchor: &Tensor,
        format: Option<&ExportFormat>,
        (h, w): (usize, usize),
    ) -> HeadResult<Tensor> {
        let no = self.config.no();
        let flat = projected
            .iter()
            .map(|xs| {
                let (b, _, ph, pw) = xs.dims4()?;
                xs.reshape((b, no, ph * pw))
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        let x_cat = Tensor::cat(&flat, 2)?;

        let (bbox, cls) = if format.is_some_and(ExportFormat::uses_slice_split) {
            (
                x_cat.narrow(1, 0, BOX_CHANNELS)?,
                x_cat.narrow(1, BOX_CHANNELS, self.config.nc)?,
            )
        } else {
            let mut parts = split_channels(&x_cat, &[BOX_CHANNELS, self.config.nc])?.into_iter();
            match (parts.next(), parts.next()) {
                (Some(bbox), Some(cls)) => (bbox, cls),
                _ => return Err(HeadError::Config("box/class split failed".into())),
            }
        };

        let distances = self.dfl.forward(&bbox)?;
        let mut dbox = self
            .decode_bboxes(&distances, &centers.unsqueeze(0)?)?
            .broadcast_mul(&per_anchor.unsqueeze(0)?)?;

        if format.is_some_and(ExportFormat::normalizes_boxes) {
            let stride = self.stride[0];
            let img_h = (h as f64 * stride) as f32;
            let img_w = (w as f64 * stride) as f32;
            let img_size = Tensor::from_vec(vec![img_w, img_h, img_w, img_h], (1, 4, 1), dbox.device())?
                .to_dtype(dbox.dtype())?;
            dbox = dbox.broadcast_div(&img_size)?;
        }

        let scores = candle_nn::ops::sigmoid(&cls)?;
        Ok(Tensor::cat(&[dbox, scores], 1)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeadVariant;
    use approx::assert_relative_eq;
    use candle_core::{DType, Var};
    use candle_nn::VarMap;

    fn head(config: HeadConfig) -> HeadResult<DetectionHead> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        DetectionHead::new(config, vb)
    }

    fn features(ch: &[usize], sizes: &[usize]) -> candle_core::Result<Vec<Tensor>> {
        ch.iter()
            .zip(sizes)
            .map(|(&c, &s)| Tensor::randn(0f32, 1f32, (1, c, s, s), &Device::Cpu))
            .collect()
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let bad = [
            HeadConfig::new(HeadVariant::NDetect, 0, vec![16]),
            HeadConfig::new(HeadVariant::NDetect, 2, vec![]),
            HeadConfig::new(HeadVariant::NDetectAux, 2, vec![16, 16, 16]),
            HeadConfig::new(HeadVariant::DetectorPrototype4, 2, vec![16]),
            HeadConfig {
                k: 2,
                ..HeadConfig::new(HeadVariant::DetectorPrototype3, 2, vec![16])
            },
        ];
        for config in bad {
            assert!(matches!(head(config), Err(HeadError::Config(_))));
        }
    }

    #[test]
    fn forward_checks_the_feature_list() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut head = head(HeadConfig::new(HeadVariant::DetectorTinyV3, 2, vec![8, 16]))?;
        let xs = features(&[8], &[4])?;
        assert!(matches!(
            head.forward(&xs),
            Err(HeadError::ScaleCountMismatch { expected: 2, got: 1 })
        ));
        let xs = features(&[8, 8], &[4, 2])?;
        assert!(matches!(
            head.forward(&xs),
            Err(HeadError::ChannelMismatch { scale: 1, expected: 16, got: 8 })
        ));
        assert!(matches!(
            head.set_strides(&[8.0]),
            Err(HeadError::ScaleCountMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn decoding_needs_strides() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let mut head = head(HeadConfig::new(HeadVariant::NDetect, 2, vec![8, 8]))?;
        assert!(matches!(head.bias_init(), Err(HeadError::StridesNotInitialized)));

        let xs = features(&[8, 8], &[4, 2])?;
        assert!(head.forward(&xs)?.raw().is_some());
        head.set_mode(HeadMode::Inference);
        assert!(matches!(head.forward(&xs), Err(HeadError::StridesNotInitialized)));

        head.infer_strides((32, 32), &xs)?;
        assert_eq!(head.strides(), &[8.0, 16.0]);
        assert!(head.forward(&xs)?.prediction().is_some());
        Ok(())
    }

    #[test]
    fn additive_prior_is_added_every_call() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let nc = 2;
        let no = BOX_CHANNELS + nc;
        let mut head = head(HeadConfig::new(HeadVariant::DetectorPrototype4, nc, vec![no]))?;
        let xs = vec![Tensor::zeros((1, no, 2, 2), DType::F32, &Device::Cpu)?];

        // before bias_init the class channels get no offset
        let raw = head.forward(&xs)?;
        let raw = raw.raw().ok_or("missing raw output")?[0].mean((2, 3))?;
        let raw = raw.flatten_all()?.to_vec1::<f32>()?;
        assert!(raw[..BOX_CHANNELS].iter().all(|&v| v == 1.0));
        assert!(raw[BOX_CHANNELS..].iter().all(|&v| v == 0.0));

        head.set_strides(&[32.0])?;
        head.bias_init()?;
        head.bias_init()?;
        assert_eq!(head.prior().len(), 1);
        let expected = (5.0f64 / 2.0 / 400.0).ln() as f32;

        for _ in 0..2 {
            let out = head.forward(&xs)?;
            let raw = out.raw().ok_or("missing raw output")?[0].flatten_all()?;
            let raw = raw.to_vec1::<f32>()?;
            assert_relative_eq!(raw[0], 1.0);
            assert_relative_eq!(raw[no * 4 - 1], expected, epsilon = 1e-6);
        }
        Ok(())
    }

    fn head_with_vars(config: HeadConfig) -> HeadResult<(DetectionHead, VarMap)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let head = DetectionHead::new(config, vb)?;
        Ok((head, varmap))
    }

    fn stored(varmap: &VarMap, name: &str) -> std::result::Result<Var, Box<dyn std::error::Error>> {
        let data = varmap.data().lock().map_err(|e| e.to_string())?;
        let var = data.get(name).cloned();
        Ok(var.ok_or(format!("{name} not in the varmap"))?)
    }

    #[test]
    fn bias_init_writes_the_trainable_biases() -> std::result::Result<(), Box<dyn std::error::Error>>
    {
        let nc = 2;
        let stride = 8.0;
        let expected = (5.0f64 / 2.0 / (640.0f64 / stride).powi(2)).ln() as f32;
        // independent stems keep their final convs under `.1`, shared stems directly
        let cases = [
            (HeadVariant::DetectorTiny, "cv2.0.1.bias", "cv3.0.1.bias"),
            (HeadVariant::DetectorTinyV3, "cv2.0.bias", "cv3.0.bias"),
        ];
        for (variant, box_name, cls_name) in cases {
            let (mut head, varmap) = head_with_vars(HeadConfig::new(variant, nc, vec![8]))?;
            head.set_strides(&[stride])?;
            head.bias_init()?;
            assert!(head.prior().is_empty());

            let box_bias = stored(&varmap, box_name)?.as_tensor().to_vec1::<f32>()?;
            assert_eq!(box_bias.len(), BOX_CHANNELS);
            assert!(box_bias.iter().all(|&b| b == 1.0), "{variant}");
            let cls_bias = stored(&varmap, cls_name)?.as_tensor().to_vec1::<f32>()?;
            assert_eq!(cls_bias.len(), nc);
            for b in cls_bias {
                assert_relative_eq!(b, expected, epsilon = 1e-6);
            }
        }
        Ok(())
    }

    #[test]
    fn forward_reads_the_stored_bias() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let nc = 2;
        let (mut head, varmap) =
            head_with_vars(HeadConfig::new(HeadVariant::DetectorTinyV3, nc, vec![8]))?;
        head.set_strides(&[8.0])?;
        head.bias_init()?;

        let xs = vec![Tensor::zeros((1, 8, 2, 2), DType::F32, &Device::Cpu)?];
        let raw = head.forward(&xs)?;
        let raw = raw.raw().ok_or("missing raw output")?[0].flatten_all()?;
        assert_relative_eq!(raw.to_vec1::<f32>()?[0], 1.0, epsilon = 1e-5);

        // an optimizer step on the stored parameter must reach the output
        let bias = stored(&varmap, "cv2.0.bias")?;
        bias.set(&Tensor::full(100f32, BOX_CHANNELS, &Device::Cpu)?)?;
        let raw = head.forward(&xs)?;
        let raw = raw.raw().ok_or("missing raw output")?[0].flatten_all()?;
        assert_relative_eq!(raw.to_vec1::<f32>()?[0], 100.0, epsilon = 1e-4);
        Ok(())
    }

    #[test]
    fn pruning_keeps_the_first_branch_set() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let ch = [8, 8, 8, 8];
        let mut head = head(HeadConfig::new(HeadVariant::NDetectAux, 2, ch.to_vec()))?;
        assert_eq!(head.streams(), HeadStreams::Auxiliary { demux: 2 });
        let xs = features(&ch, &[8, 8, 4, 4])?;
        head.set_strides(&[4.0, 4.0, 8.0, 8.0])?;

        let full = head.forward(&xs)?;
        assert_eq!(full.raw().map(<[Tensor]>::len), Some(4));

        let mut pruned = head.prune_auxiliary();
        assert_eq!(pruned.streams(), HeadStreams::Pruned { demux: 2 });
        let raw = pruned.forward(&xs)?;
        assert_eq!(raw.raw().map(<[Tensor]>::len), Some(2));

        pruned.set_mode(HeadMode::Inference);
        let out = pruned.forward(&xs)?;
        let prediction = out.prediction().ok_or("missing prediction")?;
        assert_eq!(prediction.dims3()?, (1, 4 + 2, 8 * 8 + 4 * 4));

        let single = self::head(HeadConfig::new(HeadVariant::NDetect, 2, vec![8]))?;
        assert_eq!(single.prune_auxiliary().streams(), HeadStreams::Single);
        Ok(())
    }
}
