//! Per-scale projections of the detection head.
//!
//! Each branch maps one input feature map to `no = 4 * REG_MAX + nc` channels, box channels
//! first.

use candle_core::{Module, Result, Tensor, Var};
use candle_nn::{conv2d, conv2d_no_bias, Conv2d, Conv2dConfig, VarBuilder};
use kornia_yolo_nn::{Block, Conv, LightConv};

use crate::config::{HeadConfig, HeadVariant, BOX_CHANNELS};
use crate::error::HeadError;

type HeadResult<T> = std::result::Result<T, HeadError>;

/// Width of the fused stack bottleneck.
const FUSED_BOTTLENECK: usize = 32;

/// A conv followed by a 3x3 light conv.
#[derive(Debug, Clone)]
pub(crate) struct Stem {
    conv: Conv,
    light: LightConv,
}

impl Stem {
    fn load(vb: VarBuilder, c1: usize, c2: usize, kernel: usize) -> HeadResult<Self> {
        Ok(Self {
            conv: Conv::load(vb.pp("0"), c1, c2, kernel, 1)?,
            light: LightConv::load(vb.pp("1"), c2, c2, 3)?,
        })
    }

    /// The `Conv 1x1 + LightConv` header of the tiny detectors, weights under `m`.
    fn header(vb: VarBuilder, c1: usize, c2: usize) -> HeadResult<Self> {
        Self::load(vb.pp("m"), c1, c2, 1)
    }
}

impl Module for Stem {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.light.forward(&self.conv.forward(xs)?)
    }
}

/// Writes a constant bias per channel range into `conv`.
///
/// `ranges` holds `(end, value)` pairs in increasing `end` order; channel `j` takes the value
/// of the first range with `j < end`. A trainable bias is overwritten in place so that its
/// `Var` keeps backing the layer; a missing or frozen bias is replaced.
fn write_bias(conv: &mut Conv2d, ranges: &[(usize, f64)]) -> Result<()> {
    let weight = conv.weight().clone();
    let out = weight.dim(0)?;
    let values = (0..out)
        .map(|j| {
            ranges
                .iter()
                .find(|(end, _)| j < *end)
                .map_or(0.0, |(_, value)| *value as f32)
        })
        .collect::<Vec<_>>();
    let values = Tensor::from_vec(values, out, weight.device())?.to_dtype(weight.dtype())?;
    match conv.bias().filter(|bias| bias.is_variable()).cloned() {
        Some(bias) => Var::from_tensor(&bias)?.set(&values)?,
        None => {
            let config = *conv.config();
            *conv = Conv2d::new(weight, Some(values), config);
        }
    }
    Ok(())
}

/// Projection of one scale.
#[derive(Debug, Clone)]
pub(crate) enum ScaleBranch {
    /// Separate box and class stacks over the raw feature map.
    Independent {
        box_stem: Stem,
        box_out: Conv2d,
        cls_stem: Stem,
        cls_out: Conv2d,
    },
    /// One optional stem feeding two 1x1 projections.
    Shared {
        stem: Option<Stem>,
        box_out: Conv2d,
        cls_out: Conv2d,
        /// The projections read the box/class channel slices instead of the whole stem output.
        sliced: bool,
    },
    /// One stack producing all `no` channels at once.
    Fused { stack: Vec<Conv>, out: Option<Conv2d> },
}

impl ScaleBranch {
    /// Builds the branch of scale `i` of a single-stream head.
    pub(crate) fn load(vb: &VarBuilder, config: &HeadConfig, i: usize) -> HeadResult<Self> {
        let x = config.ch[i];
        let no = config.no();
        let nc = config.nc;
        let cfg = Conv2dConfig::default();
        let branch = match config.variant {
            HeadVariant::DetectorTiny => {
                let (vb2, vb3) = (vb.pp("cv2").pp(i), vb.pp("cv3").pp(i));
                ScaleBranch::Independent {
                    box_stem: Stem::header(vb2.pp("0"), x, BOX_CHANNELS)?,
                    box_out: conv2d(BOX_CHANNELS, BOX_CHANNELS, 1, cfg, vb2.pp("1"))?,
                    cls_stem: Stem::header(vb3.pp("0"), x, nc)?,
                    cls_out: conv2d(nc, nc, 1, cfg, vb3.pp("1"))?,
                }
            }
            HeadVariant::DetectorTinyV2 => ScaleBranch::Shared {
                stem: Some(Stem::header(vb.pp("cv1").pp(i), x, no)?),
                box_out: conv2d(BOX_CHANNELS, BOX_CHANNELS, 1, cfg, vb.pp("cv2").pp(i))?,
                cls_out: conv2d(nc, nc, 1, cfg, vb.pp("cv3").pp(i))?,
                sliced: true,
            },
            HeadVariant::DetectorTinyV3 | HeadVariant::DetectorTinyV4 => {
                let c1 = match config.variant {
                    HeadVariant::DetectorTinyV3 => no,
                    _ => BOX_CHANNELS + 32,
                };
                ScaleBranch::Shared {
                    stem: Some(Stem::header(vb.pp("cv1").pp(i), x, c1)?),
                    box_out: conv2d(c1, BOX_CHANNELS, 1, cfg, vb.pp("cv2").pp(i))?,
                    cls_out: conv2d(c1, nc, 1, cfg, vb.pp("cv3").pp(i))?,
                    sliced: false,
                }
            }
            HeadVariant::DetectorTinyV5 | HeadVariant::DetectorTinyV6 => {
                let c1 = match config.variant {
                    HeadVariant::DetectorTinyV5 => BOX_CHANNELS + 32,
                    _ => BOX_CHANNELS * 2,
                };
                let kernel = if x > c1 { 1 } else { 3 };
                ScaleBranch::Shared {
                    stem: Some(Stem::load(vb.pp("cv1").pp(i), x, c1, kernel)?),
                    box_out: conv2d(c1, BOX_CHANNELS, 1, cfg, vb.pp("cv2").pp(i))?,
                    cls_out: conv2d(c1, nc, 1, cfg, vb.pp("cv3").pp(i))?,
                    sliced: false,
                }
            }
            HeadVariant::DetectorPrototype => {
                let vb = vb.pp("cv2").pp(i);
                let (stack, out_vb) = if x != no {
                    (vec![Conv::load(vb.pp("0"), x, no, 1, 1)?], vb.pp("1"))
                } else {
                    (Vec::new(), vb.pp("0"))
                };
                let depthwise = Conv2dConfig {
                    groups: no,
                    ..Default::default()
                };
                ScaleBranch::Fused {
                    stack,
                    out: Some(conv2d(no, no, 1, depthwise, out_vb)?),
                }
            }
            HeadVariant::DetectorPrototype2 => ScaleBranch::Shared {
                stem: None,
                box_out: conv2d(BOX_CHANNELS, BOX_CHANNELS, 1, cfg, vb.pp("cv2").pp(i))?,
                cls_out: conv2d(nc, nc, 1, cfg, vb.pp("cv3").pp(i))?,
                sliced: true,
            },
            HeadVariant::DetectorPrototype3 => {
                let padded = Conv2dConfig {
                    padding: config.k / 2,
                    ..Default::default()
                };
                ScaleBranch::Fused {
                    stack: Vec::new(),
                    out: Some(conv2d(x, no, config.k, padded, vb.pp("cv1").pp(i))?),
                }
            }
            HeadVariant::DetectorPrototype4 => ScaleBranch::Fused {
                stack: Vec::new(),
                out: None,
            },
            HeadVariant::NDetect => Self::fused_stack(vb.pp("cv1").pp(i), x, no, true)?,
            HeadVariant::NDetectAux | HeadVariant::NDetectAuxDual => {
                let demux = config.variant.demux();
                let set = i % demux;
                let bias = config.variant == HeadVariant::NDetectAuxDual;
                Self::fused_stack(vb.pp(format!("cv{}", set + 1)).pp(i / demux), x, no, bias)?
            }
        };
        Ok(branch)
    }

    /// `Conv(x, x, 3) -> Conv(x, 32, 1) -> Conv(32, no, 3) -> conv1x1(no, no)`.
    fn fused_stack(vb: VarBuilder, x: usize, no: usize, bias: bool) -> HeadResult<Self> {
        let stack = vec![
            Conv::load(vb.pp("0"), x, x, 3, 1)?,
            Conv::load(vb.pp("1"), x, FUSED_BOTTLENECK, 1, 1)?,
            Conv::load(vb.pp("2"), FUSED_BOTTLENECK, no, 3, 1)?,
        ];
        let cfg = Conv2dConfig::default();
        let out = if bias {
            conv2d(no, no, 1, cfg, vb.pp("3"))?
        } else {
            conv2d_no_bias(no, no, 1, cfg, vb.pp("3"))?
        };
        Ok(ScaleBranch::Fused {
            stack,
            out: Some(out),
        })
    }

    /// Writes the detection prior into the final biases: `1.0` on the box channels and
    /// `cls_bias` on the class channels.
    ///
    /// Branches without a final projection are left untouched.
    pub(crate) fn set_prior_bias(&mut self, cls_bias: f64) -> Result<()> {
        match self {
            ScaleBranch::Independent {
                box_out, cls_out, ..
            }
            | ScaleBranch::Shared {
                box_out, cls_out, ..
            } => {
                write_bias(box_out, &[(usize::MAX, 1.0)])?;
                write_bias(cls_out, &[(usize::MAX, cls_bias)])?;
            }
            ScaleBranch::Fused { out: Some(out), .. } => {
                write_bias(out, &[(BOX_CHANNELS, 1.0), (usize::MAX, cls_bias)])?;
            }
            ScaleBranch::Fused { out: None, .. } => {}
        }
        Ok(())
    }

    /// Output width of the branch for an input of `c` channels.
    pub(crate) fn out_channels(&self, c: usize) -> usize {
        match self {
            ScaleBranch::Independent {
                box_out, cls_out, ..
            }
            | ScaleBranch::Shared {
                box_out, cls_out, ..
            } => box_out.weight().dims()[0] + cls_out.weight().dims()[0],
            ScaleBranch::Fused { out: Some(out), .. } => out.weight().dims()[0],
            ScaleBranch::Fused { out: None, stack } => {
                stack.last().map_or(c, |conv| conv.out_channels())
            }
        }
    }
}

impl Module for ScaleBranch {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            ScaleBranch::Independent {
                box_stem,
                box_out,
                cls_stem,
                cls_out,
            } => {
                let b = box_out.forward(&box_stem.forward(xs)?)?;
                let c = cls_out.forward(&cls_stem.forward(xs)?)?;
                Tensor::cat(&[b, c], 1)
            }
            ScaleBranch::Shared {
                stem,
                box_out,
                cls_out,
                sliced,
            } => {
                let t = match stem {
                    Some(stem) => stem.forward(xs)?,
                    None => xs.clone(),
                };
                let (b, c) = if *sliced {
                    let rest = t.dim(1)? - BOX_CHANNELS;
                    (
                        box_out.forward(&t.narrow(1, 0, BOX_CHANNELS)?)?,
                        cls_out.forward(&t.narrow(1, BOX_CHANNELS, rest)?)?,
                    )
                } else {
                    (box_out.forward(&t)?, cls_out.forward(&t)?)
                };
                Tensor::cat(&[b, c], 1)
            }
            ScaleBranch::Fused { stack, out } => {
                let mut ys = stack
                    .iter()
                    .try_fold(xs.clone(), |acc, conv| conv.forward(&acc))?;
                if let Some(out) = out {
                    ys = out.forward(&ys)?;
                }
                Ok(ys)
            }
        }
    }
}
