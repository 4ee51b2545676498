use candle_core::{bail, DType, Device, Module, Result, Tensor};

/// Distribution focal loss integral.
///
/// Turns `reg_max` logits per box side into the expected distance
/// `sum_i softmax(logits)_i * i`.
#[derive(Debug, Clone)]
pub struct Dfl {
    bins: Tensor,
    reg_max: usize,
}

impl Dfl {
    /// Creates the integral over `reg_max` bins.
    pub fn new(reg_max: usize, device: &Device) -> Result<Self> {
        if reg_max == 0 {
            bail!("DFL needs at least one bin");
        }
        let bins = Tensor::arange(0u32, reg_max as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((1, 1, reg_max, 1))?;
        Ok(Self { bins, reg_max })
    }

    /// Number of bins per side.
    pub fn reg_max(&self) -> usize {
        self.reg_max
    }
}

impl Module for Dfl {
    /// Maps `(b, 4 * reg_max, a)` logits to `(b, 4, a)` distances.
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, c, a) = xs.dims3()?;
        if c != 4 * self.reg_max {
            bail!("DFL expects {} channels, got {c}", 4 * self.reg_max);
        }
        let xs = xs.reshape((b, 4, self.reg_max, a))?;
        let probs = candle_nn::ops::softmax(&xs, 2)?;
        let bins = self.bins.to_device(xs.device())?.to_dtype(xs.dtype())?;
        probs.broadcast_mul(&bins)?.sum(2)
    }
}

/// Converts `(left, top, right, bottom)` distances around anchor points into boxes.
///
/// # Arguments
///
/// * `distance` - Distances with shape `(b, 4, a)`.
/// * `anchors` - Anchor points with shape `(2, a)` or `(1, 2, a)`.
/// * `xywh` - Return `(cx, cy, w, h)` if true, `(x1, y1, x2, y2)` otherwise.
///
/// # Returns
///
/// Boxes with shape `(b, 4, a)`, in the units of the inputs.
pub fn dist2bbox(distance: &Tensor, anchors: &Tensor, xywh: bool) -> Result<Tensor> {
    let anchors = match anchors.rank() {
        2 => anchors.unsqueeze(0)?,
        3 => anchors.clone(),
        r => bail!("anchors must have rank 2 or 3, got {r}"),
    };
    let lt = distance.narrow(1, 0, 2)?;
    let rb = distance.narrow(1, 2, 2)?;
    let x1y1 = anchors.broadcast_sub(&lt)?;
    let x2y2 = anchors.broadcast_add(&rb)?;
    if xywh {
        let c_xy = ((&x1y1 + &x2y2)? * 0.5)?;
        let wh = (&x2y2 - &x1y1)?;
        Tensor::cat(&[c_xy, wh], 1)
    } else {
        Tensor::cat(&[x1y1, x2y2], 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn dfl_recovers_one_hot_bin() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dev = Device::Cpu;
        let reg_max = 16;
        let dfl = Dfl::new(reg_max, &dev)?;

        // side s peaks at bin 2 * s + 1
        let mut logits = vec![0f32; 4 * reg_max];
        for side in 0..4 {
            logits[side * reg_max + 2 * side + 1] = 100.0;
        }
        let xs = Tensor::from_vec(logits, (1, 4 * reg_max, 1), &dev)?;
        let d = dfl.forward(&xs)?.flatten_all()?.to_vec1::<f32>()?;
        for (side, v) in d.iter().enumerate() {
            assert_relative_eq!(*v, (2 * side + 1) as f32, epsilon = 1e-4);
        }

        let uniform = Tensor::zeros((2, 4 * reg_max, 3), DType::F32, &dev)?;
        let d = dfl.forward(&uniform)?;
        assert_eq!(d.dims3()?, (2, 4, 3));
        assert_relative_eq!(d.mean_all()?.to_scalar::<f32>()?, 7.5, epsilon = 1e-5);

        let bad = Tensor::zeros((1, 10, 3), DType::F32, &dev)?;
        assert!(dfl.forward(&bad).is_err());
        Ok(())
    }

    #[test]
    fn dist2bbox_center_and_corner_forms() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dev = Device::Cpu;
        let anchors = Tensor::from_vec(vec![4.5f32, 2.5], (2, 1), &dev)?;
        let dist = Tensor::from_vec(vec![1f32, 2.0, 3.0, 4.0], (1, 4, 1), &dev)?;

        let xywh = dist2bbox(&dist, &anchors, true)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(xywh, vec![5.5, 3.5, 4.0, 6.0]);

        let xyxy = dist2bbox(&dist, &anchors.unsqueeze(0)?, false)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        assert_eq!(xyxy, vec![3.5, 0.5, 7.5, 6.5]);
        Ok(())
    }
}
