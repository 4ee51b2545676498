use candle_core::{bail, Device, Result, Tensor};

/// Offset of an anchor inside its grid cell.
pub const GRID_CELL_OFFSET: f64 = 0.5;

/// Builds the anchor grid of a feature pyramid.
///
/// Anchors are in grid units: the anchor of cell `(row, col)` at any scale sits at
/// `(col + offset, row + offset)`. Scales are concatenated in order, each flattened row-major.
///
/// # Arguments
///
/// * `sizes` - `(height, width)` of each scale.
/// * `strides` - Stride of each scale.
/// * `offset` - Position of the anchor inside its cell.
/// * `device` - Device of the returned tensors.
///
/// # Returns
///
/// The anchor centers with shape `(2, A)` (x then y) and the stride of each anchor with shape
/// `(1, A)`, where `A` is the sum of `height * width` over scales.
pub fn make_anchors(
    sizes: &[(usize, usize)],
    strides: &[f64],
    offset: f64,
    device: &Device,
) -> Result<(Tensor, Tensor)> {
    if sizes.is_empty() {
        bail!("cannot build anchors for zero scales");
    }
    if sizes.len() != strides.len() {
        bail!("{} scales but {} strides", sizes.len(), strides.len());
    }
    let total: usize = sizes.iter().map(|(h, w)| h * w).sum();
    let mut xs = Vec::with_capacity(total);
    let mut ys = Vec::with_capacity(total);
    let mut ss = Vec::with_capacity(total);
    for (&(h, w), &stride) in sizes.iter().zip(strides) {
        for row in 0..h {
            for col in 0..w {
                xs.push((col as f64 + offset) as f32);
                ys.push((row as f64 + offset) as f32);
            }
        }
        ss.extend(std::iter::repeat(stride as f32).take(h * w));
    }
    xs.extend(ys);
    let centers = Tensor::from_vec(xs, (2, total), device)?;
    let strides = Tensor::from_vec(ss, (1, total), device)?;
    Ok((centers, strides))
}

/// Anchor grid cached against the shape of the finest input feature map.
#[derive(Debug, Clone, Default)]
pub struct AnchorCache {
    shape: Option<Vec<usize>>,
    centers: Option<Tensor>,
    strides: Option<Tensor>,
    recompute_count: usize,
}

impl AnchorCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached anchors, rebuilding them first when `key` differs from the cached
    /// key, when nothing is cached yet or when `force` is set.
    ///
    /// # Arguments
    ///
    /// * `key` - Dimensions of the finest input feature map.
    /// * `features` - Projected feature maps; only their spatial sizes and device are read.
    /// * `strides` - Stride of each feature map.
    /// * `force` - Rebuild even if the key matches.
    ///
    /// # Returns
    ///
    /// The anchor centers `(2, A)` and per-anchor strides `(1, A)`.
    pub fn get_or_refresh(
        &mut self,
        key: &[usize],
        features: &[Tensor],
        strides: &[f64],
        force: bool,
    ) -> Result<(Tensor, Tensor)> {
        if !force && self.shape.as_deref() == Some(key) {
            if let (Some(centers), Some(strides)) = (&self.centers, &self.strides) {
                return Ok((centers.clone(), strides.clone()));
            }
        }
        let Some(first) = features.first() else {
            bail!("cannot build anchors for zero scales");
        };
        let sizes = features
            .iter()
            .map(|xs| {
                let (_, _, h, w) = xs.dims4()?;
                Ok((h, w))
            })
            .collect::<Result<Vec<_>>>()?;
        let (centers, per_anchor) = make_anchors(&sizes, strides, GRID_CELL_OFFSET, first.device())?;
        log::debug!(
            "anchor cache refreshed for input shape {key:?}: {} anchors",
            centers.dim(1)?
        );

        self.shape = Some(key.to_vec());
        self.centers = Some(centers.clone());
        self.strides = Some(per_anchor.clone());
        self.recompute_count += 1;
        Ok((centers, per_anchor))
    }

    /// Drops the cached anchors.
    pub fn invalidate(&mut self) {
        self.shape = None;
        self.centers = None;
        self.strides = None;
    }

    /// Number of times the anchors were rebuilt.
    pub fn recompute_count(&self) -> usize {
        self.recompute_count
    }

    /// The input shape the anchors were built for.
    pub fn shape(&self) -> Option<&[usize]> {
        self.shape.as_deref()
    }

    /// The cached anchor centers, `(2, A)`.
    pub fn centers(&self) -> Option<&Tensor> {
        self.centers.as_ref()
    }

    /// The cached per-anchor strides, `(1, A)`.
    pub fn strides(&self) -> Option<&Tensor> {
        self.strides.as_ref()
    }
}
