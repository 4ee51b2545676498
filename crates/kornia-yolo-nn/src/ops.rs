use candle_core::{bail, Result, Tensor};
use candle_nn::Module;

use crate::error::BlockError;

/// Returns the `(start, len)` channel range of chunk `id` when `channels` are cut into
/// `groups` chunks of `ceil(channels / groups)` channels, the last one possibly shorter.
///
/// Returns `None` when chunk `id` would be empty.
pub fn chunk_range(channels: usize, groups: usize, id: usize) -> Option<(usize, usize)> {
    if groups == 0 {
        return None;
    }
    let size = channels.div_ceil(groups);
    let start = id * size;
    if start >= channels {
        return None;
    }
    Some((start, size.min(channels - start)))
}

/// Splits `xs` along the channel axis into consecutive slices of the given widths.
///
/// # Errors
///
/// Fails if the widths do not add up to the channel count of `xs`.
pub fn split_channels(xs: &Tensor, sizes: &[usize]) -> Result<Vec<Tensor>> {
    let channels = xs.dim(1)?;
    let total: usize = sizes.iter().sum();
    if total != channels {
        bail!("split widths {sizes:?} do not add up to {channels} channels");
    }
    let mut start = 0;
    let mut parts = Vec::with_capacity(sizes.len());
    for &size in sizes {
        parts.push(xs.narrow(1, start, size)?);
        start += size;
    }
    Ok(parts)
}

/// Interleaves two equally shaped NCHW tensors channel by channel.
///
/// Output channel `2i` is channel `i` of `even` and output channel `2i + 1` is channel `i`
/// of `odd`.
pub fn interleave_channels(even: &Tensor, odd: &Tensor) -> Result<Tensor> {
    let (b, c, h, w) = even.dims4()?;
    if odd.dims4()? != (b, c, h, w) {
        bail!(
            "cannot interleave {:?} with {:?}",
            even.shape(),
            odd.shape()
        );
    }
    Tensor::stack(&[even, odd], 2)?.reshape((b, 2 * c, h, w))
}

/// Selects one chunk of the channel axis, with the chunk size rounded up.
#[derive(Debug, Clone, Copy)]
pub struct Groups {
    groups: usize,
    group_id: usize,
}

impl Groups {
    /// Creates the selector for chunk `group_id` out of `groups`.
    pub fn new(groups: usize, group_id: usize) -> std::result::Result<Self, BlockError> {
        if groups == 0 || group_id >= groups {
            return Err(BlockError::InvalidArgument(format!(
                "group {group_id} out of {groups}"
            )));
        }
        Ok(Self { groups, group_id })
    }
}

impl Module for Groups {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let channels = xs.dim(1)?;
        match chunk_range(channels, self.groups, self.group_id) {
            Some((start, len)) => xs.narrow(1, start, len),
            None => bail!(
                "chunk {} of {} is empty for {channels} channels",
                self.group_id,
                self.groups
            ),
        }
    }
}

/// Selects channels `[c / groups * id, c / groups * (id + 1))` with floor division.
#[derive(Debug, Clone, Copy)]
pub struct GroupsF {
    groups: usize,
    group_id: usize,
}

impl GroupsF {
    /// Creates the selector for slice `group_id` out of `groups`.
    pub fn new(groups: usize, group_id: usize) -> std::result::Result<Self, BlockError> {
        if groups == 0 || group_id >= groups {
            return Err(BlockError::InvalidArgument(format!(
                "group {group_id} out of {groups}"
            )));
        }
        Ok(Self { groups, group_id })
    }
}

impl Module for GroupsF {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let width = xs.dim(1)? / self.groups;
        if width == 0 {
            bail!("fewer channels than groups ({})", self.groups);
        }
        xs.narrow(1, width * self.group_id, width)
    }
}

/// Adds two feature maps.
#[derive(Debug, Clone, Copy, Default)]
pub struct Shortcut;

impl Shortcut {
    /// Returns `xs[0] + xs[1]`.
    pub fn forward(&self, xs: &[Tensor]) -> Result<Tensor> {
        match xs {
            [a, b, ..] => a + b,
            _ => bail!("shortcut needs two inputs, got {}", xs.len()),
        }
    }
}

/// Sums an arbitrary number of feature maps.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bagging;

impl Bagging {
    /// Returns the element-wise sum of all inputs.
    pub fn forward(&self, xs: &[Tensor]) -> Result<Tensor> {
        let Some((first, rest)) = xs.split_first() else {
            bail!("bagging needs at least one input");
        };
        rest.iter().try_fold(first.clone(), |acc, x| acc + x)
    }
}

/// Adds a down-weighted auxiliary feature map to the main one during training.
#[derive(Debug, Clone, Copy)]
pub struct AuxiliaryShortcut {
    ratio: f64,
}

impl Default for AuxiliaryShortcut {
    fn default() -> Self {
        Self { ratio: 0.3 }
    }
}

impl AuxiliaryShortcut {
    /// Creates the shortcut with the given auxiliary weight.
    pub fn new(ratio: f64) -> Self {
        Self { ratio }
    }

    /// Returns `xs[0] + xs[1] * ratio`.
    pub fn forward(&self, xs: &[Tensor]) -> Result<Tensor> {
        match xs {
            [main, aux, ..] => main + (aux * self.ratio)?,
            _ => bail!("auxiliary shortcut needs two inputs, got {}", xs.len()),
        }
    }

    /// Deployment form: the auxiliary input is dropped.
    pub fn forward_fuse(&self, xs: &[Tensor]) -> Result<Tensor> {
        match xs.first() {
            Some(main) => Ok(main.clone()),
            None => bail!("auxiliary shortcut needs an input"),
        }
    }
}
