//! Convolutional encoder used by the prior and posterior heads.

use candle_core::{Module, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};

use crate::component::{Component, ParamScope};
use crate::error::{ProbSegError, Result};

/// 2x2 stride-2 average pooling with ceil-mode output size.
///
/// Odd spatial sizes are first padded by replicating the last row/column, so
/// a clipped border window averages only the pixels it actually covers.
///
/// # Errors
///
/// Returns an error if `x` is not a 4-D tensor.
pub fn avg_pool_ceil(x: &Tensor) -> Result<Tensor> {
    let (_, _, h, w) = x.dims4()?;
    let mut x = x.clone();
    if h % 2 == 1 {
        x = x.pad_with_same(2, 0, 1)?;
    }
    if w % 2 == 1 {
        x = x.pad_with_same(3, 0, 1)?;
    }
    Ok(x.avg_pool2d(2)?)
}

/// Spatial size after `stages` encoder stages with same-padding convolutions.
///
/// Every stage but the first halves the size, rounding up.
pub fn encoder_output_size(height: usize, width: usize, stages: usize) -> (usize, usize) {
    (1..stages).fold((height, width), |(h, w), _| (h.div_ceil(2), w.div_ceil(2)))
}

/// Stack of `filters.len()` stages of 3x3 convolution + ReLU.
///
/// Stages after the first are preceded by [`avg_pool_ceil`].
pub struct ConvEncoder {
    stages: Vec<Vec<Conv2d>>,
    input_channels: usize,
    padding: bool,
    convs_per_block: usize,
    scope: ParamScope,
}

impl ConvEncoder {
    /// Build the encoder under `vb`.
    ///
    /// # Errors
    ///
    /// Returns an error if `filters` is empty, `convs_per_block` is zero, or
    /// a layer cannot be created.
    pub fn new(
        input_channels: usize,
        filters: &[usize],
        convs_per_block: usize,
        padding: bool,
        vb: VarBuilder,
        scope: ParamScope,
    ) -> Result<Self> {
        if filters.is_empty() || convs_per_block == 0 {
            return Err(ProbSegError::Config(
                "encoder needs at least one stage and one conv per stage".into(),
            ));
        }
        let cfg = Conv2dConfig {
            padding: usize::from(padding),
            ..Default::default()
        };

        let mut stages = Vec::with_capacity(filters.len());
        let mut in_dim = input_channels;
        for (i, &out_dim) in filters.iter().enumerate() {
            let stage_vb = vb.pp(format!("stage{i}"));
            let mut convs = Vec::with_capacity(convs_per_block);
            for j in 0..convs_per_block {
                let conv_in = if j == 0 { in_dim } else { out_dim };
                convs.push(conv2d(conv_in, out_dim, 3, cfg, stage_vb.pp(format!("conv{j}")))?);
            }
            stages.push(convs);
            in_dim = out_dim;
        }

        Ok(Self {
            stages,
            input_channels,
            padding,
            convs_per_block,
            scope,
        })
    }

    /// Number of input channels the first convolution expects.
    pub fn input_channels(&self) -> usize {
        self.input_channels
    }

    /// Spatial size of the encoder output for an `height x width` input.
    ///
    /// Returns `None` if the input is too small for unpadded convolutions.
    pub fn output_size(&self, height: usize, width: usize) -> Option<(usize, usize)> {
        if self.padding {
            return Some(encoder_output_size(height, width, self.stages.len()));
        }
        let shrink = 2 * self.convs_per_block;
        let mut size = (height, width);
        for i in 0..self.stages.len() {
            if i > 0 {
                size = (size.0.div_ceil(2), size.1.div_ceil(2));
            }
            size = (size.0.checked_sub(shrink)?, size.1.checked_sub(shrink)?);
            if size.0 == 0 || size.1 == 0 {
                return None;
            }
        }
        Some(size)
    }

    /// Encode `x` of shape `[B, input_channels, H, W]`.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if the channel count is wrong, or a candle
    /// error from the convolutions.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (_, c, _, _) = x.dims4()?;
        if c != self.input_channels {
            return Err(ProbSegError::shape_mismatch(
                format!("{} input channels", self.input_channels),
                format!("{c} channels"),
            ));
        }

        let mut x = x.clone();
        for (i, convs) in self.stages.iter().enumerate() {
            if i > 0 {
                x = avg_pool_ceil(&x)?;
            }
            for conv in convs {
                x = conv.forward(&x)?.relu()?;
            }
        }
        Ok(x)
    }
}

impl Component for ConvEncoder {
    fn scope(&self) -> &ParamScope {
        &self.scope
    }
}
