//! Feature combiner: fuses a latent sample with the backbone feature map.

use candle_core::{Module, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};

use crate::component::{Component, ParamScope};
use crate::config::ModelConfig;
use crate::error::{ProbSegError, Result};

/// Repeat every element of `t` along `dim` `n` times, contiguously.
///
/// Tiling `[a, b]` by 3 gives `[a, a, a, b, b, b]`. Implemented as a plain
/// repeat followed by an index gather that restores the per-element order.
/// Strided views (such as a narrowed distribution mean) are accepted.
///
/// # Errors
///
/// Returns an error if `dim` is out of range.
pub fn tile(t: &Tensor, dim: usize, n: usize) -> Result<Tensor> {
    let init_dim = t.dim(dim)?;
    let mut repeats = vec![1usize; t.rank()];
    repeats[dim] = n;
    // index_select needs a contiguous layout
    let repeated = t.repeat(repeats)?.contiguous()?;

    let order: Vec<u32> = (0..init_dim)
        .flat_map(|i| (0..n).map(move |j| (i + init_dim * j) as u32))
        .collect();
    let order = Tensor::from_vec(order, init_dim * n, t.device())?;
    Ok(repeated.index_select(&order, dim)?)
}

/// `convs_per_fcomb_block` 1x1 convolutions over `[features, tiled z]`.
///
/// All but the last are followed by ReLU; the last maps to class logits.
pub struct FeatureCombiner {
    hidden: Vec<Conv2d>,
    last: Conv2d,
    feature_channels: usize,
    latent_dim: usize,
    scope: ParamScope,
}

impl FeatureCombiner {
    /// Build the combiner under `vb`.
    ///
    /// # Errors
    ///
    /// Returns an error if fewer than two convolutions are configured or a
    /// layer cannot be created.
    pub fn new(config: &ModelConfig, vb: VarBuilder, scope: ParamScope) -> Result<Self> {
        if config.convs_per_fcomb_block < 2 {
            return Err(ProbSegError::Config(
                "feature combiner needs at least two convolutions".into(),
            ));
        }
        let feature_channels = config.effective_filter_counts()[0];
        let cfg = Conv2dConfig::default();

        let mut hidden = Vec::with_capacity(config.convs_per_fcomb_block - 1);
        hidden.push(conv2d(
            feature_channels + config.latent_dim,
            feature_channels,
            1,
            cfg,
            vb.pp("layer0"),
        )?);
        for i in 1..config.convs_per_fcomb_block - 1 {
            hidden.push(conv2d(
                feature_channels,
                feature_channels,
                1,
                cfg,
                vb.pp(format!("layer{i}")),
            )?);
        }
        let last = conv2d(feature_channels, config.num_classes, 1, cfg, vb.pp("last"))?;

        Ok(Self {
            hidden,
            last,
            feature_channels,
            latent_dim: config.latent_dim,
            scope,
        })
    }

    /// Combine `feature_map` `[B, C0, H, W]` with `z` `[B, latent_dim]` into
    /// logits `[B, num_classes, H, W]`.
    ///
    /// # Errors
    ///
    /// Returns `ShapeMismatch` if channel, batch or latent sizes disagree.
    pub fn combine(&self, feature_map: &Tensor, z: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = feature_map.dims4()?;
        if c != self.feature_channels {
            return Err(ProbSegError::shape_mismatch(
                format!("{} feature channels", self.feature_channels),
                format!("{c}"),
            ));
        }
        if z.dims() != &[b, self.latent_dim] {
            return Err(ProbSegError::shape_mismatch(
                format!("latent [{b}, {}]", self.latent_dim),
                format!("{:?}", z.dims()),
            ));
        }

        let z = tile(&z.unsqueeze(2)?, 2, h)?;
        let z = tile(&z.unsqueeze(3)?, 3, w)?;
        let mut x = Tensor::cat(&[feature_map, &z], 1)?;
        for conv in &self.hidden {
            x = conv.forward(&x)?.relu()?;
        }
        Ok(self.last.forward(&x)?)
    }
}

impl Component for FeatureCombiner {
    fn scope(&self) -> &ParamScope {
        &self.scope
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_tile_repeats_each_element_contiguously() -> Result<()> {
        let t = Tensor::new(&[1f32, 2.0], &Device::Cpu)?;
        let tiled: Vec<f32> = tile(&t, 0, 3)?.to_vec1()?;
        assert_eq!(tiled, vec![1.0, 1.0, 1.0, 2.0, 2.0, 2.0]);
        Ok(())
    }

    #[test]
    fn test_tile_inner_dim() -> Result<()> {
        let t = Tensor::new(&[[1f32, 2.0], [3.0, 4.0]], &Device::Cpu)?;
        let tiled: Vec<Vec<f32>> = tile(&t, 1, 2)?.to_vec2()?;
        assert_eq!(tiled, vec![vec![1.0, 1.0, 2.0, 2.0], vec![3.0, 3.0, 4.0, 4.0]]);
        Ok(())
    }

    #[test]
    fn test_latent_broadcast_is_constant_per_channel() -> Result<()> {
        let z = Tensor::new(&[[5f32, -1.0]], &Device::Cpu)?;
        let z = tile(&z.unsqueeze(2)?, 2, 3)?;
        let z = tile(&z.unsqueeze(3)?, 3, 4)?;
        assert_eq!(z.dims(), &[1, 2, 3, 4]);
        let values: Vec<f32> = z.flatten_all()?.to_vec1()?;
        assert!(values[..12].iter().all(|&v| v == 5.0));
        assert!(values[12..].iter().all(|&v| v == -1.0));
        Ok(())
    }

    #[test]
    fn test_tile_strided_view() -> Result<()> {
        // columns 1..3 of a [2, 4] tensor: a non-contiguous [2, 2] view
        let t = Tensor::new(&[[0f32, 1.0, 2.0, 9.0], [0.0, 3.0, 4.0, 9.0]], &Device::Cpu)?;
        let view = t.narrow(1, 1, 2)?;
        assert!(!view.is_contiguous());
        let tiled: Vec<Vec<f32>> = tile(&view, 1, 2)?.to_vec2()?;
        assert_eq!(tiled, vec![vec![1.0, 1.0, 2.0, 2.0], vec![3.0, 3.0, 4.0, 4.0]]);
        Ok(())
    }

    #[test]
    fn test_combine_shapes_and_layer_count() -> Result<()> {
        let config = ModelConfig {
            num_classes: 3,
            latent_dim: 2,
            convs_per_fcomb_block: 4,
            ..Default::default()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let fcomb = FeatureCombiner::new(&config, vb.pp("fcomb"), ParamScope::new(&varmap, "fcomb"))?;
        // 3 hidden + last, weight and bias each
        assert_eq!(fcomb.parameters()?.len(), 8);

        let features = Tensor::randn(0f32, 1.0, (2, 3, 5, 7), &Device::Cpu)?;
        let z = Tensor::randn(0f32, 1.0, (2, 2), &Device::Cpu)?;
        assert_eq!(fcomb.combine(&features, &z)?.dims(), &[2, 3, 5, 7]);

        let packed = Tensor::randn(0f32, 1.0, (2, 4), &Device::Cpu)?;
        let strided = packed.narrow(1, 2, 2)?;
        assert_eq!(fcomb.combine(&features, &strided)?.dims(), &[2, 3, 5, 7]);

        let wrong_batch = Tensor::randn(0f32, 1.0, (3, 2), &Device::Cpu)?;
        assert!(matches!(
            fcomb.combine(&features, &wrong_batch),
            Err(ProbSegError::ShapeMismatch { .. })
        ));
        Ok(())
    }
}
