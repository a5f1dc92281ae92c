//! Segmentation backbone producing the feature map for the combiner.

use candle_core::{Module, Tensor};
use candle_nn::{batch_norm, conv2d, BatchNorm, Conv2d, Conv2dConfig, ModuleT, VarBuilder};

use crate::component::{Component, ParamScope};
use crate::config::BackboneConfig;
use crate::error::{ProbSegError, Result};

/// A network mapping `[B, C_in, H, W]` images to `[B, out_channels, H, W]`
/// feature maps.
pub trait Backbone: Component {
    /// Encode an image batch.
    ///
    /// # Errors
    ///
    /// Returns an error on shape mismatches or tensor failures.
    fn encode(&self, image: &Tensor) -> Result<Tensor>;

    /// Channel count of the produced feature map.
    fn out_channels(&self) -> usize;
}

struct ConvBnRelu {
    conv: Conv2d,
    bn: BatchNorm,
}

impl ConvBnRelu {
    fn new(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        Ok(Self {
            conv: conv2d(in_dim, out_dim, 3, cfg, vb.pp("conv"))?,
            bn: batch_norm(out_dim, 1e-5, vb.pp("bn"))?,
        })
    }

    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.conv.forward(x)?;
        Ok(self.bn.forward_t(&x, train)?.relu()?)
    }
}

/// SegNet-style encoder/decoder.
///
/// Each encoder stage is `convs_per_stage` conv + batch-norm + ReLU units
/// followed by 2x2 max pooling; the decoder upsamples back to the recorded
/// pre-pool size (nearest neighbour) and mirrors the stages. A final 3x3
/// convolution maps to `out_channels`. Spatial size is preserved for odd
/// inputs.
pub struct SegNet {
    encoder: Vec<Vec<ConvBnRelu>>,
    decoder: Vec<Vec<ConvBnRelu>>,
    classifier: Conv2d,
    in_channels: usize,
    out_channels: usize,
    training: bool,
    scope: ParamScope,
}

impl SegNet {
    /// Build the backbone under `vb`.
    ///
    /// # Errors
    ///
    /// Returns an error on an empty filter list or if a layer cannot be created.
    pub fn new(
        config: &BackboneConfig,
        in_channels: usize,
        out_channels: usize,
        vb: VarBuilder,
        scope: ParamScope,
    ) -> Result<Self> {
        if config.filters.is_empty() || config.convs_per_stage == 0 {
            return Err(ProbSegError::Config(
                "backbone needs at least one stage and one conv per stage".into(),
            ));
        }
        let filters = &config.filters;

        let mut encoder = Vec::with_capacity(filters.len());
        let mut in_dim = in_channels;
        for (i, &out_dim) in filters.iter().enumerate() {
            let stage_vb = vb.pp(format!("enc{i}"));
            let units = (0..config.convs_per_stage)
                .map(|j| {
                    let unit_in = if j == 0 { in_dim } else { out_dim };
                    ConvBnRelu::new(unit_in, out_dim, stage_vb.pp(format!("unit{j}")))
                })
                .collect::<Result<Vec<_>>>()?;
            encoder.push(units);
            in_dim = out_dim;
        }

        // decoder stage i undoes encoder stage i and narrows to filters[i - 1]
        let mut decoder = Vec::with_capacity(filters.len());
        for i in (0..filters.len()).rev() {
            let stage_vb = vb.pp(format!("dec{i}"));
            let width = filters[i];
            let target = if i == 0 { filters[0] } else { filters[i - 1] };
            let units = (0..config.convs_per_stage)
                .map(|j| {
                    let unit_out = if j + 1 == config.convs_per_stage {
                        target
                    } else {
                        width
                    };
                    ConvBnRelu::new(width, unit_out, stage_vb.pp(format!("unit{j}")))
                })
                .collect::<Result<Vec<_>>>()?;
            decoder.push(units);
        }

        let classifier = conv2d(
            filters[0],
            out_channels,
            3,
            Conv2dConfig {
                padding: 1,
                ..Default::default()
            },
            vb.pp("classifier"),
        )?;

        Ok(Self {
            encoder,
            decoder,
            classifier,
            in_channels,
            out_channels,
            training: false,
            scope,
        })
    }
}

impl Component for SegNet {
    fn scope(&self) -> &ParamScope {
        &self.scope
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

impl Backbone for SegNet {
    fn encode(&self, image: &Tensor) -> Result<Tensor> {
        let (_, c, _, _) = image.dims4()?;
        if c != self.in_channels {
            return Err(ProbSegError::shape_mismatch(
                format!("{} image channels", self.in_channels),
                format!("{c}"),
            ));
        }

        let mut x = image.clone();
        let mut sizes = Vec::with_capacity(self.encoder.len());
        for stage in &self.encoder {
            for unit in stage {
                x = unit.forward(&x, self.training)?;
            }
            let (_, _, h, w) = x.dims4()?;
            sizes.push((h, w));
            if h >= 2 && w >= 2 {
                x = x.max_pool2d(2)?;
            }
        }

        for (stage, &(h, w)) in self.decoder.iter().zip(sizes.iter().rev()) {
            x = x.upsample_nearest2d(h, w)?;
            for unit in stage {
                x = unit.forward(&x, self.training)?;
            }
        }

        Ok(self.classifier.forward(&x)?)
    }

    fn out_channels(&self) -> usize {
        self.out_channels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn segnet(varmap: &VarMap, filters: Vec<usize>) -> SegNet {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        let config = BackboneConfig {
            filters,
            convs_per_stage: 1,
        };
        SegNet::new(&config, 1, 5, vb.pp("backbone"), ParamScope::new(varmap, "backbone")).unwrap()
    }

    #[test]
    fn test_spatial_size_preserved() -> Result<()> {
        let varmap = VarMap::new();
        let net = segnet(&varmap, vec![4, 8, 8]);
        for (h, w) in [(16, 16), (15, 9), (5, 7)] {
            let x = Tensor::randn(0f32, 1.0, (2, 1, h, w), &Device::Cpu)?;
            assert_eq!(net.encode(&x)?.dims(), &[2, 5, h, w]);
        }
        Ok(())
    }

    #[test]
    fn test_tiny_input_skips_pooling() -> Result<()> {
        let varmap = VarMap::new();
        let net = segnet(&varmap, vec![4, 4, 4]);
        let x = Tensor::randn(0f32, 1.0, (1, 1, 3, 3), &Device::Cpu)?;
        assert_eq!(net.encode(&x)?.dims(), &[1, 5, 3, 3]);
        Ok(())
    }

    #[test]
    fn test_training_mode_toggle() -> Result<()> {
        let varmap = VarMap::new();
        let mut net = segnet(&varmap, vec![4]);
        assert!(!net.is_training());
        net.set_training(true);
        assert!(net.is_training());

        let x = Tensor::randn(0f32, 1.0, (2, 1, 6, 6), &Device::Cpu)?;
        assert_eq!(net.encode(&x)?.dims(), &[2, 5, 6, 6]);
        Ok(())
    }

    #[test]
    fn test_wrong_input_channels() {
        let varmap = VarMap::new();
        let net = segnet(&varmap, vec![4]);
        let x = Tensor::zeros((1, 3, 6, 6), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(net.encode(&x), Err(ProbSegError::ShapeMismatch { .. })));
    }
}
