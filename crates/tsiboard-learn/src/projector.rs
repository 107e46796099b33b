//! Projector MLP described by a hyphen-separated width spec.
//!
//! `"128-256-218"` expands to three Linear layers from the encoder width.
//! Per-layer norm, activation and the two bias switches come from the
//! component params; BN-in-FP32 promotes batch-norm inputs when the model
//! runs in half precision.

use crate::error::{LearnError, LearnResult};
use candle_core::{DType, Tensor};
use candle_nn::{
    batch_norm, layer_norm, linear, linear_no_bias, BatchNorm, BatchNormConfig, LayerNorm, Linear,
    Module, ModuleT, VarBuilder,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormKind {
    None,
    BatchNorm1d,
    LayerNorm,
}

impl NormKind {
    pub fn parse(text: &str) -> LearnResult<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "batchnorm1d" | "batchnorm" | "bn" => Ok(NormKind::BatchNorm1d),
            "layernorm" | "ln" => Ok(NormKind::LayerNorm),
            "none" | "null" | "identity" => Ok(NormKind::None),
            other => Err(LearnError::config(format!(
                "invalid projector_norm: {other} (expected BatchNorm1d/LayerNorm/None)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActKind {
    ReLU,
    SiLU,
}

impl ActKind {
    pub fn parse(text: &str) -> LearnResult<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "relu" => Ok(ActKind::ReLU),
            "silu" | "swish" => Ok(ActKind::SiLU),
            other => Err(LearnError::config(format!(
                "invalid projector_activation: {other} (expected ReLU/SiLU)"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProjectorOptions {
    pub norm: NormKind,
    pub activation: ActKind,
    pub hidden_bias: bool,
    pub last_bias: bool,
    pub bn_in_fp32: bool,
}

/// Parse `"128-256-218"` into layer widths.
pub fn parse_mlp_spec(spec: &str) -> LearnResult<Vec<usize>> {
    let widths: Result<Vec<usize>, _> =
        spec.split('-').map(|tok| tok.trim().parse::<usize>()).collect();
    let widths =
        widths.map_err(|_| LearnError::config(format!("invalid projector_mlp_spec: {spec}")))?;
    if widths.is_empty() || widths.iter().any(|&w| w == 0) {
        return Err(LearnError::config(format!("invalid projector_mlp_spec: {spec}")));
    }
    Ok(widths)
}

#[derive(Debug)]
enum Norm {
    None,
    Batch(BatchNorm),
    Layer(LayerNorm),
}

#[derive(Debug)]
struct ProjectorLayer {
    fc: Linear,
    norm: Norm,
    /// Activation is skipped on the last layer.
    activate: bool,
}

#[derive(Debug)]
pub struct Projector {
    layers: Vec<ProjectorLayer>,
    options: ProjectorOptions,
    out_dim: usize,
}

impl Projector {
    pub fn new(
        in_dim: usize,
        mlp_spec: &str,
        options: ProjectorOptions,
        vb: VarBuilder,
    ) -> LearnResult<Self> {
        let widths = parse_mlp_spec(mlp_spec)?;
        let mut layers = Vec::with_capacity(widths.len());
        let mut prev = in_dim;
        for (i, &width) in widths.iter().enumerate() {
            let last = i + 1 == widths.len();
            let vb_layer = vb.pp(format!("layer_{i}"));
            let use_bias = if last { options.last_bias } else { options.hidden_bias };
            let fc = if use_bias {
                linear(prev, width, vb_layer.pp("fc"))?
            } else {
                linear_no_bias(prev, width, vb_layer.pp("fc"))?
            };
            let norm = if last {
                Norm::None
            } else {
                match options.norm {
                    NormKind::None => Norm::None,
                    NormKind::BatchNorm1d => Norm::Batch(batch_norm(
                        width,
                        BatchNormConfig::default(),
                        vb_layer.pp("bn"),
                    )?),
                    NormKind::LayerNorm => {
                        Norm::Layer(layer_norm(width, 1e-5, vb_layer.pp("ln"))?)
                    }
                }
            };
            layers.push(ProjectorLayer { fc, norm, activate: !last });
            prev = width;
        }
        Ok(Projector { layers, options, out_dim: prev })
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    /// `z: [N, in_dim]` → `[N, out_dim]`.
    pub fn forward(&self, z: &Tensor, train: bool) -> LearnResult<Tensor> {
        let mut h = z.clone();
        for layer in &self.layers {
            h = layer.fc.forward(&h)?;
            h = match &layer.norm {
                Norm::None => h,
                Norm::Layer(ln) => ln.forward(&h)?,
                Norm::Batch(bn) => {
                    if self.options.bn_in_fp32 && h.dtype() != DType::F32 {
                        let promoted = h.to_dtype(DType::F32)?;
                        bn.forward_t(&promoted, train)?.to_dtype(h.dtype())?
                    } else {
                        bn.forward_t(&h, train)?
                    }
                }
            };
            if layer.activate {
                h = match self.options.activation {
                    ActKind::ReLU => h.relu()?,
                    ActKind::SiLU => candle_nn::ops::silu(&h)?,
                };
            }
        }
        Ok(h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::{VarBuilder, VarMap};

    fn options(norm: NormKind) -> ProjectorOptions {
        ProjectorOptions {
            norm,
            activation: ActKind::ReLU,
            hidden_bias: true,
            last_bias: false,
            bn_in_fp32: false,
        }
    }

    #[test]
    fn spec_parses_widths() {
        assert_eq!(parse_mlp_spec("128-256-218").unwrap(), vec![128, 256, 218]);
        assert!(parse_mlp_spec("128-x").is_err());
        assert!(parse_mlp_spec("0-8").is_err());
        assert!(parse_mlp_spec("").is_err());
    }

    #[test]
    fn forward_maps_to_last_width() {
        let device = Device::Cpu;
        for norm in [NormKind::None, NormKind::LayerNorm, NormKind::BatchNorm1d] {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
            let projector = Projector::new(16, "32-24", options(norm), vb).unwrap();
            assert_eq!(projector.out_dim(), 24);
            let z = Tensor::randn(0f32, 1f32, (8, 16), &device).unwrap();
            let out = projector.forward(&z, true).unwrap();
            assert_eq!(out.dims(), &[8, 24]);
        }
    }

    #[test]
    fn norm_and_activation_tokens_parse() {
        assert_eq!(NormKind::parse("BatchNorm1d").unwrap(), NormKind::BatchNorm1d);
        assert_eq!(NormKind::parse("ln").unwrap(), NormKind::LayerNorm);
        assert!(NormKind::parse("rmsnorm").is_err());
        assert_eq!(ActKind::parse("SiLU").unwrap(), ActKind::SiLU);
        assert!(ActKind::parse("tanh").is_err());
    }
}
