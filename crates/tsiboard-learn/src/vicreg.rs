//! The VICReg-4D model: encoder + SWA encoder + projector, wired to the
//! optimizer/scheduler/loss triple of its training setup.
//!
//! Construction is two-stage: [`VicregSpec`] is a plain value decoded from
//! the training-spec tables, and [`Vicreg4D::instantiate`] turns it into a live
//! model on a device. A training step draws two augmented views of the
//! batch, projects the last valid timestep of each, and descends the
//! VICReg objective; the SWA copy starts averaging after the configured
//! iteration.

use crate::augment::{Augmentation, WarpCurve, WarpPreset};
use crate::encoder::{EncoderDims, VicregEncoder};
use crate::error::{LearnError, LearnResult};
use crate::optim::OptimizerAny;
use crate::projector::{ActKind, NormKind, Projector, ProjectorOptions};
use crate::sched::{LrScheduler, SchedulerMode};
use crate::setup::TrainingSetup;
use crate::swa::SwaState;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Built-in warp presets used when the training spec declares no augmentation set.
fn default_warp_presets() -> Vec<WarpPreset> {
    let preset = |curve, curve_param, noise, smooth, drop, jitter, band, ch_drop| WarpPreset {
        curve,
        curve_param,
        noise_scale: noise,
        smoothing_kernel_size: smooth,
        point_drop_prob: drop,
        value_jitter_std: jitter,
        time_mask_band_frac: band,
        channel_dropout_prob: ch_drop,
    };
    vec![
        preset(WarpCurve::Linear, 0.0, 0.02, 3, 0.06, 0.015, 0.00, 0.00),
        preset(WarpCurve::Linear, 0.0, 0.06, 5, 0.06, 0.015, 0.00, 0.00),
        preset(WarpCurve::ChaoticDrift, 0.0, 0.10, 7, 0.08, 0.020, 0.03, 0.05),
        preset(WarpCurve::MarketFade, 3.0, 0.02, 5, 0.08, 0.015, 0.00, 0.03),
        preset(WarpCurve::MarketFade, 5.0, 0.03, 7, 0.08, 0.015, 0.05, 0.03),
        preset(WarpCurve::FadeLate, 3.0, 0.02, 5, 0.08, 0.015, 0.00, 0.03),
        preset(WarpCurve::PulseCentered, 0.0, 0.02, 5, 0.06, 0.015, 0.03, 0.00),
        preset(WarpCurve::FrontLoaded, 0.6, 0.03, 3, 0.08, 0.020, 0.00, 0.05),
        preset(WarpCurve::FrontLoaded, 0.3, 0.03, 5, 0.08, 0.020, 0.00, 0.05),
        preset(WarpCurve::PulseCentered, 0.0, 0.04, 7, 0.08, 0.020, 0.05, 0.03),
    ]
}

fn dtype_from_tag(tag: &str) -> LearnResult<DType> {
    match tag {
        "f16" => Ok(DType::F16),
        "f32" => Ok(DType::F32),
        "f64" => Ok(DType::F64),
        other => Err(LearnError::config(format!(
            "unknown dtype tag: '{other}' (expected f16|f32|f64)"
        ))),
    }
}

fn dtype_tag(dtype: DType) -> &'static str {
    match dtype {
        DType::F16 => "f16",
        DType::F64 => "f64",
        _ => "f32",
    }
}

/// Pure constructor-relevant configuration of one VICReg model.
#[derive(Debug, Clone)]
pub struct VicregSpec {
    pub component_name: String,
    pub c: usize,
    pub t: usize,
    pub d: usize,
    pub encoding_dims: usize,
    pub channel_expansion_dim: usize,
    pub fused_feature_dim: usize,
    pub encoder_hidden_dims: usize,
    pub encoder_depth: usize,
    pub projector_mlp_spec: String,
    pub projector: ProjectorOptions,
    pub dtype: DType,
    pub optimizer_threshold_reset: i64,
    pub enable_buffer_averaging: bool,
    pub swa_start_iter: i64,
    pub seed: u64,
    pub clip_norm: f64,
}

impl VicregSpec {
    /// Decode the model configuration from a training setup plus the dataloader-derived
    /// tensor geometry.
    pub fn from_setup(
        component_name: &str,
        c: usize,
        t: usize,
        d: usize,
        setup: &TrainingSetup,
    ) -> LearnResult<Self> {
        let usize_param = |key: &str| -> LearnResult<usize> {
            let v = setup.param_i64(key)?;
            if v <= 0 {
                return Err(LearnError::config(format!("'{key}' must be > 0, got {v}")));
            }
            Ok(v as usize)
        };
        Ok(VicregSpec {
            component_name: component_name.to_string(),
            c,
            t,
            d,
            encoding_dims: usize_param("encoding_dims")?,
            channel_expansion_dim: usize_param("channel_expansion_dim")?,
            fused_feature_dim: usize_param("fused_feature_dim")?,
            encoder_hidden_dims: usize_param("encoder_hidden_dims")?,
            encoder_depth: usize_param("encoder_depth")?,
            projector_mlp_spec: setup.param_str("projector_mlp_spec")?,
            projector: ProjectorOptions {
                norm: NormKind::parse(&setup.param_str("projector_norm")?)?,
                activation: ActKind::parse(&setup.param_str("projector_activation")?)?,
                hidden_bias: setup.param_bool("projector_hidden_bias")?,
                last_bias: setup.param_bool("projector_last_bias")?,
                bn_in_fp32: setup.param_bool("projector_bn_in_fp32")?,
            },
            dtype: dtype_from_tag(&setup.dtype_tag()?)?,
            optimizer_threshold_reset: setup.param_i64("optimizer_threshold_reset")?,
            enable_buffer_averaging: setup.param_bool("enable_buffer_averaging")?,
            swa_start_iter: setup.param_i64("swa_start_iter")?,
            seed: setup.seed()?,
            clip_norm: setup.clip_norm()?,
        })
    }

    fn encoder_dims(&self) -> EncoderDims {
        EncoderDims {
            c: self.c,
            t: self.t,
            d: self.d,
            encoding_dims: self.encoding_dims,
            channel_expansion_dim: self.channel_expansion_dim,
            fused_feature_dim: self.fused_feature_dim,
            encoder_hidden_dims: self.encoder_hidden_dims,
            encoder_depth: self.encoder_depth,
        }
    }
}

/// Outcome of one training step.
#[derive(Debug, Clone, Copy)]
pub struct StepStats {
    pub loss: f64,
    pub invariance: f64,
    pub variance: f64,
    pub covariance: f64,
    pub lr: f64,
    pub valid_rows: usize,
}

pub struct Vicreg4D {
    spec: VicregSpec,
    setup: Arc<TrainingSetup>,
    device: Device,
    encoder_map: VarMap,
    encoder: VicregEncoder,
    swa_map: VarMap,
    swa_encoder: VicregEncoder,
    swa_state: SwaState,
    projector_map: VarMap,
    projector: Projector,
    optimizer: Box<dyn OptimizerAny>,
    scheduler: Box<dyn LrScheduler>,
    augmentation: Augmentation,
    rng: StdRng,
    step_count: u64,
    training: bool,
}

impl Vicreg4D {
    /// Stage two of construction: bring a spec to life on a device.
    pub fn instantiate(
        spec: VicregSpec,
        setup: Arc<TrainingSetup>,
        device: Device,
        training: bool,
    ) -> LearnResult<Self> {
        device.set_seed(spec.seed)?;

        let encoder_map = VarMap::new();
        let encoder = VicregEncoder::new(
            spec.encoder_dims(),
            VarBuilder::from_varmap(&encoder_map, spec.dtype, &device),
        )?;
        let swa_map = VarMap::new();
        let swa_encoder = VicregEncoder::new(
            spec.encoder_dims(),
            VarBuilder::from_varmap(&swa_map, spec.dtype, &device),
        )?;
        let mut swa_state =
            SwaState::new(spec.enable_buffer_averaging, vec!["running_".to_string()]);
        swa_state.reset_from(&encoder_map, &swa_map)?;

        let projector_map = VarMap::new();
        let projector = Projector::new(
            spec.encoding_dims,
            &spec.projector_mlp_spec,
            spec.projector.clone(),
            VarBuilder::from_varmap(&projector_map, spec.dtype, &device),
        )?;

        let mut params: Vec<Var> = Vec::new();
        params.extend(encoder_map.all_vars());
        params.extend(projector_map.all_vars());
        let optimizer = setup.optimizer_builder.build(params)?;
        let scheduler = setup.scheduler_builder.build(setup.optimizer_builder.base_lr());

        let presets = if setup.augmentation_presets.is_empty() {
            default_warp_presets()
        } else {
            setup.augmentation_presets.clone()
        };

        let rng = StdRng::seed_from_u64(spec.seed);
        Ok(Vicreg4D {
            augmentation: Augmentation { presets },
            rng,
            optimizer,
            scheduler,
            projector,
            projector_map,
            swa_state,
            swa_encoder,
            swa_map,
            encoder,
            encoder_map,
            device,
            setup,
            spec,
            step_count: 0,
            training,
        })
    }

    pub fn spec(&self) -> &VicregSpec {
        &self.spec
    }

    pub fn component_name(&self) -> &str {
        &self.spec.component_name
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    pub fn scheduler_mode(&self) -> SchedulerMode {
        self.scheduler.mode()
    }

    fn check_batch(&self, data: &Tensor, mask: &Tensor) -> LearnResult<()> {
        let dims = data.dims();
        if dims.len() != 4 || dims[1] != self.spec.c || dims[2] != self.spec.t || dims[3] != self.spec.d
        {
            return Err(LearnError::config(format!(
                "batch shape {:?} does not match model [B,{},{},{}]",
                dims, self.spec.c, self.spec.t, self.spec.d
            )));
        }
        let mdims = mask.dims();
        if mdims.len() != 3 || mdims[0] != dims[0] || mdims[1] != dims[1] || mdims[2] != dims[2] {
            return Err(LearnError::config(format!(
                "mask shape {:?} does not match batch {:?}",
                mdims, dims
            )));
        }
        Ok(())
    }

    /// Last-timestep representation of the valid rows of both views.
    fn project_last_step(
        &self,
        rep: &Tensor,
        row_indices: &Tensor,
    ) -> LearnResult<Tensor> {
        let t = self.spec.t;
        let last = rep.narrow(1, t - 1, 1)?.squeeze(1)?; // [B,E]
        let selected = last.index_select(row_indices, 0)?;
        self.projector.forward(&selected, self.training)
    }

    /// One optimization step on a `[B,C,T,D]` batch. Returns `None` when no
    /// sample survives masking in both views.
    pub fn train_step(&mut self, data: &Tensor, mask: &Tensor) -> LearnResult<Option<StepStats>> {
        if !self.training {
            return Err(LearnError::state("train_step called on a non-training model"));
        }
        self.check_batch(data, mask)?;
        let data = data.to_dtype(self.spec.dtype)?;

        // two independently-sampled views
        let (xa, ma) = self.augmentation.augment(&data, mask, &mut self.rng)?;
        let (xb, mb) = self.augmentation.augment(&data, mask, &mut self.rng)?;

        let (rep_a, valid_a) = self.encoder.forward(&xa, &ma)?;
        let (rep_b, valid_b) = self.encoder.forward(&xb, &mb)?;

        // rows whose final timestep is real in both views
        let t = self.spec.t;
        let last_a = valid_a.narrow(1, t - 1, 1)?.squeeze(1)?;
        let last_b = valid_b.narrow(1, t - 1, 1)?.squeeze(1)?;
        let both = (last_a * last_b)?.to_vec1::<u8>()?;
        let rows: Vec<u32> =
            both.iter().enumerate().filter(|(_, &v)| v != 0).map(|(i, _)| i as u32).collect();
        if rows.is_empty() {
            return Ok(None);
        }
        let row_indices = Tensor::from_vec(rows.clone(), rows.len(), &self.device)?;

        let za = self.project_last_step(&rep_a, &row_indices)?;
        let zb = self.project_last_step(&rep_b, &row_indices)?;

        let loss_out = self.setup.loss.forward(&za, &zb)?;
        let grads = loss_out.total.backward()?;

        // clip-by-global-norm folded into the step size
        let base_lr = self.optimizer.learning_rate();
        if self.spec.clip_norm > 0.0 {
            let mut sq_sum = 0f64;
            for var in self.encoder_map.all_vars().iter().chain(self.projector_map.all_vars().iter())
            {
                if let Some(grad) = grads.get(var) {
                    sq_sum += grad
                        .to_dtype(DType::F32)?
                        .sqr()?
                        .sum_all()?
                        .to_scalar::<f32>()? as f64;
                }
            }
            let norm = sq_sum.sqrt();
            if norm > self.spec.clip_norm {
                self.optimizer.set_learning_rate(base_lr * self.spec.clip_norm / norm);
            }
        }
        self.optimizer.step(&grads)?;
        self.optimizer.set_learning_rate(base_lr);

        if self.scheduler.mode() == SchedulerMode::PerBatch {
            let lr = self.scheduler.step();
            self.optimizer.set_learning_rate(lr);
        }

        self.step_count += 1;
        if self.spec.optimizer_threshold_reset > 0
            && self.step_count % self.spec.optimizer_threshold_reset as u64 == 0
        {
            self.optimizer.reset_state();
        }
        if self.spec.swa_start_iter >= 0 && self.step_count as i64 >= self.spec.swa_start_iter {
            self.swa_state.update(&self.encoder_map, &self.swa_map)?;
        }

        Ok(Some(StepStats {
            loss: loss_out.total.to_dtype(DType::F32)?.to_scalar::<f32>()? as f64,
            invariance: loss_out.invariance,
            variance: loss_out.variance,
            covariance: loss_out.covariance,
            lr: self.optimizer.learning_rate(),
            valid_rows: rows.len(),
        }))
    }

    /// Epoch boundary: advance per-epoch schedulers. Metric-gated
    /// schedulers step only when a metric arrived from a sink.
    pub fn end_epoch(&mut self, metric: Option<f64>) {
        let lr = match (self.scheduler.mode(), metric) {
            (SchedulerMode::PerEpoch, _) => Some(self.scheduler.step()),
            (SchedulerMode::PerEpochWithMetric, Some(m)) => Some(self.scheduler.step_metric(m)),
            (SchedulerMode::PerEpochWithMetric, None) => None,
            (SchedulerMode::PerBatch, _) => None,
        };
        if let Some(lr) = lr {
            self.optimizer.set_learning_rate(lr);
        }
    }

    /// Encode a batch without optimization. `use_swa` routes through the
    /// averaged encoder.
    pub fn encode(
        &self,
        data: &Tensor,
        mask: &Tensor,
        use_swa: bool,
    ) -> LearnResult<(Tensor, Tensor)> {
        self.check_batch(data, mask)?;
        let data = data.to_dtype(self.spec.dtype)?;
        let encoder = if use_swa { &self.swa_encoder } else { &self.encoder };
        let (rep, valid) = encoder.forward(&data, mask)?;
        Ok((rep.detach(), valid))
    }

    /// Encode and project the last timestep.
    pub fn encode_projected(
        &self,
        data: &Tensor,
        mask: &Tensor,
        use_swa: bool,
    ) -> LearnResult<Tensor> {
        let (rep, _valid) = self.encode(data, mask, use_swa)?;
        let last = rep.narrow(1, self.spec.t - 1, 1)?.squeeze(1)?;
        Ok(self.projector.forward(&last, false)?.detach())
    }

    // ---- checkpointing ----------------------------------------------------

    fn collect_prefixed(map: &VarMap, prefix: &str, out: &mut HashMap<String, Tensor>) {
        let vars = map.data().lock().expect("varmap poisoned");
        for (key, var) in vars.iter() {
            out.insert(format!("{prefix}.{key}"), var.as_tensor().clone());
        }
    }

    fn meta_i64(value: i64, device: &Device) -> LearnResult<Tensor> {
        Ok(Tensor::new(&[value], device)?)
    }

    fn meta_str(value: &str, device: &Device) -> LearnResult<Tensor> {
        let bytes = value.as_bytes().to_vec();
        Ok(Tensor::from_vec(bytes, value.len(), device)?)
    }

    /// Persist the whole model into one safetensors archive. The write is
    /// atomic: a temporary file is renamed over the target.
    pub fn save(&self, path: &Path) -> LearnResult<()> {
        let cpu = Device::Cpu;
        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        Self::collect_prefixed(&self.encoder_map, "encoder_base", &mut tensors);
        Self::collect_prefixed(&self.swa_map, "encoder_swa", &mut tensors);
        Self::collect_prefixed(&self.projector_map, "projector", &mut tensors);
        for (key, tensor) in self.optimizer.state_tensors()? {
            tensors.insert(format!("adamw.{key}"), tensor);
        }

        let spec = &self.spec;
        tensors.insert("meta/C".into(), Self::meta_i64(spec.c as i64, &cpu)?);
        tensors.insert("meta/T".into(), Self::meta_i64(spec.t as i64, &cpu)?);
        tensors.insert("meta/D".into(), Self::meta_i64(spec.d as i64, &cpu)?);
        tensors.insert(
            "meta/encoding_dims".into(),
            Self::meta_i64(spec.encoding_dims as i64, &cpu)?,
        );
        tensors.insert(
            "meta/channel_expansion_dim".into(),
            Self::meta_i64(spec.channel_expansion_dim as i64, &cpu)?,
        );
        tensors.insert(
            "meta/fused_feature_dim".into(),
            Self::meta_i64(spec.fused_feature_dim as i64, &cpu)?,
        );
        tensors.insert(
            "meta/encoder_hidden_dims".into(),
            Self::meta_i64(spec.encoder_hidden_dims as i64, &cpu)?,
        );
        tensors.insert(
            "meta/encoder_depth".into(),
            Self::meta_i64(spec.encoder_depth as i64, &cpu)?,
        );
        tensors.insert(
            "meta/optimizer_threshold_reset".into(),
            Self::meta_i64(spec.optimizer_threshold_reset, &cpu)?,
        );
        tensors.insert(
            "meta/enable_buffer_averaging".into(),
            Self::meta_i64(i64::from(spec.enable_buffer_averaging), &cpu)?,
        );
        tensors.insert(
            "meta/projector_mlp_spec".into(),
            Self::meta_str(&spec.projector_mlp_spec, &cpu)?,
        );
        tensors.insert("meta/dtype".into(), Self::meta_str(dtype_tag(spec.dtype), &cpu)?);
        tensors.insert("meta/device".into(), Self::meta_str("cpu", &cpu)?);
        tensors.insert(
            "meta/jk/component_name".into(),
            Self::meta_str(&spec.component_name, &cpu)?,
        );

        let tmp = path.with_extension("tmp");
        candle_core::safetensors::save(&tensors, &tmp)
            .map_err(|e| LearnError::checkpoint(path.display().to_string(), e.to_string()))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| LearnError::checkpoint(path.display().to_string(), e.to_string()))?;
        info!(path = %path.display(), "vicreg checkpoint saved");
        Ok(())
    }

    fn assign_prefixed(
        map: &VarMap,
        prefix: &str,
        tensors: &HashMap<String, Tensor>,
        path: &Path,
    ) -> LearnResult<()> {
        let vars = map.data().lock().expect("varmap poisoned");
        for (key, var) in vars.iter() {
            let archive_key = format!("{prefix}.{key}");
            let loaded = tensors.get(&archive_key).ok_or_else(|| {
                LearnError::checkpoint(
                    path.display().to_string(),
                    format!("missing checkpoint key: '{archive_key}'"),
                )
            })?;
            if loaded.dims() != var.as_tensor().dims() {
                return Err(LearnError::checkpoint(
                    path.display().to_string(),
                    format!(
                        "shape mismatch for '{archive_key}': checkpoint {:?} vs model {:?}",
                        loaded.dims(),
                        var.as_tensor().dims()
                    ),
                ));
            }
            var.set(&loaded.to_dtype(var.as_tensor().dtype())?)?;
        }
        Ok(())
    }

    fn read_meta_i64(
        tensors: &HashMap<String, Tensor>,
        key: &str,
        path: &Path,
    ) -> LearnResult<i64> {
        let tensor = tensors.get(key).ok_or_else(|| {
            LearnError::checkpoint(
                path.display().to_string(),
                format!("missing checkpoint meta key: '{key}'"),
            )
        })?;
        Ok(tensor.to_dtype(DType::I64)?.flatten_all()?.to_vec1::<i64>()?[0])
    }

    fn read_meta_str(
        tensors: &HashMap<String, Tensor>,
        key: &str,
        path: &Path,
    ) -> LearnResult<String> {
        let tensor = tensors.get(key).ok_or_else(|| {
            LearnError::checkpoint(
                path.display().to_string(),
                format!("missing checkpoint meta key: '{key}'"),
            )
        })?;
        let bytes = tensor.flatten_all()?.to_vec1::<u8>()?;
        String::from_utf8(bytes).map_err(|_| {
            LearnError::checkpoint(
                path.display().to_string(),
                format!("meta key '{key}' holds invalid utf-8"),
            )
        })
    }

    /// Rebuild a model from an archive. The setup supplies the builders;
    /// constructor-relevant geometry comes from the archive meta. An
    /// incompatible optimizer state degrades to a warning.
    pub fn load(
        path: &Path,
        setup: Arc<TrainingSetup>,
        device: Device,
        training: bool,
    ) -> LearnResult<Self> {
        let tensors = candle_core::safetensors::load(path, &Device::Cpu)
            .map_err(|e| LearnError::checkpoint(path.display().to_string(), e.to_string()))?;

        let component_name = Self::read_meta_str(&tensors, "meta/jk/component_name", path)?;
        if component_name.is_empty() {
            return Err(LearnError::checkpoint(
                path.display().to_string(),
                "saved component name is empty",
            ));
        }
        let dtype = dtype_from_tag(&Self::read_meta_str(&tensors, "meta/dtype", path)?)?;

        let spec = VicregSpec {
            component_name,
            c: Self::read_meta_i64(&tensors, "meta/C", path)? as usize,
            t: Self::read_meta_i64(&tensors, "meta/T", path)? as usize,
            d: Self::read_meta_i64(&tensors, "meta/D", path)? as usize,
            encoding_dims: Self::read_meta_i64(&tensors, "meta/encoding_dims", path)? as usize,
            channel_expansion_dim: Self::read_meta_i64(&tensors, "meta/channel_expansion_dim", path)?
                as usize,
            fused_feature_dim: Self::read_meta_i64(&tensors, "meta/fused_feature_dim", path)?
                as usize,
            encoder_hidden_dims: Self::read_meta_i64(&tensors, "meta/encoder_hidden_dims", path)?
                as usize,
            encoder_depth: Self::read_meta_i64(&tensors, "meta/encoder_depth", path)? as usize,
            projector_mlp_spec: Self::read_meta_str(&tensors, "meta/projector_mlp_spec", path)?,
            projector: ProjectorOptions {
                norm: NormKind::parse(&setup.param_str("projector_norm")?)?,
                activation: ActKind::parse(&setup.param_str("projector_activation")?)?,
                hidden_bias: setup.param_bool("projector_hidden_bias")?,
                last_bias: setup.param_bool("projector_last_bias")?,
                bn_in_fp32: setup.param_bool("projector_bn_in_fp32")?,
            },
            dtype,
            optimizer_threshold_reset: Self::read_meta_i64(
                &tensors,
                "meta/optimizer_threshold_reset",
                path,
            )?,
            enable_buffer_averaging: Self::read_meta_i64(
                &tensors,
                "meta/enable_buffer_averaging",
                path,
            )? != 0,
            swa_start_iter: setup.param_i64("swa_start_iter")?,
            seed: setup.seed()?,
            clip_norm: setup.clip_norm()?,
        };

        let mut model = Self::instantiate(spec, setup, device, training)?;
        Self::assign_prefixed(&model.encoder_map, "encoder_base", &tensors, path)?;
        Self::assign_prefixed(&model.swa_map, "encoder_swa", &tensors, path)?;
        Self::assign_prefixed(&model.projector_map, "projector", &tensors, path)?;

        let optimizer_state: HashMap<String, Tensor> = tensors
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix("adamw.").map(|rest| (rest.to_string(), v.clone()))
            })
            .collect();
        if let Err(e) = model.optimizer.load_state_tensors(&optimizer_state) {
            warn!(error = %e, "optimizer state missing/incompatible; continuing without it");
        }

        info!(path = %path.display(), "vicreg checkpoint loaded");
        Ok(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setup::SetupRegistry;
    use tsiboard_dsl::jkspec;

    const SPEC_TEXT: &str = r#"
        JKSPEC 2.0
        COMPONENT "tsi.wikimyei.representation.vicreg" "VICReg_representation" {
          PROFILE "base" {
            OPTIMIZER "AdamW" {
              initial_learning_rate: 0.01
              beta1: 0.9
              beta2: 0.999
              eps: 1e-8
              weight_decay: 0.0
            }
            LR_SCHEDULER "ConstantLR" { lr: 0 }
            LOSS "VicReg" { sim_coeff: 25.0 std_coeff: 25.0 cov_coeff: 1.0 }
            COMPONENT_PARAMS {
              encoding_dims: 12
              channel_expansion_dim: 6
              fused_feature_dim: 8
              encoder_hidden_dims: 8
              encoder_depth: 2
              projector_mlp_spec: "16-12"
              projector_norm: "None"
              projector_activation: "ReLU"
              projector_hidden_bias: true
              projector_last_bias: true
              projector_bn_in_fp32: false
              optimizer_threshold_reset: 0
              enable_buffer_averaging: false
              swa_start_iter: 2
            }
            REPRODUCIBILITY { seed: 42 workers: 1 deterministic: true }
            NUMERICS { dtype: "f32" device: "cpu" }
            GRADIENT { clip_norm: 5.0 accumulation_steps: 1 }
            CHECKPOINT { directory: "/tmp/x" every_n_epochs: 1 keep_last: 1 }
            METRICS { log_every_n_batches: 1 enable_loss_breakdown: true }
            DATA_REF { dataset_key: "BTCUSDT" }
          }
          ACTIVE_PROFILE: "base"
        }
    "#;

    fn make_model() -> Vicreg4D {
        let specs = jkspec::decode(SPEC_TEXT).unwrap();
        let registry = SetupRegistry::new();
        let setup = registry.setup("hash", "VICReg_representation@c.enc", &specs).unwrap();
        let spec =
            VicregSpec::from_setup("VICReg_representation@c.enc", 2, 8, 3, setup.as_ref()).unwrap();
        Vicreg4D::instantiate(spec, setup, Device::Cpu, true).unwrap()
    }

    fn batch(device: &Device) -> (Tensor, Tensor) {
        let data = Tensor::randn(0f32, 1f32, (4, 2, 8, 3), device).unwrap();
        let mask = Tensor::ones((4, 2, 8), DType::U8, device).unwrap();
        (data, mask)
    }

    #[test]
    fn train_step_returns_finite_loss_and_advances_swa() {
        let mut model = make_model();
        let (data, mask) = batch(&Device::Cpu);
        let mut last = None;
        for _ in 0..3 {
            last = model.train_step(&data, &mask).unwrap();
        }
        let stats = last.unwrap();
        assert!(stats.loss.is_finite());
        assert_eq!(stats.valid_rows, 4);
        assert_eq!(model.step_count(), 3);
    }

    #[test]
    fn encode_shapes() {
        let model = make_model();
        let (data, mask) = batch(&Device::Cpu);
        let (rep, valid) = model.encode(&data, &mask, false).unwrap();
        assert_eq!(rep.dims(), &[4, 8, 12]);
        assert_eq!(valid.dims(), &[4, 8]);
        let projected = model.encode_projected(&data, &mask, true).unwrap();
        assert_eq!(projected.dims(), &[4, 12]);
    }

    #[test]
    fn save_load_round_trip_preserves_encoding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vicreg.safetensors");
        let mut model = make_model();
        let (data, mask) = batch(&Device::Cpu);
        model.train_step(&data, &mask).unwrap();
        model.save(&path).unwrap();

        let specs = jkspec::decode(SPEC_TEXT).unwrap();
        let registry = SetupRegistry::new();
        let setup = registry.setup("hash", "VICReg_representation@c.enc", &specs).unwrap();
        let restored = Vicreg4D::load(&path, setup, Device::Cpu, false).unwrap();
        assert_eq!(restored.spec().c, 2);
        assert_eq!(restored.spec().t, 8);
        assert_eq!(restored.spec().d, 3);

        let (a, _) = model.encode(&data, &mask, false).unwrap();
        let (b, _) = restored.encode(&data, &mask, false).unwrap();
        let a: Vec<f32> = a.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = b.flatten_all().unwrap().to_vec1().unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn train_step_requires_training_mode() {
        let specs = jkspec::decode(SPEC_TEXT).unwrap();
        let registry = SetupRegistry::new();
        let setup = registry.setup("hash", "VICReg_representation@c.enc", &specs).unwrap();
        let spec =
            VicregSpec::from_setup("VICReg_representation@c.enc", 2, 8, 3, setup.as_ref()).unwrap();
        let mut model = Vicreg4D::instantiate(spec, setup, Device::Cpu, false).unwrap();
        let (data, mask) = batch(&Device::Cpu);
        assert!(model.train_step(&data, &mask).is_err());
    }

    #[test]
    fn all_masked_batch_is_skipped() {
        let mut model = make_model();
        let data = Tensor::randn(0f32, 1f32, (2, 2, 8, 3), &Device::Cpu).unwrap();
        let mask = Tensor::zeros((2, 2, 8), DType::U8, &Device::Cpu).unwrap();
        let stats = model.train_step(&data, &mask).unwrap();
        assert!(stats.is_none());
    }
}
