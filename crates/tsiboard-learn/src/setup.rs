//! Training setup: the optimizer/scheduler/loss triple plus profile rows,
//! resolved once per `(contract, component)` and cached.
//!
//! A wave may re-parameterize a component through the override channel:
//! the board builder registers `(runtime_name → lookup_name, profile_id)`
//! while it wires the circuit, and the first `setup()` call for that
//! runtime name builds from the overridden profile instead of the active
//! one. The registry is contract-scoped state owned by the runtime
//! context; nothing here is process-global.

use crate::augment::{presets_from_table, WarpPreset};
use crate::error::{LearnError, LearnResult};
use crate::loss::{make_loss, LossAny};
use crate::optim::{make_optimizer_builder, OptimizerBuilder};
use crate::sched::{make_scheduler_builder, SchedulerBuilder};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tsiboard_dsl::jkspec::{tables, JkSpecs, Row};

/// Resolved training configuration for one component profile.
pub struct TrainingSetup {
    pub component_name: String,
    pub profile_name: String,
    /// `<component>@<profile>` row id into the family tables.
    pub profile_row_id: String,
    pub optimizer_builder: Box<dyn OptimizerBuilder>,
    pub scheduler_builder: Box<dyn SchedulerBuilder>,
    pub loss: Box<dyn LossAny>,
    pub augmentation_presets: Vec<WarpPreset>,
    pub profile_row: Row,
    pub reproducibility_row: Row,
    pub numerics_row: Row,
    pub gradient_row: Row,
    pub checkpoint_row: Row,
    pub metrics_row: Row,
}

impl TrainingSetup {
    /// Build from the decoded spec tables. `profile_override` selects a
    /// non-active profile (wave PROFILE_ID); `None` follows ACTIVE_PROFILE.
    pub fn from_specs(
        specs: &JkSpecs,
        component_name: &str,
        profile_override: Option<&str>,
    ) -> LearnResult<Self> {
        let component_row = specs.row("components_table", component_name)?;
        let active_profile = tables::require_column(component_row, "active_profile")?;
        let profile_name = profile_override.unwrap_or(active_profile.as_str()).to_string();
        let profile_row_id = format!("{component_name}@{profile_name}");

        let profile_row = specs.row("component_profiles_table", &profile_row_id)?.clone();
        let optimizer_ref = tables::require_column(&profile_row, "optimizer")?;
        let scheduler_ref = tables::require_column(&profile_row, "lr_scheduler")?;
        let loss_ref = tables::require_column(&profile_row, "loss_function")?;

        let optimizer_builder =
            make_optimizer_builder(specs.row("optimizers_table", &optimizer_ref)?)?;
        let scheduler_builder =
            make_scheduler_builder(specs.row("lr_schedulers_table", &scheduler_ref)?)?;
        let loss = make_loss(specs.row("loss_functions_table", &loss_ref)?)?;

        let augmentation_presets = match profile_row.get("augmentation_set") {
            Some(set_name) if !set_name.is_empty() => {
                let table = specs.table("vicreg_augmentations")?;
                let rows: Vec<Row> = table
                    .iter()
                    .filter(|r| r.get("augmentation_set") == Some(set_name))
                    .cloned()
                    .collect();
                if rows.is_empty() {
                    return Err(LearnError::config(format!(
                        "profile '{profile_name}' references augmentation set '{set_name}' \
                         with no materialized rows"
                    )));
                }
                presets_from_table(&rows)?
            }
            _ => Vec::new(),
        };

        Ok(TrainingSetup {
            component_name: component_name.to_string(),
            profile_name,
            reproducibility_row: specs
                .row("component_reproducibility_table", &profile_row_id)?
                .clone(),
            numerics_row: specs.row("component_numerics_table", &profile_row_id)?.clone(),
            gradient_row: specs.row("component_gradient_table", &profile_row_id)?.clone(),
            checkpoint_row: specs.row("component_checkpoint_table", &profile_row_id)?.clone(),
            metrics_row: specs.row("component_metrics_table", &profile_row_id)?.clone(),
            profile_row_id,
            optimizer_builder,
            scheduler_builder,
            loss,
            augmentation_presets,
            profile_row,
        })
    }

    pub fn param_i64(&self, key: &str) -> LearnResult<i64> {
        Ok(tables::to_i64(&tables::require_column(&self.profile_row, key)?)?)
    }

    pub fn param_bool(&self, key: &str) -> LearnResult<bool> {
        Ok(tables::to_bool(&tables::require_column(&self.profile_row, key)?)?)
    }

    pub fn param_str(&self, key: &str) -> LearnResult<String> {
        Ok(tables::require_column(&self.profile_row, key)?)
    }

    pub fn seed(&self) -> LearnResult<u64> {
        let seed = tables::to_i64(&tables::require_column(&self.reproducibility_row, "seed")?)?;
        Ok(seed as u64)
    }

    pub fn dtype_tag(&self) -> LearnResult<String> {
        Ok(tables::require_column(&self.numerics_row, "dtype")?)
    }

    pub fn clip_norm(&self) -> LearnResult<f64> {
        Ok(tables::to_f64(&tables::require_column(&self.gradient_row, "clip_norm")?)?)
    }
}

/// Profile re-parameterization registered by the board builder.
#[derive(Debug, Clone)]
struct SetupOverride {
    lookup_name: String,
    profile_id: Option<String>,
}

/// Cache of training setups keyed `(contract_hash, runtime_component_name)`.
#[derive(Default)]
pub struct SetupRegistry {
    setups: Mutex<HashMap<(String, String), Arc<TrainingSetup>>>,
    overrides: Mutex<HashMap<(String, String), SetupOverride>>,
}

impl SetupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a wave-time override for `runtime_name`.
    pub fn set_component_override(
        &self,
        contract_hash: &str,
        runtime_name: &str,
        lookup_name: &str,
        profile_id: Option<String>,
    ) {
        self.overrides.lock().expect("setup registry poisoned").insert(
            (contract_hash.to_string(), runtime_name.to_string()),
            SetupOverride { lookup_name: lookup_name.to_string(), profile_id },
        );
    }

    /// Resolve (and cache) the setup for a runtime component name. Without
    /// an override the lookup name is the runtime name's base (everything
    /// before the first `@`).
    pub fn setup(
        &self,
        contract_hash: &str,
        runtime_name: &str,
        specs: &JkSpecs,
    ) -> LearnResult<Arc<TrainingSetup>> {
        let key = (contract_hash.to_string(), runtime_name.to_string());
        if let Some(found) = self.setups.lock().expect("setup registry poisoned").get(&key) {
            return Ok(found.clone());
        }

        let override_entry =
            self.overrides.lock().expect("setup registry poisoned").get(&key).cloned();
        let (lookup_name, profile_id) = match override_entry {
            Some(o) => (o.lookup_name, o.profile_id),
            None => (
                runtime_name.split('@').next().unwrap_or(runtime_name).to_string(),
                None,
            ),
        };

        let setup =
            Arc::new(TrainingSetup::from_specs(specs, &lookup_name, profile_id.as_deref())?);
        self.setups.lock().expect("setup registry poisoned").insert(key, setup.clone());
        Ok(setup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tsiboard_dsl::jkspec;

    const SPEC: &str = r#"
        JKSPEC 2.0
        COMPONENT "tsi.wikimyei.representation.vicreg" "VICReg_representation" {
          PROFILE "baseline" {
            OPTIMIZER "AdamW" {
              initial_learning_rate: 0.001
              beta1: 0.9
              beta2: 0.999
              eps: 1e-8
              weight_decay: 0.01
            }
            LR_SCHEDULER "StepLR" { step_size: 2 gamma: 0.5 }
            LOSS "VicReg" { sim_coeff: 25.0 std_coeff: 25.0 cov_coeff: 1.0 }
            COMPONENT_PARAMS {
              encoding_dims: 16
              channel_expansion_dim: 8
              fused_feature_dim: 8
              encoder_hidden_dims: 8
              encoder_depth: 1
              projector_mlp_spec: "16-16"
              projector_norm: "None"
              projector_activation: "ReLU"
              projector_hidden_bias: true
              projector_last_bias: true
              projector_bn_in_fp32: false
              optimizer_threshold_reset: 0
              enable_buffer_averaging: false
              swa_start_iter: 4
              augmentation_set: "warps"
            }
            REPRODUCIBILITY { seed: 42 workers: 1 deterministic: true }
            NUMERICS { dtype: "f32" device: "cpu" }
            GRADIENT { clip_norm: 1.0 accumulation_steps: 1 }
            CHECKPOINT { directory: "/tmp/x" every_n_epochs: 1 keep_last: 1 }
            METRICS { log_every_n_batches: 1 enable_loss_breakdown: true }
            DATA_REF { dataset_key: "BTCUSDT" }
          }
          PROFILE "hot" {
            OPTIMIZER "SGD" {
              initial_learning_rate: 0.1
              momentum: 0.0
              dampening: 0.0
              weight_decay: 0.0
              nesterov: false
            }
            LR_SCHEDULER "ConstantLR" { lr: 0 }
            LOSS "VicReg" { sim_coeff: 1.0 std_coeff: 1.0 cov_coeff: 1.0 }
            COMPONENT_PARAMS {
              encoding_dims: 16
              channel_expansion_dim: 8
              fused_feature_dim: 8
              encoder_hidden_dims: 8
              encoder_depth: 1
              projector_mlp_spec: "16-16"
              projector_norm: "None"
              projector_activation: "ReLU"
              projector_hidden_bias: true
              projector_last_bias: true
              projector_bn_in_fp32: false
              optimizer_threshold_reset: 0
              enable_buffer_averaging: false
              swa_start_iter: 4
              augmentation_set: "warps"
            }
            REPRODUCIBILITY { seed: 7 workers: 1 deterministic: true }
            NUMERICS { dtype: "f32" device: "cpu" }
            GRADIENT { clip_norm: 1.0 accumulation_steps: 1 }
            CHECKPOINT { directory: "/tmp/x" every_n_epochs: 1 keep_last: 1 }
            METRICS { log_every_n_batches: 1 enable_loss_breakdown: true }
            DATA_REF { dataset_key: "BTCUSDT" }
          }
          AUGMENTATIONS "warps" {
            CURVE "Linear" {
              kind: "Linear"
              curve_param: 0.0
              noise_scale: 0.02
              smoothing_kernel_size: 3
              point_drop_prob: 0.0
              value_jitter_std: 0.0
              time_mask_band_frac: 0.0
              channel_dropout_prob: 0.0
            }
          }
          ACTIVE_PROFILE: "baseline"
        }
    "#;

    #[test]
    fn builds_active_profile_setup() {
        let specs = jkspec::decode(SPEC).unwrap();
        let setup = TrainingSetup::from_specs(&specs, "VICReg_representation", None).unwrap();
        assert_eq!(setup.profile_name, "baseline");
        assert_eq!(setup.optimizer_builder.type_name(), "AdamW");
        assert_eq!(setup.scheduler_builder.type_name(), "StepLR");
        assert_eq!(setup.loss.type_name(), "VicReg");
        assert_eq!(setup.augmentation_presets.len(), 1);
        assert_eq!(setup.seed().unwrap(), 42);
        assert_eq!(setup.param_i64("encoding_dims").unwrap(), 16);
    }

    #[test]
    fn override_channel_selects_profile() {
        let specs = jkspec::decode(SPEC).unwrap();
        let registry = SetupRegistry::new();
        let runtime_name = "VICReg_representation@circuit.enc";
        registry.set_component_override(
            "hash",
            runtime_name,
            "VICReg_representation",
            Some("hot".to_string()),
        );
        let setup = registry.setup("hash", runtime_name, &specs).unwrap();
        assert_eq!(setup.profile_name, "hot");
        assert_eq!(setup.optimizer_builder.type_name(), "SGD");
        // cached: same Arc on second resolution
        let again = registry.setup("hash", runtime_name, &specs).unwrap();
        assert!(Arc::ptr_eq(&setup, &again));
    }

    #[test]
    fn default_lookup_strips_runtime_suffix() {
        let specs = jkspec::decode(SPEC).unwrap();
        let registry = SetupRegistry::new();
        let setup =
            registry.setup("hash", "VICReg_representation@circuit.enc", &specs).unwrap();
        assert_eq!(setup.component_name, "VICReg_representation");
        assert_eq!(setup.profile_name, "baseline");
    }

    #[test]
    fn unknown_profile_fails() {
        let specs = jkspec::decode(SPEC).unwrap();
        assert!(TrainingSetup::from_specs(&specs, "VICReg_representation", Some("ghost")).is_err());
        assert!(TrainingSetup::from_specs(&specs, "Nope", None).is_err());
    }
}
