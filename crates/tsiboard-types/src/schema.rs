//! JKSPEC schema catalog.
//!
//! Every kv-block in a training spec has an *owner* (`optimizer.Adam`,
//! `scheduler.StepLR`, `loss.VicReg`, `component.<Kind>`, one of the
//! per-profile family owners, or `augmentation.curve`). The catalog maps
//! each owner to its typed key set; the decoder rejects unknown keys, kind
//! mismatches and missing required keys against it. Adding a new optimizer,
//! scheduler or loss means adding rows here and a builder in
//! tsiboard-learn, nothing else.

use crate::registry::TsiDomain;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

/// Value kinds a schema key may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    Bool,
    Int,
    Float,
    String,
    IntList,
    FloatList,
    StringList,
}

impl ValueKind {
    pub fn name(self) -> &'static str {
        match self {
            ValueKind::Bool => "Bool",
            ValueKind::Int => "Int",
            ValueKind::Float => "Float",
            ValueKind::String => "String",
            ValueKind::IntList => "IntList",
            ValueKind::FloatList => "FloatList",
            ValueKind::StringList => "StringList",
        }
    }

    /// Kind check on the raw (already CSV-flattened) value text.
    pub fn matches(self, raw: &str) -> bool {
        let value = raw.trim();
        match self {
            ValueKind::Bool => {
                let low = value.to_ascii_lowercase();
                low == "true" || low == "false"
            }
            ValueKind::Int => value.parse::<i64>().is_ok(),
            ValueKind::Float => value.parse::<f64>().map(|v| v.is_finite()).unwrap_or(false),
            ValueKind::String => true,
            ValueKind::IntList => {
                split_csv(value).is_some_and(|items| {
                    !items.is_empty() && items.iter().all(|i| i.parse::<i64>().is_ok())
                })
            }
            ValueKind::FloatList => split_csv(value).is_some_and(|items| {
                !items.is_empty()
                    && items
                        .iter()
                        .all(|i| i.parse::<f64>().map(|v| v.is_finite()).unwrap_or(false))
            }),
            ValueKind::StringList => split_csv(value).is_some_and(|items| !items.is_empty()),
        }
    }
}

/// CSV split that rejects empty elements (`"1,,2"` is malformed).
fn split_csv(raw: &str) -> Option<Vec<&str>> {
    if raw.is_empty() {
        return None;
    }
    let mut out = Vec::new();
    for item in raw.split(',') {
        let item = item.trim();
        if item.is_empty() {
            return None;
        }
        out.push(item);
    }
    Some(out)
}

/// One typed key of an owner.
#[derive(Debug, Clone, Copy)]
pub struct ParamDesc {
    pub owner: &'static str,
    pub key: &'static str,
    pub kind: ValueKind,
    pub required: bool,
}

const fn p(owner: &'static str, key: &'static str, kind: ValueKind, required: bool) -> ParamDesc {
    ParamDesc { owner, key, kind, required }
}

use ValueKind::{Bool, Float, Int, IntList, String as Str};

/// Flat table of every `(owner, key)` the training DSL accepts.
pub static TYPED_PARAMS: &[ParamDesc] = &[
    // ---- optimizers ----
    p("optimizer.SGD", "initial_learning_rate", Float, true),
    p("optimizer.SGD", "momentum", Float, true),
    p("optimizer.SGD", "dampening", Float, true),
    p("optimizer.SGD", "weight_decay", Float, true),
    p("optimizer.SGD", "nesterov", Bool, true),
    p("optimizer.Adam", "initial_learning_rate", Float, true),
    p("optimizer.Adam", "beta1", Float, true),
    p("optimizer.Adam", "beta2", Float, true),
    p("optimizer.Adam", "eps", Float, true),
    p("optimizer.Adam", "weight_decay", Float, true),
    p("optimizer.Adam", "amsgrad", Bool, true),
    p("optimizer.AdamW", "initial_learning_rate", Float, true),
    p("optimizer.AdamW", "beta1", Float, true),
    p("optimizer.AdamW", "beta2", Float, true),
    p("optimizer.AdamW", "eps", Float, true),
    p("optimizer.AdamW", "weight_decay", Float, true),
    p("optimizer.RMSprop", "initial_learning_rate", Float, true),
    p("optimizer.RMSprop", "alpha", Float, true),
    p("optimizer.RMSprop", "eps", Float, true),
    p("optimizer.RMSprop", "weight_decay", Float, true),
    p("optimizer.RMSprop", "momentum", Float, true),
    p("optimizer.RMSprop", "centered", Bool, true),
    p("optimizer.Adagrad", "initial_learning_rate", Float, true),
    p("optimizer.Adagrad", "lr_decay", Float, true),
    p("optimizer.Adagrad", "weight_decay", Float, true),
    p("optimizer.Adagrad", "eps", Float, true),
    // ---- schedulers ----
    p("scheduler.ConstantLR", "lr", Float, true),
    p("scheduler.StepLR", "step_size", Int, true),
    p("scheduler.StepLR", "gamma", Float, true),
    p("scheduler.MultiStepLR", "milestones", IntList, true),
    p("scheduler.MultiStepLR", "gamma", Float, true),
    p("scheduler.ExponentialLR", "gamma", Float, true),
    p("scheduler.ReduceLROnPlateau", "mode", Str, true),
    p("scheduler.ReduceLROnPlateau", "factor", Float, true),
    p("scheduler.ReduceLROnPlateau", "patience", Int, true),
    p("scheduler.ReduceLROnPlateau", "threshold", Float, true),
    p("scheduler.ReduceLROnPlateau", "threshold_mode", Str, true),
    p("scheduler.ReduceLROnPlateau", "cooldown", Int, true),
    p("scheduler.ReduceLROnPlateau", "min_lr", Float, true),
    p("scheduler.ReduceLROnPlateau", "eps", Float, true),
    p("scheduler.OneCycleLR", "max_lr", Float, true),
    p("scheduler.OneCycleLR", "total_steps", Int, true),
    p("scheduler.CosineAnnealingLR", "T_max", Int, true),
    p("scheduler.CosineAnnealingLR", "eta_min", Float, true),
    p("scheduler.WarmupLR", "warmup_steps", Int, true),
    p("scheduler.WarmupLR", "start_factor", Float, true),
    p("scheduler.WarmupLR", "end_factor", Float, true),
    // ---- losses ----
    p("loss.VicReg", "sim_coeff", Float, true),
    p("loss.VicReg", "std_coeff", Float, true),
    p("loss.VicReg", "cov_coeff", Float, true),
    p("loss.MeanSquaredError", "reduction", Str, true),
    p("loss.CrossEntropy", "reduction", Str, true),
    p("loss.CrossEntropy", "label_smoothing", Float, true),
    // ---- component params ----
    p("component.VicregRepresentation", "encoding_dims", Int, true),
    p("component.VicregRepresentation", "channel_expansion_dim", Int, true),
    p("component.VicregRepresentation", "fused_feature_dim", Int, true),
    p("component.VicregRepresentation", "encoder_hidden_dims", Int, true),
    p("component.VicregRepresentation", "encoder_depth", Int, true),
    p("component.VicregRepresentation", "projector_mlp_spec", Str, true),
    p("component.VicregRepresentation", "projector_norm", Str, true),
    p("component.VicregRepresentation", "projector_activation", Str, true),
    p("component.VicregRepresentation", "projector_hidden_bias", Bool, true),
    p("component.VicregRepresentation", "projector_last_bias", Bool, true),
    p("component.VicregRepresentation", "projector_bn_in_fp32", Bool, true),
    p("component.VicregRepresentation", "optimizer_threshold_reset", Int, true),
    p("component.VicregRepresentation", "enable_buffer_averaging", Bool, true),
    p("component.VicregRepresentation", "swa_start_iter", Int, true),
    p("component.VicregRepresentation", "augmentation_set", Str, false),
    p("component.VicregRepresentation", "vicreg_train", Bool, false),
    p("component.VicregRepresentation", "vicreg_use_swa", Bool, false),
    p("component.VicregRepresentation", "vicreg_detach_to_cpu", Bool, false),
    p("component.SourceDataloader", "prefetch_batches", Int, false),
    p("component.SinkNull", "comment", Str, false),
    p("component.SinkLogSys", "comment", Str, false),
    // ---- per-profile families ----
    p("reproducibility", "seed", Int, true),
    p("reproducibility", "workers", Int, true),
    p("reproducibility", "deterministic", Bool, true),
    p("numerics", "dtype", Str, true),
    p("numerics", "device", Str, true),
    p("numerics", "matmul_precision", Str, false),
    p("gradient", "clip_norm", Float, true),
    p("gradient", "accumulation_steps", Int, true),
    p("checkpoint", "directory", Str, true),
    p("checkpoint", "every_n_epochs", Int, true),
    p("checkpoint", "keep_last", Int, true),
    p("metrics", "log_every_n_batches", Int, true),
    p("metrics", "enable_loss_breakdown", Bool, true),
    p("data_ref", "dataset_key", Str, true),
    p("data_ref", "sampler", Str, false),
    // ---- augmentation curve rows ----
    p("augmentation.curve", "kind", Str, true),
    p("augmentation.curve", "curve_param", Float, true),
    p("augmentation.curve", "noise_scale", Float, true),
    p("augmentation.curve", "smoothing_kernel_size", Int, true),
    p("augmentation.curve", "point_drop_prob", Float, true),
    p("augmentation.curve", "value_jitter_std", Float, true),
    p("augmentation.curve", "time_mask_band_frac", Float, true),
    p("augmentation.curve", "channel_dropout_prob", Float, true),
];

/// Component kinds a `COMPONENT` block may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentKind {
    VicregRepresentation,
    SourceDataloader,
    SinkNull,
    SinkLogSys,
}

impl ComponentKind {
    pub fn token(self) -> &'static str {
        match self {
            ComponentKind::VicregRepresentation => "VicregRepresentation",
            ComponentKind::SourceDataloader => "SourceDataloader",
            ComponentKind::SinkNull => "SinkNull",
            ComponentKind::SinkLogSys => "SinkLogSys",
        }
    }

    pub fn canonical_type(self) -> &'static str {
        match self {
            ComponentKind::VicregRepresentation => "tsi.wikimyei.representation.vicreg",
            ComponentKind::SourceDataloader => "tsi.source.dataloader",
            ComponentKind::SinkNull => "tsi.sink.null",
            ComponentKind::SinkLogSys => "tsi.sink.log.sys",
        }
    }

    pub fn domain(self) -> TsiDomain {
        match self {
            ComponentKind::VicregRepresentation => TsiDomain::Wikimyei,
            ComponentKind::SourceDataloader => TsiDomain::Source,
            ComponentKind::SinkNull | ComponentKind::SinkLogSys => TsiDomain::Sink,
        }
    }

    pub fn from_canonical_type(text: &str) -> Option<Self> {
        ALL_COMPONENT_KINDS
            .iter()
            .copied()
            .find(|k| k.canonical_type() == text.trim())
    }
}

pub static ALL_COMPONENT_KINDS: &[ComponentKind] = &[
    ComponentKind::VicregRepresentation,
    ComponentKind::SourceDataloader,
    ComponentKind::SinkNull,
    ComponentKind::SinkLogSys,
];

/// Per-profile schema families a component kind may require or forbid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchemaFamily {
    Optimizer,
    Scheduler,
    Loss,
    ComponentParams,
    Reproducibility,
    Numerics,
    Gradient,
    Checkpoint,
    Metrics,
    DataRef,
    Augmentations,
}

impl SchemaFamily {
    pub fn token(self) -> &'static str {
        match self {
            SchemaFamily::Optimizer => "Optimizer",
            SchemaFamily::Scheduler => "Scheduler",
            SchemaFamily::Loss => "Loss",
            SchemaFamily::ComponentParams => "ComponentParams",
            SchemaFamily::Reproducibility => "Reproducibility",
            SchemaFamily::Numerics => "Numerics",
            SchemaFamily::Gradient => "Gradient",
            SchemaFamily::Checkpoint => "Checkpoint",
            SchemaFamily::Metrics => "Metrics",
            SchemaFamily::DataRef => "DataRef",
            SchemaFamily::Augmentations => "Augmentations",
        }
    }
}

/// `required=true` means the family must appear in every profile of the
/// component; `required=false` means it is forbidden. Families absent from
/// the rule list are optional.
#[derive(Debug, Clone, Copy)]
pub struct FamilyRule {
    pub component: ComponentKind,
    pub family: SchemaFamily,
    pub required: bool,
}

const fn fr(component: ComponentKind, family: SchemaFamily, required: bool) -> FamilyRule {
    FamilyRule { component, family, required }
}

pub static FAMILY_RULES: &[FamilyRule] = &[
    // trainable representation component
    fr(ComponentKind::VicregRepresentation, SchemaFamily::Optimizer, true),
    fr(ComponentKind::VicregRepresentation, SchemaFamily::Scheduler, true),
    fr(ComponentKind::VicregRepresentation, SchemaFamily::Loss, true),
    fr(ComponentKind::VicregRepresentation, SchemaFamily::ComponentParams, true),
    fr(ComponentKind::VicregRepresentation, SchemaFamily::Reproducibility, true),
    fr(ComponentKind::VicregRepresentation, SchemaFamily::Numerics, true),
    fr(ComponentKind::VicregRepresentation, SchemaFamily::Gradient, true),
    fr(ComponentKind::VicregRepresentation, SchemaFamily::Checkpoint, true),
    fr(ComponentKind::VicregRepresentation, SchemaFamily::Metrics, true),
    fr(ComponentKind::VicregRepresentation, SchemaFamily::DataRef, true),
    // sources carry data references only
    fr(ComponentKind::SourceDataloader, SchemaFamily::Optimizer, false),
    fr(ComponentKind::SourceDataloader, SchemaFamily::Scheduler, false),
    fr(ComponentKind::SourceDataloader, SchemaFamily::Loss, false),
    fr(ComponentKind::SourceDataloader, SchemaFamily::Augmentations, false),
    fr(ComponentKind::SourceDataloader, SchemaFamily::DataRef, true),
    // sinks forbid the whole training family set
    fr(ComponentKind::SinkNull, SchemaFamily::Optimizer, false),
    fr(ComponentKind::SinkNull, SchemaFamily::Scheduler, false),
    fr(ComponentKind::SinkNull, SchemaFamily::Loss, false),
    fr(ComponentKind::SinkNull, SchemaFamily::Augmentations, false),
    fr(ComponentKind::SinkLogSys, SchemaFamily::Optimizer, false),
    fr(ComponentKind::SinkLogSys, SchemaFamily::Scheduler, false),
    fr(ComponentKind::SinkLogSys, SchemaFamily::Loss, false),
    fr(ComponentKind::SinkLogSys, SchemaFamily::Augmentations, false),
];

pub fn family_rules_for(kind: ComponentKind) -> impl Iterator<Item = &'static FamilyRule> {
    FAMILY_RULES.iter().filter(move |r| r.component == kind)
}

/// Ini-selector fields SELECTORS values may target.
pub static SELECTOR_FIELDS: &[&str] = &["jkimyei_component_id", "jkimyei_profile_id"];

/// Typed key set of one owner.
#[derive(Debug, Clone, Default)]
pub struct OwnerSchema {
    pub key_kinds: BTreeMap<&'static str, ValueKind>,
    pub required_keys: BTreeSet<&'static str>,
}

/// Owner name → schema index, built once.
pub fn owner_schemas() -> &'static BTreeMap<&'static str, OwnerSchema> {
    static INDEX: OnceLock<BTreeMap<&'static str, OwnerSchema>> = OnceLock::new();
    INDEX.get_or_init(|| {
        let mut out: BTreeMap<&'static str, OwnerSchema> = BTreeMap::new();
        for desc in TYPED_PARAMS {
            let owner = out.entry(desc.owner).or_default();
            if let Some(prev) = owner.key_kinds.insert(desc.key, desc.kind) {
                assert_eq!(
                    prev, desc.kind,
                    "schema declares key '{}' twice with different kinds under '{}'",
                    desc.key, desc.owner
                );
            }
            if desc.required {
                owner.required_keys.insert(desc.key);
            }
        }
        out
    })
}

pub fn owner_schema(owner: &str) -> Option<&'static OwnerSchema> {
    owner_schemas().get(owner)
}

pub fn supported_types_with_prefix(prefix: &str) -> Vec<&'static str> {
    owner_schemas()
        .keys()
        .filter_map(|owner| owner.strip_prefix(prefix))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_kinds_match() {
        assert!(ValueKind::Bool.matches("TRUE"));
        assert!(!ValueKind::Bool.matches("nope"));
        assert!(ValueKind::Int.matches("-3"));
        assert!(!ValueKind::Int.matches("3.5"));
        assert!(ValueKind::Float.matches("1e-3"));
        assert!(!ValueKind::Float.matches("inf"));
        assert!(ValueKind::IntList.matches("1,2,3"));
        assert!(!ValueKind::IntList.matches("1,,3"));
        assert!(ValueKind::FloatList.matches("0.1, 0.2"));
        assert!(ValueKind::StringList.matches("a,b"));
    }

    #[test]
    fn owner_index_is_complete() {
        let owners = owner_schemas();
        for prefix in ["optimizer.", "scheduler.", "loss."] {
            assert!(!supported_types_with_prefix(prefix).is_empty(), "{prefix}");
        }
        let sgd = owners.get("optimizer.SGD").unwrap();
        assert_eq!(sgd.key_kinds.get("nesterov"), Some(&ValueKind::Bool));
        assert!(sgd.required_keys.contains("initial_learning_rate"));
        let aug = owners.get("augmentation.curve").unwrap();
        assert_eq!(aug.key_kinds.len(), 8);
        assert!(owners.get("component.VicregRepresentation").is_some());
    }

    #[test]
    fn family_rules_forbid_training_blocks_on_sinks() {
        let forbidden: Vec<_> = family_rules_for(ComponentKind::SinkLogSys)
            .filter(|r| !r.required)
            .map(|r| r.family)
            .collect();
        assert!(forbidden.contains(&SchemaFamily::Optimizer));
        assert!(forbidden.contains(&SchemaFamily::Augmentations));
    }

    #[test]
    fn component_kinds_resolve_from_canonical_type() {
        assert_eq!(
            ComponentKind::from_canonical_type("tsi.wikimyei.representation.vicreg"),
            Some(ComponentKind::VicregRepresentation)
        );
        assert_eq!(ComponentKind::from_canonical_type("tsi.unknown"), None);
    }
}
