//! Full-document JKSPEC decoding against the schema catalog.

use tsiboard_dsl::jkspec::{self, tables::find_rows_by_field, ROW_ID};

const DOCUMENT: &str = r#"
JKSPEC 2.0

SELECTORS {
  COMPONENT_ID_KEY: "jkimyei_component_id"
  PROFILE_ID_KEY: "jkimyei_profile_id"
}

COMPONENT "tsi.wikimyei.representation.vicreg" "VICReg_representation" {

  PROFILE "baseline" {
    OPTIMIZER "AdamW" {
      initial_learning_rate: 0.001
      beta1: 0.9
      beta2: 0.999
      eps: 1e-8
      weight_decay: 0.01
    }

    LR_SCHEDULER "StepLR" {
      step_size: 10
      gamma: 0.5
    }

    LOSS "VicReg" {
      sim_coeff: 25.0
      std_coeff: 25.0
      cov_coeff: 1.0
    }

    COMPONENT_PARAMS {
      encoding_dims: 72
      channel_expansion_dim: 64
      fused_feature_dim: 32
      encoder_hidden_dims: 24
      encoder_depth: 4
      projector_mlp_spec: "128-256-218"
      projector_norm: "LayerNorm"
      projector_activation: "SiLU"
      projector_hidden_bias: true
      projector_last_bias: false
      projector_bn_in_fp32: false
      optimizer_threshold_reset: 0
      enable_buffer_averaging: false
      swa_start_iter: 100
      augmentation_set: "market_warps"
    }

    REPRODUCIBILITY { seed: 42 workers: 1 deterministic: true }
    NUMERICS { dtype: "f32" device: "cpu" }
    GRADIENT { clip_norm: 1.0 accumulation_steps: 1 }
    CHECKPOINT { directory: "/tmp/tsiboard" every_n_epochs: 1 keep_last: 3 }
    METRICS { log_every_n_batches: 10 enable_loss_breakdown: true }
    DATA_REF { dataset_key: "BTCUSDT" sampler: "sequential" }
  }

  PROFILE "fast" {
    OPTIMIZER "SGD" {
      initial_learning_rate: 0.01
      momentum: 0.9
      dampening: 0.0
      weight_decay: 0.0
      nesterov: true
    }
    LR_SCHEDULER "CosineAnnealingLR" { T_max: 50 eta_min: 1e-5 }
    LOSS "VicReg" { sim_coeff: 10.0 std_coeff: 10.0 cov_coeff: 1.0 }
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
      enable_buffer_averaging: true
      swa_start_iter: 5
      augmentation_set: "market_warps"
    }
    REPRODUCIBILITY { seed: 7 workers: 1 deterministic: true }
    NUMERICS { dtype: "f32" device: "cpu" }
    GRADIENT { clip_norm: 0.5 accumulation_steps: 2 }
    CHECKPOINT { directory: "/tmp/tsiboard" every_n_epochs: 2 keep_last: 1 }
    METRICS { log_every_n_batches: 1 enable_loss_breakdown: false }
    DATA_REF { dataset_key: "BTCUSDT" }
  }

  AUGMENTATIONS "market_warps" {
    CURVE "Linear" {
      kind: "Linear"
      curve_param: 0.0
      noise_scale: 0.02
      smoothing_kernel_size: 3
      point_drop_prob: 0.06
      value_jitter_std: 0.015
      time_mask_band_frac: 0.0
      channel_dropout_prob: 0.0
    }
    CURVE "MarketFade" {
      kind: "MarketFade"
      curve_param: 5.0
      noise_scale: 0.03
      smoothing_kernel_size: 7
      point_drop_prob: 0.08
      value_jitter_std: 0.015
      time_mask_band_frac: 0.05
      channel_dropout_prob: 0.03
    }
  }

  ACTIVE_PROFILE: "baseline"
}

COMPONENT "tsi.sink.log.sys" "LogSink" {
  PROFILE "default" {
    COMPONENT_PARAMS { comment: "system log sink" }
  }
  ACTIVE_PROFILE: "default"
}
"#;

#[test]
fn materializes_expected_tables() {
    let specs = jkspec::decode(DOCUMENT).unwrap();

    // exactly one components_table row per component
    let components = specs.table("components_table").unwrap();
    assert_eq!(components.len(), 2);

    // exactly one component_profiles_table row per declared profile
    let profiles = specs.table("component_profiles_table").unwrap();
    assert_eq!(profiles.len(), 3);
    let vicreg_profiles = find_rows_by_field(profiles, "component_id", "VICReg_representation");
    assert_eq!(vicreg_profiles.len(), 2);
    let active: Vec<_> = vicreg_profiles
        .iter()
        .filter(|r| r.get("active").map(String::as_str) == Some("true"))
        .collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].get("profile_id").map(String::as_str), Some("baseline"));

    // composite row ids for setup tables
    assert!(specs
        .row("optimizers_table", "VICReg_representation@baseline::optimizer")
        .is_ok());
    assert!(specs
        .row("lr_schedulers_table", "VICReg_representation@fast::scheduler")
        .is_ok());
    assert_eq!(
        specs
            .field("optimizers_table", "VICReg_representation@baseline::optimizer", "type")
            .unwrap(),
        "AdamW"
    );

    // augmentation rows come from the set the active profile references
    let augmentations = specs.table("vicreg_augmentations").unwrap();
    assert_eq!(augmentations.len(), 2);
    assert!(augmentations.iter().all(|r| r.get(ROW_ID).is_some()));
    assert!(augmentations
        .iter()
        .any(|r| r.get("kind").map(String::as_str) == Some("MarketFade")));
}

#[test]
fn workers_kind_mismatch_names_key_and_kind() {
    let invalid = DOCUMENT.replace("workers: 1", "workers: nope");
    let err = jkspec::decode(&invalid).unwrap_err().to_string();
    assert!(err.contains("workers"), "{err}");
    assert!(err.contains("Int"), "{err}");
}

#[test]
fn unknown_optimizer_key_is_rejected() {
    let invalid =
        DOCUMENT.replacen("initial_learning_rate:", "unknown_optimizer_key:", 1);
    let err = jkspec::decode(&invalid).unwrap_err().to_string();
    assert!(err.contains("unknown_optimizer_key") || err.contains("missing required"), "{err}");
}

#[test]
fn bad_selector_target_is_rejected() {
    let invalid = DOCUMENT.replace("jkimyei_component_id", "nonexistent_selector");
    assert!(jkspec::decode(&invalid).is_err());
}

#[test]
fn forbidden_augmentations_on_sink_rejected() {
    let invalid = DOCUMENT.replace(
        "ACTIVE_PROFILE: \"default\"",
        "AUGMENTATIONS \"bad\" { CURVE \"Linear\" {\n    kind: \"Linear\"\n    curve_param: 0.0\n    noise_scale: 0.0\n    smoothing_kernel_size: 1\n    point_drop_prob: 0.0\n    value_jitter_std: 0.0\n    time_mask_band_frac: 0.0\n    channel_dropout_prob: 0.0\n  } }\n  ACTIVE_PROFILE: \"default\"",
    );
    let err = jkspec::decode(&invalid).unwrap_err().to_string();
    assert!(err.contains("forbidden family"), "{err}");
}

#[test]
fn undefined_augmentation_set_reference_rejected() {
    let invalid = DOCUMENT.replace(
        "augmentation_set: \"market_warps\"\n    }\n    REPRODUCIBILITY { seed: 7",
        "augmentation_set: \"ghost_set\"\n    }\n    REPRODUCIBILITY { seed: 7",
    );
    let err = jkspec::decode(&invalid).unwrap_err().to_string();
    assert!(err.contains("augmentation_set"), "{err}");
}
