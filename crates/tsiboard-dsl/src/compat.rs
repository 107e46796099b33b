//! Wave validation and wave/contract compatibility reporting.
//!
//! Reports collect structured indicators instead of failing on the first
//! finding, so a caller can show every mismatch between a wave and the
//! circuit it targets. The board builder treats any indicator as fatal.

use crate::canonical_path::{self, runtime_node_path, HashNameRegistry, PathKind};
use crate::circuit::CircuitInstruction;
use crate::error::DslResult;
use crate::jkspec::{tables::find_rows_by_field, JkSpecs};
use crate::wave::{WaveDecl, WaveMode};
use serde::Serialize;
use std::collections::BTreeSet;
use tsiboard_types::{parse_tsi_type_id, tsi_type_domain, TsiDomain};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CompatibilityCode {
    InvalidContractPath,
    InvalidWavePath,
    MissingContractPath,
    MissingWavePath,
    InvalidReference,
    ProfileNotFound,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompatibilityIndicator {
    pub code: CompatibilityCode,
    pub contract_path: String,
    pub wave_path: String,
    pub message: String,
}

impl CompatibilityIndicator {
    fn new(code: CompatibilityCode, message: impl Into<String>) -> Self {
        CompatibilityIndicator {
            code,
            contract_path: String::new(),
            wave_path: String::new(),
            message: message.into(),
        }
    }

    fn with_wave_path(mut self, path: impl Into<String>) -> Self {
        self.wave_path = path.into();
        self
    }

    fn with_contract_path(mut self, path: impl Into<String>) -> Self {
        self.contract_path = path.into();
        self
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CompatibilityReport {
    pub ok: bool,
    pub contract_id: String,
    pub wave_id: String,
    pub indicators: Vec<CompatibilityIndicator>,
    pub missing: usize,
    pub extra: usize,
    pub invalid_ref: usize,
}

impl CompatibilityReport {
    pub fn first_message(&self) -> Option<&str> {
        self.indicators.first().map(|i| i.message.as_str())
    }
}

/// Canonical runtime path of a node reference, or an indicator.
fn canonical_node_path(
    raw_path: &str,
    registry: &HashNameRegistry,
) -> Result<String, String> {
    let parsed = canonical_path::decode(raw_path, registry).map_err(|e| e.to_string())?;
    if parsed.kind_of_path != PathKind::Node {
        return Err("path must resolve to canonical node".to_string());
    }
    if parse_tsi_type_id(&parsed.canonical_identity).is_none() {
        return Err(format!("unsupported tsi type: {}", parsed.canonical_identity));
    }
    Ok(runtime_node_path(&parsed))
}

/// Internal wave consistency: paths decode, no duplicates, MODE/TRAIN
/// coupling.
pub fn validate_wave_definition(
    wave: &WaveDecl,
    registry: &HashNameRegistry,
) -> Vec<CompatibilityIndicator> {
    let mut indicators = Vec::new();
    let mut wikimyei_paths = BTreeSet::new();
    let mut source_paths = BTreeSet::new();
    let mut has_train_true = false;

    for w in &wave.wikimyeis {
        match canonical_node_path(&w.path, registry) {
            Err(message) => indicators.push(
                CompatibilityIndicator::new(
                    CompatibilityCode::InvalidWavePath,
                    format!("invalid wave WIKIMYEI PATH: {message}"),
                )
                .with_wave_path(&w.path),
            ),
            Ok(path) => {
                if !wikimyei_paths.insert(path.clone()) {
                    indicators.push(
                        CompatibilityIndicator::new(
                            CompatibilityCode::InvalidReference,
                            "duplicate WIKIMYEI PATH in wave",
                        )
                        .with_wave_path(path),
                    );
                }
                if w.train {
                    has_train_true = true;
                }
            }
        }
    }

    for s in &wave.sources {
        match canonical_node_path(&s.path, registry) {
            Err(message) => indicators.push(
                CompatibilityIndicator::new(
                    CompatibilityCode::InvalidWavePath,
                    format!("invalid wave SOURCE PATH: {message}"),
                )
                .with_wave_path(&s.path),
            ),
            Ok(path) => {
                if !source_paths.insert(path.clone()) {
                    indicators.push(
                        CompatibilityIndicator::new(
                            CompatibilityCode::InvalidReference,
                            "duplicate SOURCE PATH in wave",
                        )
                        .with_wave_path(path),
                    );
                }
            }
        }
    }

    if wave.mode == WaveMode::Run && has_train_true {
        indicators.push(
            CompatibilityIndicator::new(
                CompatibilityCode::InvalidReference,
                "MODE=run forbids TRAIN=true",
            )
            .with_wave_path(&wave.name),
        );
    }
    if wave.mode == WaveMode::Train && !has_train_true {
        indicators.push(
            CompatibilityIndicator::new(
                CompatibilityCode::InvalidReference,
                "MODE=train requires at least one TRAIN=true",
            )
            .with_wave_path(&wave.name),
        );
    }

    indicators
}

/// Profile lookup used for wave PROFILE_ID checks. The component id in the
/// spec may be the canonical identity, the runtime path, or the bare type
/// token; every candidate is probed.
pub fn find_component_profile_row<'s>(
    specs: &'s JkSpecs,
    component_id: &str,
    profile_id: &str,
) -> Option<&'s crate::jkspec::Row> {
    let table = specs.tables.get("component_profiles_table")?;
    for row in find_rows_by_field(table, "profile_id", profile_id) {
        let row_component_id = row.get("component_id").map(String::as_str).unwrap_or("");
        let row_component_type = row.get("component_type").map(String::as_str).unwrap_or("");
        if row_component_id == component_id || row_component_type == component_id {
            return Some(row);
        }
    }
    None
}

fn profile_candidates(raw_path: &str, canonical: &str, registry: &HashNameRegistry) -> Vec<String> {
    let mut out = Vec::new();
    if let Ok(parsed) = canonical_path::decode(raw_path, registry) {
        out.push(parsed.canonical_identity.clone());
        // the bare type canonical (tag stripped) matches component_type rows
        if let Some(type_id) = parse_tsi_type_id(&parsed.canonical_identity) {
            out.push(tsiboard_types::find_tsi_type(type_id).canonical.to_string());
        }
    }
    out.push(canonical.to_string());
    out.push(raw_path.to_string());
    out.dedup();
    out
}

/// Wave paths must be a subset of circuit paths per category and vice
/// versa; TRAIN=true entries must name an existing PROFILE_ID.
pub fn validate_wave_contract_compatibility(
    instruction: &CircuitInstruction,
    wave: &WaveDecl,
    jkspecs: Option<&JkSpecs>,
    registry: &HashNameRegistry,
    contract_id: &str,
) -> DslResult<CompatibilityReport> {
    let mut report = CompatibilityReport {
        ok: true,
        contract_id: contract_id.to_string(),
        wave_id: wave.name.clone(),
        ..Default::default()
    };

    let mut contract_wikimyei = BTreeSet::new();
    let mut contract_sources = BTreeSet::new();
    for circuit in &instruction.circuits {
        for instance in &circuit.instances {
            match canonical_node_path(&instance.tsi_type, registry) {
                Err(message) => {
                    report.ok = false;
                    report.invalid_ref += 1;
                    report.indicators.push(
                        CompatibilityIndicator::new(
                            CompatibilityCode::InvalidContractPath,
                            format!(
                                "invalid contract path for alias '{}': {message}",
                                instance.alias
                            ),
                        )
                        .with_contract_path(&instance.tsi_type),
                    );
                }
                Ok(path) => {
                    let parsed = canonical_path::decode(&path, registry)?;
                    if let Some(type_id) = parse_tsi_type_id(&parsed.canonical_identity) {
                        match tsi_type_domain(type_id) {
                            TsiDomain::Wikimyei => {
                                contract_wikimyei.insert(path);
                            }
                            TsiDomain::Source => {
                                contract_sources.insert(path);
                            }
                            TsiDomain::Sink => {}
                        }
                    }
                }
            }
        }
    }

    let mut wave_wikimyei = BTreeSet::new();
    let mut wave_sources = BTreeSet::new();
    for w in &wave.wikimyeis {
        match canonical_node_path(&w.path, registry) {
            Err(message) => {
                report.ok = false;
                report.invalid_ref += 1;
                report.indicators.push(
                    CompatibilityIndicator::new(
                        CompatibilityCode::InvalidWavePath,
                        format!("invalid wave wikimyei path: {message}"),
                    )
                    .with_wave_path(&w.path),
                );
            }
            Ok(path) => {
                wave_wikimyei.insert(path.clone());
                if w.train {
                    if let Some(specs) = jkspecs {
                        let parsed = canonical_path::decode(&path, registry)?;
                        let mut found = false;
                        for candidate in
                            profile_candidates(&w.path, &parsed.canonical_identity, registry)
                        {
                            if find_component_profile_row(specs, &candidate, &w.profile_id)
                                .is_some()
                            {
                                found = true;
                                break;
                            }
                        }
                        if !found {
                            report.ok = false;
                            report.invalid_ref += 1;
                            report.indicators.push(
                                CompatibilityIndicator::new(
                                    CompatibilityCode::ProfileNotFound,
                                    format!(
                                        "PROFILE_ID not found for TRAIN=true wikimyei path: {}",
                                        w.profile_id
                                    ),
                                )
                                .with_wave_path(path),
                            );
                        }
                    }
                }
            }
        }
    }
    for s in &wave.sources {
        match canonical_node_path(&s.path, registry) {
            Err(message) => {
                report.ok = false;
                report.invalid_ref += 1;
                report.indicators.push(
                    CompatibilityIndicator::new(
                        CompatibilityCode::InvalidWavePath,
                        format!("invalid wave source path: {message}"),
                    )
                    .with_wave_path(&s.path),
                );
            }
            Ok(path) => {
                wave_sources.insert(path);
            }
        }
    }

    if contract_sources.len() != 1 {
        report.ok = false;
        report.invalid_ref += 1;
        report.indicators.push(CompatibilityIndicator::new(
            CompatibilityCode::InvalidReference,
            "runtime currently supports exactly one SOURCE path per circuit",
        ));
    }
    if wave_sources.len() != 1 {
        report.ok = false;
        report.invalid_ref += 1;
        report.indicators.push(CompatibilityIndicator::new(
            CompatibilityCode::InvalidReference,
            "runtime currently supports exactly one SOURCE PATH in selected wave",
        ));
    }

    for (wave_set, contract_set, what) in [
        (&wave_wikimyei, &contract_wikimyei, "wikimyei"),
        (&wave_sources, &contract_sources, "source"),
    ] {
        for path in wave_set.iter() {
            if !contract_set.contains(path) {
                report.ok = false;
                report.missing += 1;
                report.indicators.push(
                    CompatibilityIndicator::new(
                        CompatibilityCode::MissingContractPath,
                        format!("wave {what} path not present in contract"),
                    )
                    .with_wave_path(path.clone()),
                );
            }
        }
        for path in contract_set.iter() {
            if !wave_set.contains(path) {
                report.ok = false;
                report.extra += 1;
                report.indicators.push(
                    CompatibilityIndicator::new(
                        CompatibilityCode::MissingWavePath,
                        format!("contract {what} path missing in wave declaration"),
                    )
                    .with_contract_path(path.clone()),
                );
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit;
    use crate::jkspec;
    use crate::wave;

    const CIRCUIT: &str = r#"
        training = {
          dl   = tsi.source.dataloader
          enc  = tsi.wikimyei.representation.vicreg.tagged
          sink = tsi.sink.log.sys
          dl@payload:tensor -> enc@payload
          enc@loss:tensor -> sink@loss
        }
        training(wave@symbol:BTCUSDT@BTCUSDT[01.01.2020,02.01.2020]);
    "#;

    const WAVES: &str = r#"
        WAVE w {
          MODE train
          SAMPLER sequential
          EPOCHS 1
          BATCH_SIZE 4
          WIKIMYEI PATH tsi.wikimyei.representation.vicreg.tagged TRAIN true PROFILE_ID base
          SOURCE PATH tsi.source.dataloader SYMBOL BTCUSDT FROM 01.01.2020 TO 02.01.2020
        }
    "#;

    const JKSPEC_MIN: &str = r#"
        JKSPEC 2.0
        COMPONENT "tsi.wikimyei.representation.vicreg" "VICReg_representation.tagged" {
          PROFILE "base" {
            OPTIMIZER "AdamW" {
              initial_learning_rate: 0.001
              beta1: 0.9
              beta2: 0.999
              eps: 1e-8
              weight_decay: 0.01
            }
            LR_SCHEDULER "ConstantLR" { lr: 0.0 }
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
              swa_start_iter: 10
            }
            REPRODUCIBILITY { seed: 42 workers: 1 deterministic: true }
            NUMERICS { dtype: "f32" device: "cpu" }
            GRADIENT { clip_norm: 1.0 accumulation_steps: 1 }
            CHECKPOINT { directory: "/tmp/ckpt" every_n_epochs: 1 keep_last: 2 }
            METRICS { log_every_n_batches: 1 enable_loss_breakdown: true }
            DATA_REF { dataset_key: "BTCUSDT" }
          }
          ACTIVE_PROFILE: "base"
        }
    "#;

    #[test]
    fn compatible_pair_passes() {
        let registry = HashNameRegistry::new();
        let inst = circuit::decode(CIRCUIT).unwrap();
        let waves = wave::decode(WAVES).unwrap();
        let specs = jkspec::decode(JKSPEC_MIN).unwrap();
        assert!(validate_wave_definition(&waves.waves[0], &registry).is_empty());
        let report = validate_wave_contract_compatibility(
            &inst,
            &waves.waves[0],
            Some(&specs),
            &registry,
            "hash",
        )
        .unwrap();
        assert!(report.ok, "{:?}", report.indicators);
    }

    #[test]
    fn unknown_profile_is_reported() {
        let registry = HashNameRegistry::new();
        let inst = circuit::decode(CIRCUIT).unwrap();
        let waves = wave::decode(&WAVES.replace("PROFILE_ID base", "PROFILE_ID ghost")).unwrap();
        let specs = jkspec::decode(JKSPEC_MIN).unwrap();
        let report = validate_wave_contract_compatibility(
            &inst,
            &waves.waves[0],
            Some(&specs),
            &registry,
            "hash",
        )
        .unwrap();
        assert!(!report.ok);
        assert!(report
            .indicators
            .iter()
            .any(|i| i.code == CompatibilityCode::ProfileNotFound));
    }

    #[test]
    fn path_mismatch_is_reported_both_ways() {
        let registry = HashNameRegistry::new();
        let inst = circuit::decode(CIRCUIT).unwrap();
        let waves = wave::decode(&WAVES.replace("vicreg.tagged", "vicreg.other")).unwrap();
        let report =
            validate_wave_contract_compatibility(&inst, &waves.waves[0], None, &registry, "hash")
                .unwrap();
        assert!(!report.ok);
        assert_eq!(report.missing, 1);
        assert_eq!(report.extra, 1);
        let codes: Vec<_> = report.indicators.iter().map(|i| i.code).collect();
        assert!(codes.contains(&CompatibilityCode::MissingContractPath));
        assert!(codes.contains(&CompatibilityCode::MissingWavePath));
    }

    #[test]
    fn run_mode_with_train_true_fails_wave_validation() {
        let registry = HashNameRegistry::new();
        let waves = wave::decode(&WAVES.replace("MODE train", "MODE run")).unwrap();
        let indicators = validate_wave_definition(&waves.waves[0], &registry);
        assert!(indicators.iter().any(|i| i.message.contains("MODE=run forbids")));
    }
}
