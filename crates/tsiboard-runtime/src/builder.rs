//! Board builder: validate a circuit+wave pair against a contract and
//! instantiate typed nodes with wired hops.
//!
//! Construction order follows the instance declarations: the source comes
//! first so the vicreg node can read its `C/T/D` geometry from the live
//! dataloader. Every required DSL segment is snapshotted into the contract
//! so the runtime board is self-describing.

use crate::context::RuntimeContext;
use crate::error::{RuntimeError, RuntimeResult};
use crate::node::{normalize_wave_span, Ingress, Signal, TsiNode, Wave, WaveCursor};
use crate::nodes::{TsiSinkLogSys, TsiSinkNull, TsiSourceDataloader, TsiVicreg};
use std::collections::BTreeMap;
use tsiboard_data::{Dataloader, ObservationPipeline, SamplerMode};
use tsiboard_dsl::canonical_path::{self, runtime_node_path, PathKind};
use tsiboard_dsl::circuit::{self, CircuitDecl};
use tsiboard_dsl::compat;
use tsiboard_dsl::contract::{
    ContractRecord, WaveRecord, SEGMENT_CIRCUIT, SEGMENT_JKIMYEI_SPECS,
    SEGMENT_OBSERVATION_CHANNELS, SEGMENT_OBSERVATION_SOURCES, SEGMENT_WAVE,
};
use tsiboard_dsl::jkspec::{tables::find_row_by_id, JkSpecs};
use tsiboard_dsl::observation::ObservationSpec;
use tsiboard_dsl::wave::{self, SamplerKind, WaveDecl, WaveMode, WaveSourceDecl};
use tsiboard_types::{
    find_tsi_type, parse_tsi_type_id, DirectiveDir, DirectiveId, PayloadKind, TsiTypeId,
};

/// Base JKSPEC component name of the vicreg representation.
const VICREG_COMPONENT_BASE: &str = "VICReg_representation";

/// A hop wired to node indices with registry-typed endpoints.
#[derive(Debug, Clone, Copy)]
pub struct WiredHop {
    pub from_node: usize,
    pub from_directive: DirectiveId,
    pub to_node: usize,
    pub to_directive: DirectiveId,
    pub kind: PayloadKind,
}

/// Descriptive summary of what a contract wired together.
#[derive(Debug, Clone, Default)]
pub struct ContractSpecInfo {
    pub instrument: String,
    pub channels: usize,
    pub timesteps: usize,
    pub features: usize,
    pub source_type: String,
    pub representation_type: String,
    pub representation_hashimyei: String,
    pub representation_component_name: String,
}

/// Epoch/batch bounds from the selected wave.
#[derive(Debug, Clone, Copy, Default)]
pub struct Execution {
    pub epochs: u64,
    pub batch_size: u64,
    pub mode_is_train: bool,
}

/// One runtime circuit: nodes, hops, seeds and the DSL snapshot.
pub struct BoardContract {
    pub name: String,
    pub nodes: Vec<Box<dyn TsiNode>>,
    pub hops: Vec<WiredHop>,
    pub spec: ContractSpecInfo,
    pub execution: Execution,
    pub seed_wave: Wave,
    pub seed_ingress: Ingress,
    pub dsl_segments: BTreeMap<String, String>,
    /// Index of the circuit root (the source) in `nodes`.
    pub root_index: usize,
}

impl std::fmt::Debug for BoardContract {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoardContract")
            .field("name", &self.name)
            .field("node_count", &self.nodes.len())
            .field("hops", &self.hops)
            .field("spec", &self.spec)
            .field("execution", &self.execution)
            .field("seed_wave", &self.seed_wave)
            .field("seed_ingress", &self.seed_ingress)
            .field("dsl_segments", &self.dsl_segments)
            .field("root_index", &self.root_index)
            .finish()
    }
}

impl BoardContract {
    pub fn node_index_by_alias(&self, alias: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.instance_name() == alias)
    }
}

/// A runtime board: contracts plus the identity pair they were built from.
#[derive(Debug)]
pub struct Board {
    pub contract_hash: String,
    pub wave_hash: String,
    pub contracts: Vec<BoardContract>,
}

fn sampler_mode(kind: SamplerKind) -> SamplerMode {
    match kind {
        SamplerKind::Sequential => SamplerMode::Sequential,
        SamplerKind::Random => SamplerMode::Random,
    }
}

/// Stable sampler seed from the wave record identity.
fn sampler_seed(wave_hash: &str) -> u64 {
    let mut out = 0u64;
    for (i, byte) in wave_hash.bytes().take(8).enumerate() {
        out |= u64::from(byte) << (8 * i);
    }
    out
}

/// Resolve the JKSPEC lookup name for the vicreg component: the base name,
/// optionally refined by the instance's hashimyei tag (`.tag` then `_tag`).
fn resolve_vicreg_lookup_name(hashimyei: &str, specs: &JkSpecs) -> String {
    if hashimyei.is_empty() {
        return VICREG_COMPONENT_BASE.to_string();
    }
    let components = match specs.tables.get("components_table") {
        Some(table) => table,
        None => return VICREG_COMPONENT_BASE.to_string(),
    };
    let dot_name = format!("{VICREG_COMPONENT_BASE}.{hashimyei}");
    if find_row_by_id(components, &dot_name).is_some() {
        return dot_name;
    }
    let underscore_name = format!("{VICREG_COMPONENT_BASE}_{hashimyei}");
    if find_row_by_id(components, &underscore_name).is_some() {
        return underscore_name;
    }
    VICREG_COMPONENT_BASE.to_string()
}

fn compose_runtime_component_name(lookup: &str, circuit_name: &str, alias: &str) -> String {
    format!("{lookup}@{circuit_name}.{alias}")
}

/// Re-render a circuit in canonical form (resolved hashimyei tags, typed
/// hop endpoints) for the contract snapshot.
fn render_canonical_circuit_dsl(
    parsed: &CircuitDecl,
    invoke_payload: &str,
    ctx: &RuntimeContext,
) -> RuntimeResult<String> {
    let mut out = format!("{} = {{\n", parsed.name);
    for decl in &parsed.instances {
        let type_path = canonical_path::decode(&decl.tsi_type, &ctx.hash_names)?;
        out.push_str(&format!("  {} = {}\n", decl.alias, runtime_node_path(&type_path)));
    }
    let resolved = circuit::resolve_hops(parsed, &ctx.hash_names)?;
    for hop in &resolved {
        out.push_str(&format!(
            "  {}{}{} -> {}{}\n",
            hop.from.instance,
            hop.from.directive.token(),
            hop.from.kind.token(),
            hop.to.instance,
            hop.to.directive.token()
        ));
    }
    out.push_str("}\n");
    out.push_str(&format!("{}({});\n", parsed.invoke_name, invoke_payload));
    Ok(out)
}

struct CircuitBuildInputs<'a> {
    contract: &'a ContractRecord,
    wave_record: &'a WaveRecord,
    observation: &'a ObservationSpec,
    jkspecs: &'a JkSpecs,
    selected_wave: &'a WaveDecl,
    wave_index: usize,
}

fn build_circuit_contract(
    parsed: &CircuitDecl,
    inputs: &CircuitBuildInputs<'_>,
    ctx: &RuntimeContext,
) -> RuntimeResult<BoardContract> {
    circuit::validate_circuit_decl(parsed, &ctx.hash_names)?;

    let wave_decl = inputs.selected_wave;
    let mut spec_info = ContractSpecInfo::default();
    let mut execution = Execution {
        epochs: wave_decl.epochs,
        batch_size: wave_decl.batch_size,
        mode_is_train: wave_decl.mode == WaveMode::Train,
    };
    if execution.batch_size == 0 {
        return Err(RuntimeError::build("wave BATCH_SIZE must be > 0"));
    }

    let mut nodes: Vec<Box<dyn TsiNode>> = Vec::with_capacity(parsed.instances.len());
    let mut aliases: Vec<String> = Vec::with_capacity(parsed.instances.len());
    let mut source_geometry: Option<(usize, usize, usize)> = None;
    let mut selected_source: Option<&WaveSourceDecl> = None;
    let mut next_id = 1u64;

    for decl in &parsed.instances {
        let type_path = canonical_path::decode(&decl.tsi_type, &ctx.hash_names)?;
        if type_path.kind_of_path != PathKind::Node {
            return Err(RuntimeError::build(format!(
                "tsi_type must be a canonical node path for alias {}: {}",
                decl.alias, type_path.canonical
            )));
        }
        let type_id = parse_tsi_type_id(&type_path.canonical_identity).ok_or_else(|| {
            RuntimeError::build(format!("unsupported tsi_type: {}", type_path.canonical_identity))
        })?;
        let type_desc = find_tsi_type(type_id);
        let decl_path = runtime_node_path(&type_path);

        let node: Box<dyn TsiNode> = match type_id {
            TsiTypeId::SourceDataloader => {
                let source_decl = wave_decl
                    .sources
                    .iter()
                    .find(|s| {
                        canonical_path::decode(&s.path, &ctx.hash_names)
                            .map(|p| runtime_node_path(&p) == decl_path)
                            .unwrap_or(false)
                    })
                    .ok_or_else(|| {
                        RuntimeError::build(format!(
                            "missing SOURCE wave block for path '{decl_path}'"
                        ))
                    })?;
                selected_source = Some(source_decl);
                spec_info.instrument = source_decl.symbol.clone();
                spec_info.source_type = type_desc.canonical.to_string();

                let span_begin = wave::parse_ddmmyyyy_to_unix_ms(&source_decl.from, false)?;
                let span_end = wave::parse_ddmmyyyy_to_unix_ms(&source_decl.to, true)?;
                let pipeline = ObservationPipeline::open(
                    inputs.observation,
                    &source_decl.symbol,
                    ctx.device.clone(),
                )?;
                let loader = Dataloader::new(
                    pipeline,
                    execution.batch_size as usize,
                    sampler_mode(wave_decl.sampler),
                    Some((span_begin.min(span_end), span_begin.max(span_end))),
                    sampler_seed(&inputs.wave_record.hash),
                )?;
                let source = TsiSourceDataloader::new(next_id, decl.alias.clone(), loader);
                source_geometry =
                    Some((source.channel_count(), source.seq_length(), source.feature_dim()));
                spec_info.channels = source.channel_count();
                spec_info.timesteps = source.seq_length();
                spec_info.features = source.feature_dim();
                Box::new(source)
            }
            TsiTypeId::WikimyeiRepresentationVicreg => {
                let (c, t, d) = source_geometry.ok_or_else(|| {
                    RuntimeError::build(
                        "vicreg requires a dataloader declared earlier in the same circuit",
                    )
                })?;
                let wave_wikimyei = wave_decl
                    .wikimyeis
                    .iter()
                    .find(|w| {
                        canonical_path::decode(&w.path, &ctx.hash_names)
                            .map(|p| runtime_node_path(&p) == decl_path)
                            .unwrap_or(false)
                    })
                    .ok_or_else(|| {
                        RuntimeError::build(format!(
                            "missing WIKIMYEI wave block for path '{decl_path}'"
                        ))
                    })?;

                let lookup_name =
                    resolve_vicreg_lookup_name(&type_path.hashimyei, inputs.jkspecs);
                let runtime_name =
                    compose_runtime_component_name(&lookup_name, &parsed.name, &decl.alias);
                ctx.setups.set_component_override(
                    &inputs.contract.hash,
                    &runtime_name,
                    &lookup_name,
                    Some(wave_wikimyei.profile_id.clone()),
                );
                let setup =
                    ctx.setups.setup(&inputs.contract.hash, &runtime_name, inputs.jkspecs)?;

                spec_info.representation_type = type_desc.canonical.to_string();
                spec_info.representation_hashimyei = type_path.hashimyei.clone();
                spec_info.representation_component_name = runtime_name.clone();

                let use_swa = setup
                    .profile_row
                    .get("vicreg_use_swa")
                    .map(|v| v == "true")
                    .unwrap_or(true);
                let model_spec =
                    tsiboard_learn::VicregSpec::from_setup(&runtime_name, c, t, d, setup.as_ref())?;
                let model = tsiboard_learn::Vicreg4D::instantiate(
                    model_spec,
                    setup,
                    ctx.device.clone(),
                    wave_wikimyei.train,
                )?;
                Box::new(TsiVicreg::new(
                    next_id,
                    decl.alias.clone(),
                    model,
                    wave_wikimyei.train,
                    use_swa,
                ))
            }
            TsiTypeId::SinkNull => Box::new(TsiSinkNull::new(next_id, decl.alias.clone())),
            TsiTypeId::SinkLogSys => Box::new(TsiSinkLogSys::new(next_id, decl.alias.clone())),
        };
        next_id += 1;

        if aliases.contains(&decl.alias) {
            return Err(RuntimeError::build(format!("duplicated instance alias: {}", decl.alias)));
        }
        aliases.push(decl.alias.clone());
        nodes.push(node);
    }

    let selected_source = selected_source
        .ok_or_else(|| RuntimeError::build("circuit has no source instance"))?;

    // hops: registry-resolved endpoints, then verified against the nodes
    let resolved = circuit::resolve_hops(parsed, &ctx.hash_names)?;
    let mut hops = Vec::with_capacity(resolved.len());
    for hop in &resolved {
        let from_node = aliases.iter().position(|a| a == hop.from.instance).ok_or_else(|| {
            RuntimeError::build(format!(
                "hop references unknown instance alias: {}",
                hop.from.instance
            ))
        })?;
        let to_node = aliases.iter().position(|a| a == hop.to.instance).ok_or_else(|| {
            RuntimeError::build(format!(
                "hop references unknown instance alias: {}",
                hop.to.instance
            ))
        })?;

        let out_ok = nodes[from_node].directives().iter().any(|d| {
            d.dir == DirectiveDir::Out && d.directive == hop.from.directive && d.kind == hop.from.kind
        });
        let in_ok = nodes[to_node].directives().iter().any(|d| {
            d.dir == DirectiveDir::In && d.directive == hop.to.directive && d.kind == hop.to.kind
        });
        if !out_ok || !in_ok {
            return Err(RuntimeError::build(format!(
                "hop directive not found on tsi declarations: {}{} -> {}{}",
                hop.from.instance,
                hop.from.directive.token(),
                hop.to.instance,
                hop.to.directive.token()
            )));
        }

        hops.push(WiredHop {
            from_node,
            from_directive: hop.from.directive,
            to_node,
            to_directive: hop.to.directive,
            kind: hop.from.kind,
        });
    }

    // seeds from the wave-composed invoke payload
    let invoke_payload = wave::compose_invoke_payload(selected_source, wave_decl);
    let invoke = wave::parse_wave_invoke(&invoke_payload)?;
    if invoke.total_epochs > 0 {
        execution.epochs = invoke.total_epochs;
    }
    let seed_wave = normalize_wave_span(Wave {
        cursor: WaveCursor {
            id: inputs.wave_index as u64,
            i: invoke.wave_i,
            episode: invoke.episode,
            batch: invoke.batch,
        },
        max_batches_per_epoch: invoke.max_batches_per_epoch,
        has_time_span: invoke.has_time_span,
        span_begin_ms: invoke.span_begin_ms,
        span_end_ms: invoke.span_end_ms,
    });
    let root_index = nodes
        .iter()
        .position(|n| n.type_id() == TsiTypeId::SourceDataloader)
        .ok_or_else(|| RuntimeError::build("circuit has no source instance"))?;
    let seed_ingress = Ingress {
        directive: DirectiveId::Payload,
        signal: Signal::text(invoke.source_command.clone()),
    };

    let mut dsl_segments = BTreeMap::new();
    dsl_segments.insert(
        SEGMENT_CIRCUIT.to_string(),
        render_canonical_circuit_dsl(parsed, &invoke_payload, ctx)?,
    );
    dsl_segments.insert(
        SEGMENT_OBSERVATION_SOURCES.to_string(),
        inputs.contract.observation_sources_dsl.clone(),
    );
    dsl_segments.insert(
        SEGMENT_OBSERVATION_CHANNELS.to_string(),
        inputs.contract.observation_channels_dsl.clone(),
    );
    dsl_segments
        .insert(SEGMENT_JKIMYEI_SPECS.to_string(), inputs.contract.jkimyei_specs_dsl.clone());
    dsl_segments.insert(SEGMENT_WAVE.to_string(), inputs.wave_record.wave_dsl.clone());
    for (key, text) in &dsl_segments {
        if text.trim().is_empty() {
            return Err(RuntimeError::build(format!(
                "missing required DSL text for key: {key}"
            )));
        }
    }

    Ok(BoardContract {
        name: parsed.name.clone(),
        nodes,
        hops,
        spec: spec_info,
        execution,
        seed_wave,
        seed_ingress,
        dsl_segments,
        root_index,
    })
}

/// Build a runtime board from a registered contract/wave record pair.
pub fn build_board(
    ctx: &RuntimeContext,
    contract: &ContractRecord,
    wave_record: &WaveRecord,
    wave_id: &str,
) -> RuntimeResult<Board> {
    let instruction = contract.decoded_circuits()?;
    circuit::validate_circuit_instruction(&instruction, &ctx.hash_names)?;
    let observation = contract.decoded_observation()?;
    let jkspecs = contract.decoded_jkspecs()?;
    let waves = wave_record.decoded_waves()?;

    let selected_wave = wave::select_wave(&waves, wave_id)?;
    let wave_indicators = compat::validate_wave_definition(selected_wave, &ctx.hash_names);
    if let Some(first) = wave_indicators.first() {
        return Err(RuntimeError::build(format!("wave validation failed: {}", first.message)));
    }
    let report = compat::validate_wave_contract_compatibility(
        &instruction,
        selected_wave,
        Some(&jkspecs),
        &ctx.hash_names,
        &contract.hash,
    )?;
    if !report.ok {
        return Err(RuntimeError::build(format!(
            "wave/contract compatibility validation failed: {}",
            report.first_message().unwrap_or("unknown")
        )));
    }

    let mut contracts = Vec::with_capacity(instruction.circuits.len());
    for (i, parsed) in instruction.circuits.iter().enumerate() {
        let inputs = CircuitBuildInputs {
            contract,
            wave_record,
            observation: &observation,
            jkspecs: &jkspecs,
            selected_wave,
            wave_index: i,
        };
        let built = build_circuit_contract(parsed, &inputs, ctx)
            .map_err(|e| RuntimeError::build(format!("contract[{i}] {e}")))?;
        contracts.push(built);
    }

    Ok(Board {
        contract_hash: contract.hash.clone(),
        wave_hash: wave_record.hash.clone(),
        contracts,
    })
}
