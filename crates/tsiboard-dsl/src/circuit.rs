//! Circuit DSL decoder and graph validation.
//!
//! A board file holds one or more named circuits plus one invoke statement
//! per circuit, matched by name:
//!
//! ```text
//! training_circuit = {
//!   dl   = tsi.source.dataloader
//!   enc  = tsi.wikimyei.representation.vicreg.default
//!   sink = tsi.sink.log.sys
//!   dl@payload:tensor  -> enc@payload
//!   enc@loss:tensor    -> sink@loss
//! }
//! training_circuit(wave@symbol:BTCUSDT@BTCUSDT[01.01.2020,31.12.2020]);
//! ```
//!
//! Hop sources carry `@directive:kind`; hop targets carry the inbound
//! directive only — the kind is inferred from the source and a target-side
//! cast is rejected. Validation resolves every alias against the type
//! registry and checks the graph shape: exactly one root, acyclic, all
//! instances reachable, every terminal a sink.

use crate::canonical_path::{self, HashNameRegistry, PathKind};
use crate::error::{DslError, DslResult, Location};
use nom::{
    bytes::complete::{tag, take_while1},
    character::complete::{char, space0},
    combinator::{all_consuming, map, opt, rest},
    sequence::{delimited, preceded, separated_pair, tuple},
    IResult,
};
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use petgraph::Direction;
use serde::Serialize;
use std::collections::HashMap;
use tsiboard_types::{
    is_sink_type, is_unique_instance_type, parse_tsi_type_id, type_accepts_input,
    type_emits_output, DirectiveId, PayloadKind, TsiTypeId,
};

/// Raw endpoint reference as written in a hop line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointRef {
    pub instance: String,
    pub directive: String,
    /// Source endpoints require a kind; on targets any kind text is a cast
    /// error caught during resolution.
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HopDecl {
    pub from: EndpointRef,
    pub to: EndpointRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceDecl {
    pub alias: String,
    pub tsi_type: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CircuitDecl {
    pub name: String,
    pub instances: Vec<InstanceDecl>,
    pub hops: Vec<HopDecl>,
    pub invoke_name: String,
    pub invoke_payload: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CircuitInstruction {
    pub circuits: Vec<CircuitDecl>,
}

/// Hop with registry-typed endpoints; target kind inferred from source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedEndpoint<'a> {
    pub instance: &'a str,
    pub directive: DirectiveId,
    pub kind: PayloadKind,
}

#[derive(Debug, Clone, Copy)]
pub struct ResolvedHop<'a> {
    pub from: ResolvedEndpoint<'a>,
    pub to: ResolvedEndpoint<'a>,
}

// ---- line parsers ---------------------------------------------------------

fn ident(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_')(input)
}

fn path_text(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '(' | ')' | '=' | ','))(input)
}

fn endpoint_with_kind(input: &str) -> IResult<&str, EndpointRef> {
    map(
        tuple((ident, char('@'), ident, opt(preceded(char(':'), ident)))),
        |(instance, _, directive, kind)| EndpointRef {
            instance: instance.to_string(),
            directive: format!("@{directive}"),
            kind: kind.map(|k| format!(":{k}")),
        },
    )(input)
}

fn hop_line(input: &str) -> IResult<&str, HopDecl> {
    map(
        all_consuming(tuple((
            space0,
            endpoint_with_kind,
            delimited(space0, tag("->"), space0),
            endpoint_with_kind,
            space0,
        ))),
        |(_, from, _, to, _)| HopDecl { from, to },
    )(input)
}

fn instance_line(input: &str) -> IResult<&str, InstanceDecl> {
    map(
        all_consuming(tuple((
            space0,
            ident,
            delimited(space0, char('='), space0),
            path_text,
            space0,
        ))),
        |(_, alias, _, tsi_type, _)| InstanceDecl {
            alias: alias.to_string(),
            tsi_type: tsi_type.to_string(),
        },
    )(input)
}

fn header_line(input: &str) -> IResult<&str, &str> {
    map(
        all_consuming(tuple((space0, ident, space0, char('='), space0, char('{'), space0))),
        |(_, name, _, _, _, _, _)| name,
    )(input)
}

fn invoke_line(input: &str) -> IResult<&str, (String, String)> {
    let inner = map(
        separated_pair(ident, char('('), rest),
        |(name, tail): (&str, &str)| (name.to_string(), tail.to_string()),
    );
    map(all_consuming(tuple((space0, inner))), |(_, pair)| pair)(input)
}

fn strip_invoke_tail(tail: &str) -> Option<String> {
    let trimmed = tail.trim_end();
    let trimmed = trimmed.strip_suffix(';').unwrap_or(trimmed).trim_end();
    let payload = trimmed.strip_suffix(')')?;
    Some(payload.trim().to_string())
}

fn strip_comment(line: &str) -> &str {
    let line = line.trim();
    if line.starts_with("//") || line.starts_with('#') {
        ""
    } else {
        line
    }
}

/// Decode a board file into circuit declarations.
pub fn decode(text: &str) -> DslResult<CircuitInstruction> {
    let mut out = CircuitInstruction::default();
    let mut current: Option<CircuitDecl> = None;
    let mut pending_invoke: Option<usize> = None;

    for (line_no, raw_line) in text.lines().enumerate() {
        let line = strip_comment(raw_line);
        if line.is_empty() {
            continue;
        }
        let location = Location::new(line_no + 1, 1);

        if let Some(circuit) = current.as_mut() {
            if line == "}" {
                out.circuits.push(current.take().expect("current set"));
                pending_invoke = Some(out.circuits.len() - 1);
                continue;
            }
            if let Ok((_, hop)) = hop_line(line) {
                circuit.hops.push(hop);
                continue;
            }
            if let Ok((_, inst)) = instance_line(line) {
                circuit.instances.push(inst);
                continue;
            }
            return Err(DslError::parse(
                location,
                format!("unrecognized statement in circuit block: {line}"),
            ));
        }

        if let Ok((_, name)) = header_line(line) {
            current = Some(CircuitDecl { name: name.to_string(), ..Default::default() });
            pending_invoke = None;
            continue;
        }

        if let Ok((_, (invoke_name, tail))) = invoke_line(line) {
            if let Some(payload) = strip_invoke_tail(&tail) {
                let assigned = match pending_invoke.take() {
                    Some(idx) => {
                        let c = &mut out.circuits[idx];
                        c.invoke_name = invoke_name.clone();
                        c.invoke_payload = payload.clone();
                        true
                    }
                    None => {
                        let mut assigned = false;
                        for c in &mut out.circuits {
                            if c.name == invoke_name {
                                c.invoke_name = invoke_name.clone();
                                c.invoke_payload = payload.clone();
                                assigned = true;
                                break;
                            }
                        }
                        assigned
                    }
                };
                if !assigned {
                    return Err(DslError::parse(
                        location,
                        format!("invoke target does not match any declared circuit: {invoke_name}"),
                    ));
                }
                continue;
            }
        }

        return Err(DslError::parse(
            location,
            format!("unrecognized statement at board scope: {line}"),
        ));
    }

    if current.is_some() {
        return Err(DslError::parse_nowhere("unterminated circuit block"));
    }
    for circuit in &mut out.circuits {
        if circuit.invoke_name.is_empty() {
            circuit.invoke_name = circuit.name.clone();
        }
    }
    if out.circuits.is_empty() {
        return Err(DslError::parse_nowhere("no circuits decoded"));
    }
    Ok(out)
}

// ---- resolution & validation ---------------------------------------------

/// Decode every alias's tsi_type path and enforce type-level uniqueness.
pub fn build_alias_type_map(
    circuit: &CircuitDecl,
    registry: &HashNameRegistry,
) -> DslResult<HashMap<String, TsiTypeId>> {
    let mut out = HashMap::with_capacity(circuit.instances.len());
    let mut counts: HashMap<TsiTypeId, usize> = HashMap::new();

    for inst in &circuit.instances {
        let alias = inst.alias.trim();
        if alias.is_empty() {
            return Err(DslError::topology("empty instance alias"));
        }
        let type_path = canonical_path::decode(&inst.tsi_type, registry).map_err(|e| {
            DslError::compatibility(format!("invalid tsi_type canonical path for alias {alias}: {e}"))
        })?;
        if type_path.kind_of_path != PathKind::Node {
            return Err(DslError::compatibility(format!(
                "tsi_type must be canonical node path for alias {alias}: {}",
                type_path.canonical
            )));
        }
        let type_id = parse_tsi_type_id(&type_path.canonical_identity).ok_or_else(|| {
            DslError::compatibility(format!(
                "unsupported tsi_type for alias {alias}: {}",
                type_path.canonical_identity
            ))
        })?;
        let count = counts.entry(type_id).or_insert(0);
        *count += 1;
        if is_unique_instance_type(type_id) && *count > 1 {
            return Err(DslError::topology(format!(
                "tsi_type must be unique per circuit: {} (alias: {alias})",
                type_path.canonical_identity
            )));
        }
        if out.insert(alias.to_string(), type_id).is_some() {
            return Err(DslError::topology(format!("duplicated instance alias: {alias}")));
        }
    }
    Ok(out)
}

fn resolve_hop<'a>(
    hop: &'a HopDecl,
    alias_to_type: &HashMap<String, TsiTypeId>,
) -> DslResult<ResolvedHop<'a>> {
    let from_type = *alias_to_type.get(hop.from.instance.as_str()).ok_or_else(|| {
        DslError::topology(format!("hop references unknown instance alias: {}", hop.from.instance))
    })?;
    let to_type = *alias_to_type.get(hop.to.instance.as_str()).ok_or_else(|| {
        DslError::topology(format!("hop references unknown instance alias: {}", hop.to.instance))
    })?;

    let from_dir = DirectiveId::parse(&hop.from.directive);
    let from_kind = hop.from.kind.as_deref().and_then(PayloadKind::parse);
    let (from_dir, from_kind) = match (from_dir, from_kind) {
        (Some(d), Some(k)) => (d, k),
        _ => {
            return Err(DslError::compatibility(format!(
                "invalid directive/kind in hop: {}{}{} -> {}",
                hop.from.instance,
                hop.from.directive,
                hop.from.kind.as_deref().unwrap_or(""),
                hop.to.instance
            )))
        }
    };

    if !type_emits_output(from_type, from_dir, from_kind) {
        return Err(DslError::compatibility(format!(
            "hop source endpoint is not an output of source tsi type: {}{}{}",
            hop.from.instance,
            from_dir.token(),
            from_kind.token()
        )));
    }

    if hop.to.kind.is_some() {
        return Err(DslError::compatibility(format!(
            "target kind cast is not allowed in hop: {}{}{} -> {}{}{} \
             (use target inbound directive only; kind is inferred from source)",
            hop.from.instance,
            from_dir.token(),
            from_kind.token(),
            hop.to.instance,
            hop.to.directive,
            hop.to.kind.as_deref().unwrap_or("")
        )));
    }
    let to_dir = DirectiveId::parse(&hop.to.directive).ok_or_else(|| {
        DslError::compatibility(format!(
            "invalid target directive in hop: {}{}",
            hop.to.instance, hop.to.directive
        ))
    })?;

    if !type_accepts_input(to_type, to_dir, from_kind) {
        return Err(DslError::compatibility(format!(
            "hop target endpoint is not an input of target tsi type: {}{}{}",
            hop.to.instance,
            to_dir.token(),
            from_kind.token()
        )));
    }

    Ok(ResolvedHop {
        from: ResolvedEndpoint { instance: &hop.from.instance, directive: from_dir, kind: from_kind },
        to: ResolvedEndpoint { instance: &hop.to.instance, directive: to_dir, kind: from_kind },
    })
}

/// Resolve every hop in declaration order.
pub fn resolve_hops<'a>(
    circuit: &'a CircuitDecl,
    registry: &HashNameRegistry,
) -> DslResult<Vec<ResolvedHop<'a>>> {
    let alias_to_type = build_alias_type_map(circuit, registry)?;
    circuit.hops.iter().map(|hop| resolve_hop(hop, &alias_to_type)).collect()
}

/// Full graph validation battery for one circuit.
pub fn validate_circuit_decl(circuit: &CircuitDecl, registry: &HashNameRegistry) -> DslResult<()> {
    if circuit.name.trim().is_empty() {
        return Err(DslError::topology("empty circuit name"));
    }
    if circuit.invoke_name.trim().is_empty() {
        return Err(DslError::topology("empty circuit invoke name"));
    }
    if circuit.invoke_payload.trim().is_empty() {
        return Err(DslError::topology("empty circuit invoke payload"));
    }
    if circuit.instances.is_empty() {
        return Err(DslError::topology("circuit has no instance declarations"));
    }
    if circuit.hops.is_empty() {
        return Err(DslError::topology("circuit has no hop declarations"));
    }

    let alias_to_type = build_alias_type_map(circuit, registry)?;
    let resolved = resolve_hops(circuit, registry)?;

    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut index_of: HashMap<&str, NodeIndex> = HashMap::new();
    for hop in &resolved {
        for alias in [hop.from.instance, hop.to.instance] {
            index_of.entry(alias).or_insert_with(|| graph.add_node(alias));
        }
        graph.add_edge(index_of[hop.from.instance], index_of[hop.to.instance], ());
    }

    for alias in alias_to_type.keys() {
        if !index_of.contains_key(alias.as_str()) {
            return Err(DslError::topology(format!(
                "orphan instance not referenced by any hop: {alias}"
            )));
        }
    }

    let roots: Vec<NodeIndex> = graph
        .node_indices()
        .filter(|&n| graph.neighbors_directed(n, Direction::Incoming).next().is_none())
        .collect();
    if roots.is_empty() {
        return Err(DslError::topology("circuit has no root instance"));
    }
    if roots.len() != 1 {
        return Err(DslError::topology("circuit must have exactly one root instance"));
    }

    if is_cyclic_directed(&graph) {
        return Err(DslError::topology("cycle detected in circuit hops"));
    }

    let mut reachable = 0usize;
    let mut dfs = Dfs::new(&graph, roots[0]);
    while dfs.next(&graph).is_some() {
        reachable += 1;
    }
    if reachable != graph.node_count() {
        return Err(DslError::topology("unreachable instance from circuit root"));
    }

    for n in graph.node_indices() {
        if graph.neighbors_directed(n, Direction::Outgoing).next().is_none() {
            let alias = graph[n];
            let type_id = alias_to_type[alias];
            if !is_sink_type(type_id) {
                return Err(DslError::topology(format!(
                    "terminal instance must be sink type: {alias}"
                )));
            }
        }
    }

    Ok(())
}

/// Validate a full instruction: unique circuit/invoke names, then each
/// circuit in turn.
pub fn validate_circuit_instruction(
    instruction: &CircuitInstruction,
    registry: &HashNameRegistry,
) -> DslResult<()> {
    if instruction.circuits.is_empty() {
        return Err(DslError::topology("circuit instruction has no circuits"));
    }
    let mut names = Vec::new();
    let mut invokes = Vec::new();
    for (i, circuit) in instruction.circuits.iter().enumerate() {
        let name = circuit.name.trim();
        let invoke = circuit.invoke_name.trim();
        if names.contains(&name) {
            return Err(DslError::topology(format!("duplicated circuit name: {name}")));
        }
        if invokes.contains(&invoke) {
            return Err(DslError::topology(format!("duplicated circuit invoke name: {invoke}")));
        }
        names.push(name);
        invokes.push(invoke);
        validate_circuit_decl(circuit, registry)
            .map_err(|e| DslError::topology(format!("circuit[{i}] {e}")))?;
    }
    Ok(())
}
