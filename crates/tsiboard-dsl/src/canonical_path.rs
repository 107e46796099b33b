//! Canonical path decoder.
//!
//! A path is `root.namespace.[family.model.hashimyei][.facet][(args)][@directive:kind]`.
//! Decoding normalizes the text, resolves `default` hashimyei tags to
//! stable mnemonic names through the process-lifetime [`HashNameRegistry`],
//! and yields the canonical identity/endpoint strings plus their hash
//! names. Two decodes of the same canonical identity always return the
//! same names.

use crate::error::{DslError, DslResult};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tsiboard_types::{DirectiveId, PayloadKind, TRAINABLE_WIKIMYEI_BASES};

const FNV64_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV64_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 4 families x 16 qualia = 64 mnemonic slots.
const HASH_FAMILIES: [&str; 4] = ["lumen", "orbit", "quill", "vesper"];
const HASH_QUALIA: [&str; 16] = [
    "_the_anchor",
    "_the_beacon",
    "_the_cartographer",
    "_the_drifter",
    "_the_ember",
    "_the_ferryman",
    "_the_gleaner",
    "_the_harbor",
    "_the_islet",
    "_the_juggler",
    "_the_keeper",
    "_the_lantern",
    "_the_meridian",
    "_the_nomad",
    "_the_oracle",
    "_the_pilot",
];

fn fnv1a64(text: &str) -> u64 {
    let mut h = FNV64_OFFSET;
    for byte in text.bytes() {
        h ^= u64::from(byte);
        h = h.wrapping_mul(FNV64_PRIME);
    }
    h
}

fn mnemonic_for_seed(seed: u64) -> String {
    let idx = seed & 0x3f;
    let family = HASH_FAMILIES[((idx >> 4) & 0x3) as usize];
    let qualia = HASH_QUALIA[(idx & 0xf) as usize];
    format!("{family}{qualia}")
}

/// Bidirectional key↔name table. Allocation is one-shot per distinct key:
/// the first 64 probes walk the mnemonic pool from the FNV-1a seed, the
/// overflow fallback appends a short hex nonce to the seed mnemonic.
#[derive(Debug, Default)]
pub struct HashNameRegistry {
    inner: Mutex<RegistryMaps>,
}

#[derive(Debug, Default)]
struct RegistryMaps {
    key_to_name: HashMap<String, String>,
    name_to_key: HashMap<String, String>,
}

impl HashNameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&self, key: &str) -> String {
        let mut maps = self.inner.lock().expect("hash name registry poisoned");
        if let Some(existing) = maps.key_to_name.get(key) {
            return existing.clone();
        }

        let seed = fnv1a64(key);
        for offset in 0..64u64 {
            let candidate = mnemonic_for_seed(seed.wrapping_add(offset));
            match maps.name_to_key.get(&candidate) {
                Some(owner) if owner != key => continue,
                _ => {
                    maps.name_to_key.insert(candidate.clone(), key.to_string());
                    maps.key_to_name.insert(key.to_string(), candidate.clone());
                    return candidate;
                }
            }
        }

        // pool exhausted: mnemonic base plus hex nonce, still deterministic
        let mut nonce = 64u64;
        loop {
            let candidate =
                format!("{}_x{:04x}", mnemonic_for_seed(seed), (seed.wrapping_add(nonce)) & 0xffff);
            match maps.name_to_key.get(&candidate) {
                Some(owner) if owner != key => nonce += 1,
                _ => {
                    maps.name_to_key.insert(candidate.clone(), key.to_string());
                    maps.key_to_name.insert(key.to_string(), candidate.clone());
                    return candidate;
                }
            }
        }
    }

    pub fn lookup_key(&self, name: &str) -> Option<String> {
        self.inner.lock().expect("hash name registry poisoned").name_to_key.get(name).cloned()
    }
}

/// What shape of expression was decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PathKind {
    Node,
    Call,
    Endpoint,
}

/// One `key[=value]` call argument, insertion order preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathArg {
    pub key: String,
    pub value: String,
}

/// Optional facet segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Facet {
    None,
    Jkimyei,
}

/// Fully decoded canonical path.
#[derive(Debug, Clone, Serialize)]
pub struct CanonicalPath {
    pub raw: String,
    pub kind_of_path: PathKind,
    pub segments: Vec<String>,
    pub args: Vec<PathArg>,
    pub facet: Facet,
    pub hashimyei: String,
    pub directive: Option<DirectiveId>,
    pub kind: Option<PayloadKind>,
    pub canonical_identity: String,
    pub canonical_endpoint: String,
    pub canonical: String,
    pub identity_hash_name: String,
    pub endpoint_hash_name: String,
}

fn is_atom_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn is_valid_atom(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    text.chars().all(is_atom_char)
}

struct SplitCore {
    path_text: String,
    args_text: String,
    endpoint_text: String,
    has_call: bool,
}

/// Locate the last depth-0 `@` (endpoint suffix) and the balanced call
/// parentheses. Calls and endpoints nested inside parentheses are ignored
/// by the outer scan.
fn split_core(input: &str) -> DslResult<SplitCore> {
    let input = input.trim();
    if input.is_empty() {
        return Err(DslError::parse_nowhere("empty path expression"));
    }

    let bytes: Vec<char> = input.chars().collect();
    let mut depth = 0i32;
    let mut at: Option<usize> = None;
    for (i, &c) in bytes.iter().enumerate() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(DslError::parse_nowhere("unbalanced ')'"));
                }
            }
            '@' if depth == 0 => at = Some(i),
            _ => {}
        }
    }
    if depth != 0 {
        return Err(DslError::parse_nowhere("unbalanced parentheses"));
    }

    let (core, endpoint_text) = match at {
        Some(i) => {
            let core: String = bytes[..i].iter().collect();
            let suffix: String = bytes[i + 1..].iter().collect();
            (core.trim().to_string(), suffix.trim().to_string())
        }
        None => (input.to_string(), String::new()),
    };

    let chars: Vec<char> = core.chars().collect();
    let lp = match chars.iter().position(|&c| c == '(') {
        None => {
            if core.trim().is_empty() {
                return Err(DslError::parse_nowhere("missing base path"));
            }
            return Ok(SplitCore {
                path_text: core.trim().to_string(),
                args_text: String::new(),
                endpoint_text,
                has_call: false,
            });
        }
        Some(i) => i,
    };
    let mut call_depth = 0i32;
    let mut rp: Option<usize> = None;
    for (i, &c) in chars.iter().enumerate().skip(lp) {
        if c == '(' {
            call_depth += 1;
        } else if c == ')' {
            call_depth -= 1;
            if call_depth == 0 {
                rp = Some(i);
                break;
            }
        }
    }
    let rp = rp.ok_or_else(|| DslError::parse_nowhere("missing ')' for call suffix"))?;

    let trailing: String = chars[rp + 1..].iter().collect();
    if !trailing.trim().is_empty() {
        return Err(DslError::parse_nowhere("unexpected trailing text after call"));
    }

    let path_text: String = chars[..lp].iter().collect();
    let args_text: String = chars[lp + 1..rp].iter().collect();
    if path_text.trim().is_empty() {
        return Err(DslError::parse_nowhere("missing callable path"));
    }
    Ok(SplitCore {
        path_text: path_text.trim().to_string(),
        args_text: args_text.trim().to_string(),
        endpoint_text,
        has_call: true,
    })
}

fn parse_args(text: &str) -> DslResult<Vec<PathArg>> {
    let mut out = Vec::new();
    for token in text.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let (key, value) = match token.find('=') {
            Some(eq) => (token[..eq].trim().to_string(), token[eq + 1..].trim().to_string()),
            None => (token.to_string(), String::new()),
        };
        if !is_valid_atom(&key) {
            return Err(DslError::parse_nowhere(format!("invalid argument key: {key}")));
        }
        out.push(PathArg { key, value });
    }
    Ok(out)
}

fn canonical_args(args: &[PathArg]) -> String {
    let mut out = String::new();
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&arg.key);
        if !arg.value.is_empty() {
            out.push('=');
            out.push_str(&arg.value);
        }
    }
    out
}

struct ParsedEndpoint {
    directive: DirectiveId,
    kind: PayloadKind,
}

fn parse_endpoint_suffix(text: &str) -> DslResult<Option<ParsedEndpoint>> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    let colon = match text.rfind(':') {
        Some(i) if i > 0 && i + 1 < text.len() => i,
        _ => return Err(DslError::parse_nowhere("endpoint requires @directive:kind")),
    };
    let directive = DirectiveId::parse(&text[..colon])
        .ok_or_else(|| DslError::parse_nowhere("invalid directive in endpoint suffix"))?;
    let kind = PayloadKind::parse(&text[colon + 1..])
        .ok_or_else(|| DslError::parse_nowhere("invalid kind in endpoint suffix"))?;
    Ok(Some(ParsedEndpoint { directive, kind }))
}

fn is_trainable_wikimyei_base(base: &str) -> bool {
    TRAINABLE_WIKIMYEI_BASES.contains(&base)
}

fn canonicalize_segments(
    segs: &mut Vec<String>,
    registry: &HashNameRegistry,
) -> DslResult<(Facet, String)> {
    if segs.is_empty() {
        return Err(DslError::parse_nowhere("missing path segments"));
    }
    for s in segs.iter() {
        if !is_valid_atom(s) {
            return Err(DslError::parse_nowhere(format!("invalid path segment: {s}")));
        }
    }

    let root_is_tsi = segs[0] == "tsi";
    let root_is_iinuji = segs[0] == "iinuji";
    if !root_is_tsi && !root_is_iinuji {
        return Err(DslError::parse_nowhere("path root must be 'tsi' or 'iinuji'"));
    }
    if root_is_tsi && segs.len() >= 2 && segs[1] == "iinuji" {
        return Err(DslError::parse_nowhere("tsi.iinuji.* is not supported; use iinuji.*"));
    }

    let mut facet = Facet::None;
    if segs.last().map(String::as_str) == Some("jkimyei") {
        facet = Facet::Jkimyei;
        segs.pop();
    }

    if segs.len() < 2 {
        return Err(DslError::parse_nowhere("path requires at least <root>.<namespace>"));
    }

    let mut hashimyei = String::new();
    if segs[1] == "wikimyei" {
        if !root_is_tsi {
            return Err(DslError::parse_nowhere("wikimyei paths must be rooted at tsi.wikimyei"));
        }
        if segs.len() < 4 {
            return Err(DslError::parse_nowhere("tsi.wikimyei path requires family and model"));
        }
        if segs.len() == 4 {
            segs.push("default".to_string());
        } else if segs.len() != 5 {
            return Err(DslError::parse_nowhere(
                "tsi.wikimyei path accepts family.model.hashimyei",
            ));
        }

        hashimyei = segs[4].clone();
        if hashimyei == "default" {
            let base_key = format!("{}.{}.{}.{}.self", segs[0], segs[1], segs[2], segs[3]);
            hashimyei = registry.assign(&base_key);
            segs[4] = hashimyei.clone();
        }
        if facet == Facet::Jkimyei {
            let base = format!("{}.{}.{}.{}", segs[0], segs[1], segs[2], segs[3]);
            if !is_trainable_wikimyei_base(&base) {
                return Err(DslError::parse_nowhere(
                    "jkimyei facet only valid for trainable tsi.wikimyei types",
                ));
            }
        }
    } else if facet == Facet::Jkimyei {
        return Err(DslError::parse_nowhere("jkimyei facet only valid for tsi.wikimyei paths"));
    }

    if facet == Facet::Jkimyei {
        segs.push("jkimyei".to_string());
    }
    Ok((facet, hashimyei))
}

/// Decode one path expression. All malformed inputs fail on the first
/// violation encountered; no partial result is produced.
pub fn decode(text: &str, registry: &HashNameRegistry) -> DslResult<CanonicalPath> {
    let raw = text.to_string();
    let core = split_core(text)?;

    let mut segments: Vec<String> = core.path_text.split('.').map(str::to_string).collect();
    let (facet, hashimyei) = canonicalize_segments(&mut segments, registry)?;

    let args = if core.has_call { parse_args(&core.args_text)? } else { Vec::new() };
    let endpoint = parse_endpoint_suffix(&core.endpoint_text)?;

    let mut kind_of_path = if core.has_call { PathKind::Call } else { PathKind::Node };
    if endpoint.is_some() && kind_of_path != PathKind::Call {
        kind_of_path = PathKind::Endpoint;
    }

    let mut canonical_identity = segments.join(".");
    if core.has_call {
        canonical_identity.push('(');
        canonical_identity.push_str(&canonical_args(&args));
        canonical_identity.push(')');
    }

    let (directive, kind, canonical_endpoint) = match &endpoint {
        Some(ep) => {
            let endpoint_text =
                format!("{}{}{}", canonical_identity, ep.directive.token(), ep.kind.token());
            (Some(ep.directive), Some(ep.kind), endpoint_text)
        }
        None => (None, None, String::new()),
    };

    let canonical = if canonical_endpoint.is_empty() {
        canonical_identity.clone()
    } else {
        canonical_endpoint.clone()
    };

    let identity_hash_name = registry.assign(&format!("{canonical_identity}.self"));
    let endpoint_hash_name = if canonical_endpoint.is_empty() {
        String::new()
    } else {
        registry.assign(&format!("{canonical_endpoint}.self"))
    };

    Ok(CanonicalPath {
        raw,
        kind_of_path,
        segments,
        args,
        facet,
        hashimyei,
        directive,
        kind,
        canonical_identity,
        canonical_endpoint,
        canonical,
        identity_hash_name,
        endpoint_hash_name,
    })
}

/// Runtime node path: canonical identity with the hashimyei tag appended
/// when the identity does not already carry it. Used everywhere circuit
/// instance paths and wave paths are compared.
pub fn runtime_node_path(path: &CanonicalPath) -> String {
    let mut out = path.canonical_identity.clone();
    if !path.hashimyei.is_empty() {
        let suffix = format!(".{}", path.hashimyei);
        if !out.ends_with(&suffix) {
            out.push_str(&suffix);
        }
    }
    out
}
