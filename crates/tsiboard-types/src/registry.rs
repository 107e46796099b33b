//! The tsi type registry: the static manifest of node types.
//!
//! Hop compatibility is defined entirely on this manifest. An out-directive
//! on type A can feed an in-directive on type B iff B accepts the kind A
//! emits; the target kind is always inferred from the source and never
//! re-declared in a hop.

use crate::kinds::{DirectiveDir, DirectiveId, PayloadKind};
use serde::{Deserialize, Serialize};

/// The three tsi domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TsiDomain {
    Source,
    Wikimyei,
    Sink,
}

/// Closed set of node types the runtime can instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TsiTypeId {
    SourceDataloader,
    WikimyeiRepresentationVicreg,
    SinkNull,
    SinkLogSys,
}

/// One row of a node type's directive table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectiveDesc {
    pub directive: DirectiveId,
    pub dir: DirectiveDir,
    pub kind: PayloadKind,
}

const fn d(directive: DirectiveId, dir: DirectiveDir, kind: PayloadKind) -> DirectiveDesc {
    DirectiveDesc { directive, dir, kind }
}

/// Manifest entry for one node type.
#[derive(Debug, Clone, Copy)]
pub struct TsiTypeDesc {
    pub id: TsiTypeId,
    pub domain: TsiDomain,
    /// Canonical path of the type (no hashimyei tag).
    pub canonical: &'static str,
    /// At most one instance per circuit when true.
    pub unique_per_circuit: bool,
    pub directives: &'static [DirectiveDesc],
}

/// The full manifest, declaration order stable.
pub static TSI_TYPE_REGISTRY: &[TsiTypeDesc] = &[
    TsiTypeDesc {
        id: TsiTypeId::SourceDataloader,
        domain: TsiDomain::Source,
        canonical: "tsi.source.dataloader",
        unique_per_circuit: true,
        directives: &[
            d(DirectiveId::Payload, DirectiveDir::In, PayloadKind::Str),
            d(DirectiveId::Payload, DirectiveDir::Out, PayloadKind::Tensor),
            d(DirectiveId::Meta, DirectiveDir::Out, PayloadKind::Str),
        ],
    },
    TsiTypeDesc {
        id: TsiTypeId::WikimyeiRepresentationVicreg,
        domain: TsiDomain::Wikimyei,
        canonical: "tsi.wikimyei.representation.vicreg",
        unique_per_circuit: false,
        directives: &[
            d(DirectiveId::Payload, DirectiveDir::In, PayloadKind::Tensor),
            d(DirectiveId::Payload, DirectiveDir::Out, PayloadKind::Tensor),
            d(DirectiveId::Loss, DirectiveDir::Out, PayloadKind::Tensor),
            d(DirectiveId::Meta, DirectiveDir::Out, PayloadKind::Str),
        ],
    },
    TsiTypeDesc {
        id: TsiTypeId::SinkNull,
        domain: TsiDomain::Sink,
        canonical: "tsi.sink.null",
        unique_per_circuit: false,
        directives: &[
            d(DirectiveId::Payload, DirectiveDir::In, PayloadKind::Tensor),
            d(DirectiveId::Payload, DirectiveDir::In, PayloadKind::Str),
            d(DirectiveId::Loss, DirectiveDir::In, PayloadKind::Tensor),
            d(DirectiveId::Meta, DirectiveDir::In, PayloadKind::Str),
        ],
    },
    TsiTypeDesc {
        id: TsiTypeId::SinkLogSys,
        domain: TsiDomain::Sink,
        canonical: "tsi.sink.log.sys",
        unique_per_circuit: false,
        directives: &[
            d(DirectiveId::Payload, DirectiveDir::In, PayloadKind::Str),
            d(DirectiveId::Loss, DirectiveDir::In, PayloadKind::Tensor),
            d(DirectiveId::Meta, DirectiveDir::In, PayloadKind::Str),
        ],
    },
];

/// Canonical identities of trainable wikimyei bases; only these accept the
/// `jkimyei` facet on their canonical path.
pub static TRAINABLE_WIKIMYEI_BASES: &[&str] = &["tsi.wikimyei.representation.vicreg"];

pub fn find_tsi_type(id: TsiTypeId) -> &'static TsiTypeDesc {
    TSI_TYPE_REGISTRY
        .iter()
        .find(|t| t.id == id)
        .expect("registry covers every TsiTypeId")
}

/// Resolve a canonical identity (no hashimyei tag) to a type id. A trailing
/// `.{hashimyei}` segment on wikimyei paths is stripped before matching.
pub fn parse_tsi_type_id(canonical_identity: &str) -> Option<TsiTypeId> {
    let text = canonical_identity.trim();
    for desc in TSI_TYPE_REGISTRY {
        if text == desc.canonical {
            return Some(desc.id);
        }
        // wikimyei instances carry a hashimyei tag as a fifth segment
        if desc.domain == TsiDomain::Wikimyei {
            if let Some(rest) = text.strip_prefix(desc.canonical) {
                if let Some(tag) = rest.strip_prefix('.') {
                    if !tag.is_empty() && !tag.contains('.') {
                        return Some(desc.id);
                    }
                }
            }
        }
    }
    None
}

pub fn is_sink_type(id: TsiTypeId) -> bool {
    find_tsi_type(id).domain == TsiDomain::Sink
}

pub fn is_unique_instance_type(id: TsiTypeId) -> bool {
    find_tsi_type(id).unique_per_circuit
}

pub fn tsi_type_domain(id: TsiTypeId) -> TsiDomain {
    find_tsi_type(id).domain
}

/// True iff `id` declares `(directive, kind)` as an output.
pub fn type_emits_output(id: TsiTypeId, directive: DirectiveId, kind: PayloadKind) -> bool {
    find_tsi_type(id)
        .directives
        .iter()
        .any(|s| s.dir == DirectiveDir::Out && s.directive == directive && s.kind == kind)
}

/// True iff `id` accepts `kind` on in-directive `directive`.
pub fn type_accepts_input(id: TsiTypeId, directive: DirectiveId, kind: PayloadKind) -> bool {
    find_tsi_type(id)
        .directives
        .iter()
        .any(|s| s.dir == DirectiveDir::In && s.directive == directive && s.kind == kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_identities_resolve() {
        assert_eq!(
            parse_tsi_type_id("tsi.source.dataloader"),
            Some(TsiTypeId::SourceDataloader)
        );
        assert_eq!(
            parse_tsi_type_id("tsi.wikimyei.representation.vicreg"),
            Some(TsiTypeId::WikimyeiRepresentationVicreg)
        );
        assert_eq!(
            parse_tsi_type_id("tsi.wikimyei.representation.vicreg.lumen_the_drifter"),
            Some(TsiTypeId::WikimyeiRepresentationVicreg)
        );
        assert_eq!(parse_tsi_type_id("tsi.sink.missing"), None);
        // sinks take no hashimyei suffix
        assert_eq!(parse_tsi_type_id("tsi.sink.null.extra"), None);
    }

    #[test]
    fn hop_compatibility_is_kind_checked() {
        assert!(type_emits_output(
            TsiTypeId::SourceDataloader,
            DirectiveId::Payload,
            PayloadKind::Tensor
        ));
        assert!(!type_emits_output(
            TsiTypeId::SourceDataloader,
            DirectiveId::Payload,
            PayloadKind::Str
        ));
        assert!(type_accepts_input(
            TsiTypeId::SinkLogSys,
            DirectiveId::Loss,
            PayloadKind::Tensor
        ));
        // log sink refuses tensors on @payload
        assert!(!type_accepts_input(
            TsiTypeId::SinkLogSys,
            DirectiveId::Payload,
            PayloadKind::Tensor
        ));
        assert!(type_accepts_input(
            TsiTypeId::SinkNull,
            DirectiveId::Payload,
            PayloadKind::Tensor
        ));
    }

    #[test]
    fn source_is_unique_per_circuit() {
        assert!(is_unique_instance_type(TsiTypeId::SourceDataloader));
        assert!(!is_unique_instance_type(TsiTypeId::SinkNull));
    }
}
