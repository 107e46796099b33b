//! Static manifests shared by every tsiboard layer.
//!
//! Two tables live here:
//! - the tsi type registry: every node type the runtime can instantiate,
//!   with its domain, uniqueness rule and directive table, and
//! - the JKSPEC schema catalog: every kv-block owner the training DSL can
//!   mention, with typed keys and per-component family rules.
//!
//! Both the DSL decoders and the runtime builders validate against these
//! tables, so a hop or a spec row that survives decoding is guaranteed to
//! name a real endpoint with the right payload kind.

pub mod kinds;
pub mod registry;
pub mod schema;

pub use kinds::{DirectiveDir, DirectiveId, PayloadKind};
pub use registry::{
    find_tsi_type, is_sink_type, is_unique_instance_type, parse_tsi_type_id, tsi_type_domain,
    type_accepts_input, type_emits_output, TsiDomain, TsiTypeDesc, TsiTypeId,
    TRAINABLE_WIKIMYEI_BASES, TSI_TYPE_REGISTRY,
};
pub use schema::{owner_schemas, ComponentKind, OwnerSchema, ValueKind};
