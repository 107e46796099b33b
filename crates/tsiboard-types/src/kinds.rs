//! Payload kinds and directive identifiers.
//!
//! Directives are the labeled ports of a node (`@payload`, `@loss`,
//! `@meta`); kinds are the payload types an endpoint carries (`:tensor`,
//! `:str`). Token forms match the canonical-path endpoint suffix grammar.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Payload type carried by an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PayloadKind {
    Tensor,
    Str,
}

impl PayloadKind {
    /// Canonical token, colon included.
    pub fn token(self) -> &'static str {
        match self {
            PayloadKind::Tensor => ":tensor",
            PayloadKind::Str => ":str",
        }
    }

    /// Accepts `tensor`, `:tensor`, `str`, `:str` (ASCII case-insensitive).
    pub fn parse(text: &str) -> Option<Self> {
        let t = text.trim().trim_start_matches(':').to_ascii_lowercase();
        match t.as_str() {
            "tensor" => Some(PayloadKind::Tensor),
            "str" => Some(PayloadKind::Str),
            _ => None,
        }
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Labeled input/output port of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DirectiveId {
    Payload,
    Loss,
    Meta,
}

impl DirectiveId {
    /// Canonical token, `@` included.
    pub fn token(self) -> &'static str {
        match self {
            DirectiveId::Payload => "@payload",
            DirectiveId::Loss => "@loss",
            DirectiveId::Meta => "@meta",
        }
    }

    /// Accepts `payload`, `@payload`, etc. (ASCII case-insensitive).
    pub fn parse(text: &str) -> Option<Self> {
        let t = text.trim().trim_start_matches('@').to_ascii_lowercase();
        match t.as_str() {
            "payload" => Some(DirectiveId::Payload),
            "loss" => Some(DirectiveId::Loss),
            "meta" => Some(DirectiveId::Meta),
            _ => None,
        }
    }
}

impl fmt::Display for DirectiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Direction of a directive on its owning node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DirectiveDir {
    In,
    Out,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tokens_round_trip() {
        for kind in [PayloadKind::Tensor, PayloadKind::Str] {
            assert_eq!(PayloadKind::parse(kind.token()), Some(kind));
        }
        assert_eq!(PayloadKind::parse("TENSOR"), Some(PayloadKind::Tensor));
        assert_eq!(PayloadKind::parse("bytes"), None);
    }

    #[test]
    fn directive_tokens_round_trip() {
        for d in [DirectiveId::Payload, DirectiveId::Loss, DirectiveId::Meta] {
            assert_eq!(DirectiveId::parse(d.token()), Some(d));
        }
        assert_eq!(DirectiveId::parse(" loss "), Some(DirectiveId::Loss));
        assert_eq!(DirectiveId::parse("@ctl"), None);
    }
}
