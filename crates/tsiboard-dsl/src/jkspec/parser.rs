//! Recursive-descent parser for the JKSPEC grammar.
//!
//! ```text
//! document       := "JKSPEC" scalar selectors? component+
//! selectors      := "SELECTORS" kv_block
//! component      := "COMPONENT" string string "{" (profile | augmentations | active_profile)+ "}"
//! active_profile := "ACTIVE_PROFILE" ":" scalar
//! profile        := "PROFILE" string "{" profile_body "}"
//! kv_block       := "{" (identifier ":" value)* "}"
//! value          := scalar | "[" (scalar ("," scalar)*)? "]"
//! scalar         := string | identifier
//! ```
//!
//! Lists flatten to CSV. Duplicate named blocks, duplicate keys, duplicate
//! profile names, duplicate curve kinds and duplicate component ids are
//! parse errors here; typed validation happens afterwards.

use super::lexer::{Lexer, Token, TokenKind};
use crate::error::{DslError, DslResult};
use std::collections::BTreeSet;

pub type KvList = Vec<(String, String)>;

#[derive(Debug, Clone, Default)]
pub struct NamedKvBlock {
    pub name: String,
    pub kv: KvList,
    pub present: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ProfileAst {
    pub name: String,
    pub optimizer: NamedKvBlock,
    pub lr_scheduler: NamedKvBlock,
    pub loss: NamedKvBlock,
    pub component_params: Option<KvList>,
    pub reproducibility: Option<KvList>,
    pub numerics: Option<KvList>,
    pub gradient: Option<KvList>,
    pub checkpoint: Option<KvList>,
    pub metrics: Option<KvList>,
    pub data_ref: Option<KvList>,
}

#[derive(Debug, Clone)]
pub struct CurveAst {
    pub kind: String,
    pub kv: KvList,
}

#[derive(Debug, Clone)]
pub struct AugmentationsAst {
    pub name: String,
    pub curves: Vec<CurveAst>,
}

#[derive(Debug, Clone)]
pub struct ComponentAst {
    pub canonical_type: String,
    pub id: String,
    pub profiles: Vec<ProfileAst>,
    pub augmentation_sets: Vec<AugmentationsAst>,
    pub active_profile: String,
}

#[derive(Debug, Clone)]
pub struct DocumentAst {
    pub version: String,
    pub selectors: KvList,
    pub components: Vec<ComponentAst>,
}

pub struct Parser {
    lex: Lexer,
}

impl Parser {
    pub fn new(src: &str) -> Self {
        Parser { lex: Lexer::new(src) }
    }

    pub fn parse(mut self) -> DslResult<DocumentAst> {
        self.expect_identifier("JKSPEC")?;
        let version = self.parse_scalar()?;

        let mut selectors = KvList::new();
        if self.peek_is_identifier("SELECTORS")? {
            self.lex.next()?;
            selectors = self.parse_kv_block()?;
        }

        let mut components = Vec::new();
        let mut seen_ids = BTreeSet::new();
        while self.lex.peek()?.kind != TokenKind::End {
            let component = self.parse_component()?;
            if !seen_ids.insert(component.id.clone()) {
                return Err(DslError::schema(format!(
                    "duplicate COMPONENT id '{}'",
                    component.id
                )));
            }
            components.push(component);
        }

        if components.is_empty() {
            return Err(DslError::schema("JKSPEC requires at least one COMPONENT block"));
        }

        Ok(DocumentAst { version, selectors, components })
    }

    fn peek_is_identifier(&mut self, expected: &str) -> DslResult<bool> {
        let tok = self.lex.peek()?;
        Ok(tok.kind == TokenKind::Identifier && tok.text == expected)
    }

    fn peek_is_symbol(&mut self, sym: char) -> DslResult<bool> {
        let tok = self.lex.peek()?;
        Ok(tok.kind == TokenKind::Symbol && tok.text.len() == 1 && tok.text.starts_with(sym))
    }

    fn try_consume_symbol(&mut self, sym: char) -> DslResult<bool> {
        if self.peek_is_symbol(sym)? {
            self.lex.next()?;
            return Ok(true);
        }
        Ok(false)
    }

    fn expect_symbol(&mut self, sym: char) -> DslResult<Token> {
        let tok = self.lex.next()?;
        if tok.kind == TokenKind::Symbol && tok.text.len() == 1 && tok.text.starts_with(sym) {
            return Ok(tok);
        }
        Err(DslError::parse(tok.location, format!("expected symbol '{sym}', got '{}'", tok.text)))
    }

    fn expect_identifier_any(&mut self) -> DslResult<Token> {
        let tok = self.lex.next()?;
        if tok.kind != TokenKind::Identifier {
            return Err(DslError::parse(tok.location, "expected identifier"));
        }
        Ok(tok)
    }

    fn expect_identifier(&mut self, expected: &str) -> DslResult<()> {
        let tok = self.expect_identifier_any()?;
        if tok.text != expected {
            return Err(DslError::parse(
                tok.location,
                format!("expected '{expected}', got '{}'", tok.text),
            ));
        }
        Ok(())
    }

    fn expect_string(&mut self) -> DslResult<String> {
        let tok = self.lex.next()?;
        if tok.kind != TokenKind::Str {
            return Err(DslError::parse(tok.location, "expected string literal"));
        }
        Ok(tok.text)
    }

    fn parse_scalar(&mut self) -> DslResult<String> {
        let tok = self.lex.next()?;
        match tok.kind {
            TokenKind::Str => Ok(tok.text),
            TokenKind::Identifier => {
                if tok.text.eq_ignore_ascii_case("true") {
                    Ok("true".to_string())
                } else if tok.text.eq_ignore_ascii_case("false") {
                    Ok("false".to_string())
                } else {
                    Ok(tok.text)
                }
            }
            _ => Err(DslError::parse(tok.location, "expected scalar value")),
        }
    }

    fn parse_value(&mut self) -> DslResult<String> {
        if self.try_consume_symbol('[')? {
            let mut items = Vec::new();
            if !self.try_consume_symbol(']')? {
                loop {
                    items.push(self.parse_scalar()?);
                    if self.try_consume_symbol(']')? {
                        break;
                    }
                    self.expect_symbol(',')?;
                }
            }
            return Ok(items.join(","));
        }
        self.parse_scalar()
    }

    fn parse_kv_block(&mut self) -> DslResult<KvList> {
        let mut kv = KvList::new();
        let mut seen = BTreeSet::new();
        self.expect_symbol('{')?;
        while !self.try_consume_symbol('}')? {
            let key_tok = self.expect_identifier_any()?;
            if !seen.insert(key_tok.text.clone()) {
                return Err(DslError::parse(
                    key_tok.location,
                    format!("duplicate key '{}'", key_tok.text),
                ));
            }
            self.expect_symbol(':')?;
            let value = self.parse_value()?;
            kv.push((key_tok.text, value));
        }
        Ok(kv)
    }

    fn parse_profile(&mut self) -> DslResult<ProfileAst> {
        self.expect_identifier("PROFILE")?;
        let mut profile = ProfileAst { name: self.expect_string()?, ..Default::default() };
        self.expect_symbol('{')?;

        while !self.try_consume_symbol('}')? {
            let tok = self.lex.peek()?;
            match tok.text.as_str() {
                "OPTIMIZER" => {
                    if profile.optimizer.present {
                        return Err(DslError::parse(
                            tok.location,
                            format!("duplicate OPTIMIZER block in PROFILE '{}'", profile.name),
                        ));
                    }
                    self.lex.next()?;
                    profile.optimizer =
                        NamedKvBlock { name: self.expect_string()?, kv: self.parse_kv_block()?, present: true };
                }
                "LR_SCHEDULER" => {
                    if profile.lr_scheduler.present {
                        return Err(DslError::parse(
                            tok.location,
                            format!("duplicate LR_SCHEDULER block in PROFILE '{}'", profile.name),
                        ));
                    }
                    self.lex.next()?;
                    profile.lr_scheduler =
                        NamedKvBlock { name: self.expect_string()?, kv: self.parse_kv_block()?, present: true };
                }
                "LOSS" => {
                    if profile.loss.present {
                        return Err(DslError::parse(
                            tok.location,
                            format!("duplicate LOSS block in PROFILE '{}'", profile.name),
                        ));
                    }
                    self.lex.next()?;
                    profile.loss =
                        NamedKvBlock { name: self.expect_string()?, kv: self.parse_kv_block()?, present: true };
                }
                "COMPONENT_PARAMS" => {
                    self.parse_family_block(&mut profile.component_params, "COMPONENT_PARAMS", &tok)?
                }
                "REPRODUCIBILITY" => {
                    self.parse_family_block(&mut profile.reproducibility, "REPRODUCIBILITY", &tok)?
                }
                "NUMERICS" => self.parse_family_block(&mut profile.numerics, "NUMERICS", &tok)?,
                "GRADIENT" => self.parse_family_block(&mut profile.gradient, "GRADIENT", &tok)?,
                "CHECKPOINT" => {
                    self.parse_family_block(&mut profile.checkpoint, "CHECKPOINT", &tok)?
                }
                "METRICS" => self.parse_family_block(&mut profile.metrics, "METRICS", &tok)?,
                "DATA_REF" => self.parse_family_block(&mut profile.data_ref, "DATA_REF", &tok)?,
                _ => {
                    let bad = self.lex.next()?;
                    return Err(DslError::parse(
                        bad.location,
                        format!("unexpected token '{}' in PROFILE '{}'", bad.text, profile.name),
                    ));
                }
            }
        }

        Ok(profile)
    }

    fn parse_family_block(
        &mut self,
        slot: &mut Option<KvList>,
        label: &str,
        tok: &Token,
    ) -> DslResult<()> {
        if slot.is_some() {
            return Err(DslError::parse(tok.location, format!("duplicate {label} block")));
        }
        self.lex.next()?;
        *slot = Some(self.parse_kv_block()?);
        Ok(())
    }

    fn parse_augmentations(&mut self) -> DslResult<AugmentationsAst> {
        self.expect_identifier("AUGMENTATIONS")?;
        let name = self.expect_string()?;
        self.expect_symbol('{')?;
        let mut curves = Vec::new();
        let mut kinds = BTreeSet::new();
        while !self.try_consume_symbol('}')? {
            self.expect_identifier("CURVE")?;
            let kind = self.expect_string()?;
            if !kinds.insert(kind.clone()) {
                return Err(DslError::schema(format!(
                    "duplicate CURVE '{kind}' in AUGMENTATIONS '{name}'"
                )));
            }
            let kv = self.parse_kv_block()?;
            curves.push(CurveAst { kind, kv });
        }
        Ok(AugmentationsAst { name, curves })
    }

    fn parse_component(&mut self) -> DslResult<ComponentAst> {
        self.expect_identifier("COMPONENT")?;
        let canonical_type = self.expect_string()?;
        let id = self.expect_string()?;
        self.expect_symbol('{')?;

        let mut profiles = Vec::new();
        let mut augmentation_sets: Vec<AugmentationsAst> = Vec::new();
        let mut active_profile = String::new();
        let mut active_set = false;
        let mut profile_names = BTreeSet::new();
        let mut augmentation_names = BTreeSet::new();

        while !self.try_consume_symbol('}')? {
            if self.peek_is_identifier("PROFILE")? {
                let profile = self.parse_profile()?;
                if !profile_names.insert(profile.name.clone()) {
                    return Err(DslError::schema(format!(
                        "duplicate PROFILE '{}' in COMPONENT '{id}'",
                        profile.name
                    )));
                }
                profiles.push(profile);
                continue;
            }
            if self.peek_is_identifier("AUGMENTATIONS")? {
                let set = self.parse_augmentations()?;
                if !augmentation_names.insert(set.name.clone()) {
                    return Err(DslError::schema(format!(
                        "duplicate AUGMENTATIONS '{}' in COMPONENT '{id}'",
                        set.name
                    )));
                }
                augmentation_sets.push(set);
                continue;
            }
            if self.peek_is_identifier("ACTIVE_PROFILE")? {
                let tok = self.lex.next()?;
                if active_set {
                    return Err(DslError::parse(
                        tok.location,
                        format!("duplicate ACTIVE_PROFILE in COMPONENT '{id}'"),
                    ));
                }
                self.expect_symbol(':')?;
                active_profile = self.parse_scalar()?;
                active_set = true;
                continue;
            }

            let bad = self.lex.next()?;
            return Err(DslError::parse(
                bad.location,
                format!("unexpected token '{}' in COMPONENT '{id}'", bad.text),
            ));
        }

        if profiles.is_empty() {
            return Err(DslError::schema(format!("COMPONENT '{id}' has no PROFILE blocks")));
        }
        if !active_set {
            return Err(DslError::schema(format!(
                "COMPONENT '{id}' missing ACTIVE_PROFILE (no silent defaults allowed)"
            )));
        }

        Ok(ComponentAst { canonical_type, id, profiles, augmentation_sets, active_profile })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        JKSPEC 2.0
        COMPONENT "tsi.sink.null" "SINK_A" {
          PROFILE "baseline" {
            COMPONENT_PARAMS { comment: "noop" }
          }
          ACTIVE_PROFILE: "baseline"
        }
    "#;

    #[test]
    fn parses_minimal_document() {
        let doc = Parser::new(MINIMAL).parse().unwrap();
        assert_eq!(doc.version, "2.0");
        assert_eq!(doc.components.len(), 1);
        assert_eq!(doc.components[0].active_profile, "baseline");
    }

    #[test]
    fn list_values_flatten_to_csv() {
        let src = r#"
            JKSPEC 1
            COMPONENT "tsi.sink.null" "S" {
              PROFILE "p" { COMPONENT_PARAMS { comment: "x" } }
              AUGMENTATIONS "a" { CURVE "Linear" { kind: "Linear" } }
              ACTIVE_PROFILE: "p"
            }
        "#;
        // list syntax goes through parse_value; checked via a kv block
        let mut parser = Parser::new("{ xs: [1, 2, 3] }");
        let kv = parser.parse_kv_block().unwrap();
        assert_eq!(kv[0], ("xs".to_string(), "1,2,3".to_string()));
        assert!(Parser::new(src).parse().is_ok());
    }

    #[test]
    fn duplicate_profile_rejected() {
        let src = r#"
            JKSPEC 1
            COMPONENT "tsi.sink.null" "S" {
              PROFILE "p" { COMPONENT_PARAMS { comment: "x" } }
              PROFILE "p" { COMPONENT_PARAMS { comment: "y" } }
              ACTIVE_PROFILE: "p"
            }
        "#;
        assert!(Parser::new(src).parse().is_err());
    }

    #[test]
    fn missing_active_profile_rejected() {
        let src = r#"
            JKSPEC 1
            COMPONENT "tsi.sink.null" "S" {
              PROFILE "p" { COMPONENT_PARAMS { comment: "x" } }
            }
        "#;
        let err = Parser::new(src).parse().unwrap_err();
        assert!(err.to_string().contains("ACTIVE_PROFILE"));
    }

    #[test]
    fn duplicate_kv_key_rejected() {
        let mut parser = Parser::new("{ a: 1 a: 2 }");
        assert!(parser.parse_kv_block().is_err());
    }

    #[test]
    fn empty_document_rejected() {
        assert!(Parser::new("JKSPEC 1").parse().is_err());
    }
}
