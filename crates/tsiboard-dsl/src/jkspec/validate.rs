//! Schema validation of a parsed JKSPEC document.
//!
//! Each kv block is checked against its owner in the catalog: unknown keys,
//! kind mismatches and missing required keys are all fatal. Component
//! family rules, ACTIVE_PROFILE resolution, augmentation-set references and
//! the SELECTORS mapping are enforced here, before materialization.

use super::parser::{AugmentationsAst, ComponentAst, DocumentAst, KvList, ProfileAst};
use crate::error::{DslError, DslResult};
use tsiboard_types::schema::{
    family_rules_for, owner_schema, ComponentKind, SchemaFamily, SELECTOR_FIELDS,
};

fn find_kv<'a>(kv: &'a KvList, key: &str) -> Option<&'a str> {
    kv.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

pub(super) fn find_profile<'a>(c: &'a ComponentAst, name: &str) -> Option<&'a ProfileAst> {
    c.profiles.iter().find(|p| p.name == name)
}

pub(super) fn find_augmentations<'a>(
    c: &'a ComponentAst,
    name: &str,
) -> Option<&'a AugmentationsAst> {
    c.augmentation_sets.iter().find(|a| a.name == name)
}

fn validate_kv_with_owner(kv: &KvList, owner: &str, context: &str) -> DslResult<()> {
    let schema = owner_schema(owner).ok_or_else(|| {
        DslError::schema(format!("{context} references unknown schema owner '{owner}'"))
    })?;

    for (key, value) in kv {
        let kind = schema.key_kinds.get(key.as_str()).ok_or_else(|| {
            DslError::schema(format!("{context} uses unknown key '{key}' for owner '{owner}'"))
        })?;
        if !kind.matches(value) {
            return Err(DslError::schema(format!(
                "{context} key '{key}' expects {} but got '{value}'",
                kind.name()
            )));
        }
    }
    for required in &schema.required_keys {
        if find_kv(kv, required).is_none() {
            return Err(DslError::schema(format!(
                "{context} is missing required key '{required}' for owner '{owner}'"
            )));
        }
    }
    Ok(())
}

fn validate_selectors(doc: &DocumentAst) -> DslResult<()> {
    if doc.selectors.is_empty() {
        return Ok(());
    }

    const EXPECTED_MAP_KEYS: [&str; 2] = ["COMPONENT_ID_KEY", "PROFILE_ID_KEY"];
    let mut seen_values = Vec::new();

    for (map_key, value) in &doc.selectors {
        if !EXPECTED_MAP_KEYS.contains(&map_key.as_str()) {
            return Err(DslError::schema(format!("SELECTORS contains unknown map key '{map_key}'")));
        }
        if !SELECTOR_FIELDS.contains(&value.as_str()) {
            return Err(DslError::schema(format!(
                "SELECTORS key '{map_key}' maps to unknown ini selector '{value}'"
            )));
        }
        if seen_values.contains(value) {
            return Err(DslError::schema(format!(
                "SELECTORS reuses ini selector '{value}' across multiple map keys"
            )));
        }
        seen_values.push(value.clone());
    }

    for required in EXPECTED_MAP_KEYS {
        if !doc.selectors.iter().any(|(k, _)| k == required) {
            return Err(DslError::schema(format!("SELECTORS missing required map key '{required}'")));
        }
    }
    Ok(())
}

fn family_present(component: &ComponentAst, profile: &ProfileAst, family: SchemaFamily) -> bool {
    match family {
        SchemaFamily::Optimizer => profile.optimizer.present,
        SchemaFamily::Scheduler => profile.lr_scheduler.present,
        SchemaFamily::Loss => profile.loss.present,
        SchemaFamily::ComponentParams => profile.component_params.is_some(),
        SchemaFamily::Reproducibility => profile.reproducibility.is_some(),
        SchemaFamily::Numerics => profile.numerics.is_some(),
        SchemaFamily::Gradient => profile.gradient.is_some(),
        SchemaFamily::Checkpoint => profile.checkpoint.is_some(),
        SchemaFamily::Metrics => profile.metrics.is_some(),
        SchemaFamily::DataRef => profile.data_ref.is_some(),
        SchemaFamily::Augmentations => !component.augmentation_sets.is_empty(),
    }
}

fn validate_component(component: &ComponentAst) -> DslResult<()> {
    let kind = ComponentKind::from_canonical_type(&component.canonical_type).ok_or_else(|| {
        DslError::schema(format!(
            "unknown COMPONENT canonical type '{}' for id '{}'",
            component.canonical_type, component.id
        ))
    })?;

    for set in &component.augmentation_sets {
        for curve in &set.curves {
            let mut curve_kv = curve.kv.clone();
            if find_kv(&curve_kv, "kind").is_none() {
                curve_kv.push(("kind".to_string(), curve.kind.clone()));
            }
            validate_kv_with_owner(
                &curve_kv,
                "augmentation.curve",
                &format!(
                    "COMPONENT '{}' AUGMENTATIONS '{}' CURVE '{}'",
                    component.id, set.name, curve.kind
                ),
            )?;
        }
    }

    if find_profile(component, &component.active_profile).is_none() {
        return Err(DslError::schema(format!(
            "COMPONENT '{}' ACTIVE_PROFILE '{}' does not match any PROFILE",
            component.id, component.active_profile
        )));
    }

    for profile in &component.profiles {
        let context = format!("COMPONENT '{}' PROFILE '{}'", component.id, profile.name);

        for rule in family_rules_for(kind) {
            let present = family_present(component, profile, rule.family);
            if rule.required && !present {
                return Err(DslError::schema(format!(
                    "{context} missing required family '{}'",
                    rule.family.token()
                )));
            }
            if !rule.required && present {
                return Err(DslError::schema(format!(
                    "{context} has forbidden family '{}'",
                    rule.family.token()
                )));
            }
        }

        if profile.optimizer.present {
            validate_kv_with_owner(
                &profile.optimizer.kv,
                &format!("optimizer.{}", profile.optimizer.name),
                &format!("{context} OPTIMIZER"),
            )?;
        }
        if profile.lr_scheduler.present {
            validate_kv_with_owner(
                &profile.lr_scheduler.kv,
                &format!("scheduler.{}", profile.lr_scheduler.name),
                &format!("{context} LR_SCHEDULER"),
            )?;
        }
        if profile.loss.present {
            validate_kv_with_owner(
                &profile.loss.kv,
                &format!("loss.{}", profile.loss.name),
                &format!("{context} LOSS"),
            )?;
        }
        if let Some(params) = &profile.component_params {
            validate_kv_with_owner(
                params,
                &format!("component.{}", kind.token()),
                &format!("{context} COMPONENT_PARAMS"),
            )?;
            if let Some(set_name) = find_kv(params, "augmentation_set") {
                if find_augmentations(component, set_name).is_none() {
                    return Err(DslError::schema(format!(
                        "{context} references undefined augmentation_set '{set_name}'"
                    )));
                }
            }
        }
        for (slot, owner, label) in [
            (&profile.reproducibility, "reproducibility", "REPRODUCIBILITY"),
            (&profile.numerics, "numerics", "NUMERICS"),
            (&profile.gradient, "gradient", "GRADIENT"),
            (&profile.checkpoint, "checkpoint", "CHECKPOINT"),
            (&profile.metrics, "metrics", "METRICS"),
            (&profile.data_ref, "data_ref", "DATA_REF"),
        ] {
            if let Some(kv) = slot {
                validate_kv_with_owner(kv, owner, &format!("{context} {label}"))?;
            }
        }
    }

    Ok(())
}

pub fn validate_document(doc: &DocumentAst) -> DslResult<()> {
    validate_selectors(doc)?;
    for component in &doc.components {
        validate_component(component)?;
    }
    Ok(())
}
