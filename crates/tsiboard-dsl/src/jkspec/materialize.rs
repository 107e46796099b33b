//! Flatten a validated JKSPEC document into the table-of-tables model.
//!
//! Row-id scheme:
//! - `components_table`: one row per component (the active profile),
//!   `row_id = <component_id>`.
//! - `component_profiles_table` and every family table: one row per
//!   profile, `row_id = <component_id>@<profile_name>`.
//! - optimizer/scheduler/loss tables: one row per profile,
//!   `row_id = <profile_row>::optimizer|scheduler|loss`.
//! - `vicreg_augmentations`: one row per curve of the augmentation set the
//!   active profile references.

use super::parser::{ComponentAst, DocumentAst, KvList, ProfileAst};
use super::tables::{JkSpecs, Row, ROW_ID};
use super::validate::{find_augmentations, find_profile};
use crate::error::{DslError, DslResult};

fn options_kv_string(kv: &KvList) -> String {
    let mut out = String::new();
    for (i, (key, value)) in kv.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(key);
        out.push('=');
        if value.contains(',') || value.contains(' ') {
            out.push('"');
            out.push_str(value);
            out.push('"');
        } else {
            out.push_str(value);
        }
    }
    out
}

fn append_kv(row: &mut Row, kv: &KvList) {
    for (key, value) in kv {
        row.insert(key.clone(), value.clone());
    }
}

fn push_row(out: &mut JkSpecs, table: &str, row: Row) {
    out.tables.entry(table.to_string()).or_default().push(row);
}

fn base_row(row_id: &str, component_id: &str) -> Row {
    let mut row = Row::new();
    row.insert(ROW_ID.to_string(), row_id.to_string());
    row.insert("component_id".to_string(), component_id.to_string());
    row
}

fn materialize_profile(
    component: &ComponentAst,
    profile: &ProfileAst,
    active: bool,
    out: &mut JkSpecs,
) {
    let profile_id = format!("{}@{}", component.id, profile.name);
    let optimizer_id = format!("{profile_id}::optimizer");
    let scheduler_id = format!("{profile_id}::scheduler");
    let loss_id = format!("{profile_id}::loss");

    if profile.optimizer.present {
        let mut row = Row::new();
        row.insert(ROW_ID.to_string(), optimizer_id.clone());
        row.insert("type".to_string(), profile.optimizer.name.clone());
        row.insert("options".to_string(), options_kv_string(&profile.optimizer.kv));
        push_row(out, "optimizers_table", row);
    }
    if profile.lr_scheduler.present {
        let mut row = Row::new();
        row.insert(ROW_ID.to_string(), scheduler_id.clone());
        row.insert("type".to_string(), profile.lr_scheduler.name.clone());
        row.insert("options".to_string(), options_kv_string(&profile.lr_scheduler.kv));
        push_row(out, "lr_schedulers_table", row);
    }
    if profile.loss.present {
        let mut row = Row::new();
        row.insert(ROW_ID.to_string(), loss_id.clone());
        row.insert("type".to_string(), profile.loss.name.clone());
        row.insert("options".to_string(), options_kv_string(&profile.loss.kv));
        push_row(out, "loss_functions_table", row);
    }

    {
        let mut row = base_row(&profile_id, &component.id);
        row.insert("component_type".to_string(), component.canonical_type.clone());
        row.insert("profile_id".to_string(), profile.name.clone());
        row.insert("optimizer".to_string(), optimizer_id.clone());
        row.insert("lr_scheduler".to_string(), scheduler_id.clone());
        row.insert("loss_function".to_string(), loss_id.clone());
        row.insert("active".to_string(), if active { "true" } else { "false" }.to_string());
        if let Some(params) = &profile.component_params {
            append_kv(&mut row, params);
        }
        push_row(out, "component_profiles_table", row);
    }

    for (slot, table) in [
        (&profile.reproducibility, "component_reproducibility_table"),
        (&profile.numerics, "component_numerics_table"),
        (&profile.gradient, "component_gradient_table"),
        (&profile.checkpoint, "component_checkpoint_table"),
        (&profile.metrics, "component_metrics_table"),
        (&profile.data_ref, "component_data_ref_table"),
    ] {
        let mut row = base_row(&profile_id, &component.id);
        if let Some(kv) = slot {
            append_kv(&mut row, kv);
        }
        push_row(out, table, row);
    }

    if active {
        let mut row = Row::new();
        row.insert(ROW_ID.to_string(), component.id.clone());
        row.insert("component_type".to_string(), component.canonical_type.clone());
        row.insert("active_profile".to_string(), profile.name.clone());
        row.insert("optimizer".to_string(), optimizer_id);
        row.insert("lr_scheduler".to_string(), scheduler_id);
        row.insert("loss_function".to_string(), loss_id);
        if let Some(params) = &profile.component_params {
            append_kv(&mut row, params);
        }
        push_row(out, "components_table", row);
    }
}

fn materialize_augmentations(
    component: &ComponentAst,
    active_profile: &ProfileAst,
    out: &mut JkSpecs,
) -> DslResult<()> {
    // the active profile's reference must resolve; every declared set is
    // materialized so a wave-time profile override finds its rows too
    if let Some(set_name) = active_profile
        .component_params
        .as_ref()
        .and_then(|kv| kv.iter().find(|(k, _)| k == "augmentation_set"))
        .map(|(_, v)| v.as_str())
    {
        if find_augmentations(component, set_name).is_none() {
            return Err(DslError::schema(format!(
                "active profile '{}' references missing augmentation set '{}' in component '{}'",
                active_profile.name, set_name, component.id
            )));
        }
    }

    for set in &component.augmentation_sets {
        for curve in &set.curves {
            let mut row = Row::new();
            row.insert(ROW_ID.to_string(), "N/A".to_string());
            row.insert("augmentation_set".to_string(), set.name.clone());
            row.insert("curve".to_string(), curve.kind.clone());
            row.insert("kind".to_string(), curve.kind.clone());
            append_kv(&mut row, &curve.kv);
            push_row(out, "vicreg_augmentations", row);
        }
    }
    Ok(())
}

pub fn materialize_document(doc: &DocumentAst) -> DslResult<JkSpecs> {
    let mut out = JkSpecs::default();

    {
        let mut row = Row::new();
        row.insert(ROW_ID.to_string(), "selectors".to_string());
        append_kv(&mut row, &doc.selectors);
        push_row(&mut out, "selectors_table", row);
    }

    // every table name exists even when empty so lookups distinguish
    // "empty table" from "unknown table"
    for table in [
        "components_table",
        "component_profiles_table",
        "optimizers_table",
        "lr_schedulers_table",
        "loss_functions_table",
        "component_reproducibility_table",
        "component_numerics_table",
        "component_gradient_table",
        "component_checkpoint_table",
        "component_metrics_table",
        "component_data_ref_table",
        "vicreg_augmentations",
    ] {
        out.tables.entry(table.to_string()).or_default();
    }

    for component in &doc.components {
        let active_profile =
            find_profile(component, &component.active_profile).ok_or_else(|| {
                DslError::schema(format!(
                    "component '{}' active profile '{}' not found",
                    component.id, component.active_profile
                ))
            })?;

        for profile in &component.profiles {
            materialize_profile(
                component,
                profile,
                profile.name == component.active_profile,
                &mut out,
            );
        }

        materialize_augmentations(component, active_profile, &mut out)?;
    }

    Ok(out)
}
