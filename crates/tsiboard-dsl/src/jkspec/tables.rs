//! Decoded training spec: a table of tables, plus the strict accessor and
//! option-parsing layer the training-setup builders use.
//!
//! Every row carries the `row_id` column. Lookups that miss are schema
//! errors; there are no silent defaults anywhere in this layer.

use crate::error::{DslError, DslResult};
use serde::Serialize;
use std::collections::BTreeMap;

pub const ROW_ID: &str = "row_id";

pub type Row = BTreeMap<String, String>;
pub type Table = Vec<Row>;

/// The materialized table-of-tables form of one JKSPEC document.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JkSpecs {
    pub tables: BTreeMap<String, Table>,
}

impl JkSpecs {
    pub fn table(&self, name: &str) -> DslResult<&Table> {
        self.tables
            .get(name)
            .ok_or_else(|| DslError::schema(format!("table '{name}' not found")))
    }

    pub fn row(&self, table_name: &str, row_id: &str) -> DslResult<&Row> {
        let table = self.table(table_name)?;
        find_row_by_id(table, row_id).ok_or_else(|| {
            DslError::schema(format!("row_id '{row_id}' not found in table '{table_name}'"))
        })
    }

    pub fn field(&self, table_name: &str, row_id: &str, column: &str) -> DslResult<String> {
        let row = self.row(table_name, row_id)?;
        require_column(row, column)
    }
}

pub fn find_row_by_id<'t>(table: &'t Table, row_id: &str) -> Option<&'t Row> {
    table.iter().find(|row| row.get(ROW_ID).map(String::as_str) == Some(row_id))
}

pub fn find_rows_by_field<'t>(table: &'t Table, key: &str, value: &str) -> Vec<&'t Row> {
    table.iter().filter(|row| row.get(key).map(String::as_str) == Some(value)).collect()
}

fn row_context(row: &Row) -> String {
    match row.get(ROW_ID) {
        Some(id) => format!("[row_id={id}] "),
        None => String::new(),
    }
}

pub fn require_column(row: &Row, key: &str) -> DslResult<String> {
    let value = row
        .get(key)
        .ok_or_else(|| {
            DslError::schema(format!("{}missing required column \"{key}\"", row_context(row)))
        })?;
    if value.is_empty() || value == "-" {
        return Err(DslError::schema(format!(
            "{}empty/invalid value for column \"{key}\" (got: \"{value}\")",
            row_context(row)
        )));
    }
    Ok(value.clone())
}

/// Row column names must match `expected` exactly (no missing, no extra).
pub fn require_columns_exact(row: &Row, expected: &[&str]) -> DslResult<()> {
    let missing: Vec<&str> = expected.iter().copied().filter(|k| !row.contains_key(*k)).collect();
    let extras: Vec<&String> =
        row.keys().filter(|k| !expected.contains(&k.as_str())).collect();
    if !missing.is_empty() || !extras.is_empty() {
        return Err(DslError::schema(format!(
            "{}column set mismatch. Missing: [{}]. Unexpected: [{}]",
            row_context(row),
            missing.join(", "),
            extras.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
        )));
    }
    for key in expected {
        require_column(row, key)?;
    }
    Ok(())
}

/// Parse `key=value, key2="v,with,commas"` lists; quotes shield commas and
/// are stripped from the stored value; the last occurrence of a key wins.
pub fn parse_options_kvlist(text: &str) -> DslResult<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    if text.is_empty() || text == "-" {
        return Ok(out);
    }

    let mut items = Vec::new();
    let mut cur = String::new();
    let mut quote: Option<char> = None;
    for c in text.chars() {
        match quote {
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                cur.push(c);
            }
            Some(q) if c == q => {
                quote = None;
                cur.push(c);
            }
            None if c == ',' => {
                items.push(cur.trim().to_string());
                cur.clear();
            }
            _ => cur.push(c),
        }
    }
    if !cur.trim().is_empty() {
        items.push(cur.trim().to_string());
    }

    for item in items {
        if item.is_empty() {
            continue;
        }
        let eq = item
            .find('=')
            .ok_or_else(|| DslError::schema(format!("invalid option entry (missing '='): \"{item}\"")))?;
        let key = item[..eq].trim().to_string();
        let mut value = item[eq + 1..].trim().to_string();
        if key.is_empty() {
            return Err(DslError::schema(format!("invalid option key (empty) in entry: \"{item}\"")));
        }
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            value = value[1..value.len() - 1].to_string();
        }
        out.insert(key, value);
    }
    Ok(out)
}

pub fn has_option(row: &Row, key: &str) -> DslResult<bool> {
    let options = parse_options_kvlist(&require_column(row, "options")?)?;
    Ok(options.get(key).map(|v| !v.is_empty() && v != "-").unwrap_or(false))
}

pub fn require_option(row: &Row, key: &str) -> DslResult<String> {
    let raw = require_column(row, "options")?;
    let options = parse_options_kvlist(&raw)?;
    let value = options.get(key).ok_or_else(|| {
        DslError::schema(format!(
            "{}missing required option \"{key}\". Options seen: \"{raw}\"",
            row_context(row)
        ))
    })?;
    if value.is_empty() || value == "-" {
        return Err(DslError::schema(format!(
            "{}empty/invalid value for option \"{key}\"",
            row_context(row)
        )));
    }
    Ok(value.clone())
}

/// Option keys must match `expected` exactly. Entries may be alias groups
/// (`"milestones|step_size"`): one alias of each group must be present and
/// any alias is accepted.
pub fn validate_options_exact(row: &Row, expected: &[&str]) -> DslResult<()> {
    let raw = require_column(row, "options")?;
    let options = parse_options_kvlist(&raw)?;

    let mut allowed = Vec::new();
    let mut missing_groups = Vec::new();
    for group in expected {
        let aliases: Vec<&str> = group.split('|').map(str::trim).collect();
        allowed.extend(aliases.iter().copied());
        let found = aliases
            .iter()
            .any(|a| options.get(*a).map(|v| !v.is_empty() && v != "-").unwrap_or(false));
        if !found {
            missing_groups.push(*group);
        }
    }

    let extras: Vec<&String> =
        options.keys().filter(|k| !allowed.contains(&k.as_str())).collect();
    if !missing_groups.is_empty() || !extras.is_empty() {
        return Err(DslError::schema(format!(
            "{}options mismatch. Missing: [{}]. Unexpected: [{}]. Options seen: \"{raw}\"",
            row_context(row),
            missing_groups.join(", "),
            extras.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
        )));
    }
    Ok(())
}

pub fn to_f64(text: &str) -> DslResult<f64> {
    let v: f64 = text
        .trim()
        .parse()
        .map_err(|_| DslError::schema(format!("invalid double: \"{text}\"")))?;
    if !v.is_finite() {
        return Err(DslError::schema(format!("invalid double (non-finite): \"{text}\"")));
    }
    Ok(v)
}

pub fn to_i64(text: &str) -> DslResult<i64> {
    text.trim().parse().map_err(|_| DslError::schema(format!("invalid integer: \"{text}\"")))
}

pub fn to_bool(text: &str) -> DslResult<bool> {
    match text.trim() {
        "true" | "True" | "TRUE" | "1" => Ok(true),
        "false" | "False" | "FALSE" | "0" => Ok(false),
        other => Err(DslError::schema(format!("invalid bool: \"{other}\" (expected true/false/1/0)"))),
    }
}

pub fn to_i64_list_csv(text: &str) -> DslResult<Vec<i64>> {
    let mut out = Vec::new();
    for tok in text.split(',') {
        let tok = tok.trim();
        if !tok.is_empty() {
            out.push(to_i64(tok)?);
        }
    }
    if out.is_empty() {
        return Err(DslError::schema(format!("invalid integer list CSV: \"{text}\"")));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, &str)]) -> Row {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn options_respect_quotes_and_last_wins() {
        let kv = parse_options_kvlist(r#"a=1, b="x,y", a=2"#).unwrap();
        assert_eq!(kv.get("a").map(String::as_str), Some("2"));
        assert_eq!(kv.get("b").map(String::as_str), Some("x,y"));
        assert!(parse_options_kvlist("novalue").is_err());
    }

    #[test]
    fn exact_options_with_alias_groups() {
        let r = row(&[(ROW_ID, "x"), ("options", "milestones=1,gamma=0.5")]);
        validate_options_exact(&r, &["milestones|step_size", "gamma"]).unwrap();
        let bad = row(&[(ROW_ID, "x"), ("options", "gamma=0.5,extra=1")]);
        assert!(validate_options_exact(&bad, &["milestones|step_size", "gamma"]).is_err());
    }

    #[test]
    fn exact_columns() {
        let r = row(&[(ROW_ID, "x"), ("type", "Adam"), ("options", "a=1")]);
        require_columns_exact(&r, &[ROW_ID, "type", "options"]).unwrap();
        assert!(require_columns_exact(&r, &[ROW_ID, "type"]).is_err());
        assert!(require_columns_exact(&r, &[ROW_ID, "type", "options", "more"]).is_err());
    }

    #[test]
    fn casts_are_strict() {
        assert_eq!(to_f64(" 0.5 ").unwrap(), 0.5);
        assert!(to_f64("nan").is_err());
        assert_eq!(to_i64("-4").unwrap(), -4);
        assert!(to_i64("4.2").is_err());
        assert!(to_bool("TRUE").unwrap());
        assert!(to_bool("yes").is_err());
        assert_eq!(to_i64_list_csv("1, 2,3").unwrap(), vec![1, 2, 3]);
        assert!(to_i64_list_csv(" , ").is_err());
    }

    #[test]
    fn specs_lookups_fail_loud() {
        let specs = JkSpecs::default();
        assert!(specs.table("components_table").is_err());
    }
}
