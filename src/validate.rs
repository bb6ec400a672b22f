//! cohort validation - one schema check before any model branch runs

use std::collections::HashSet;

use serde::Serialize;

use crate::cohort::{Cohort, FieldKind, Schema, SubjectRecord};
use crate::error::{Result, RiskError};

/// output of [`validate`]: the complete-case cohort plus how many rows were dropped
#[derive(Debug, Clone)]
pub struct Validated {
    pub cohort: Cohort,
    pub excluded: usize,
}

/// complete-case filter against a model's required fields.
///
/// fails (nothing partial) when a field isn't declared, a present value has
/// the wrong type, or no rows survive.
pub fn validate<S: AsRef<str>>(cohort: &Cohort, required: &[S]) -> Result<Validated> {
    let schema = cohort.schema();
    let required: Vec<&str> = required.iter().map(|s| s.as_ref()).collect();

    let missing: Vec<String> = required
        .iter()
        .filter(|name| !schema.contains(name))
        .map(|name| name.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(RiskError::schema(missing, "required field not in schema"));
    }

    for &name in &required {
        let Some(kind) = schema.kind(name) else { continue };
        if let Some(bad) = cohort
            .iter()
            .find_map(|r| r.get(name).filter(|v| !kind.accepts(v)).map(|v| (r.id(), v)))
        {
            return Err(RiskError::schema(
                [name],
                format!("subject {} has a {} value, expected {:?}", bad.0, bad.1.kind_name(), kind),
            ));
        }
    }

    let kept: Vec<SubjectRecord> = cohort
        .iter()
        .filter(|r| required.iter().all(|f| r.has(f)))
        .cloned()
        .collect();
    let excluded = cohort.len() - kept.len();

    if kept.is_empty() {
        return Err(RiskError::schema(
            required.iter().copied(),
            format!("no complete rows left ({excluded} excluded)"),
        ));
    }
    if excluded > 0 {
        log::info!("validation dropped {excluded} of {} rows with missing required fields", cohort.len());
    }

    Ok(Validated {
        cohort: cohort.derive(kept),
        excluded,
    })
}

/// fields a new record must carry before it's accepted into the store
pub const ENTRY_REQUIRED: [&str; 4] = ["Age", "Sex", "Employment_Status", "Healthcare_Role"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldIssue {
    pub field: String,
    pub message: String,
}

/// entry-form checks on a single record: required fields, types, ranges,
/// allowed category values, unknown columns
pub fn check_record(schema: &Schema, record: &SubjectRecord) -> Vec<FieldIssue> {
    let mut issues = Vec::new();
    let mut issue = |field: &str, message: String| {
        issues.push(FieldIssue { field: field.to_string(), message });
    };

    for name in ENTRY_REQUIRED {
        let blank = match record.get(name) {
            None => true,
            Some(v) => v.as_text().is_some_and(|s| s.trim().is_empty()),
        };
        if blank {
            issue(name, format!("{name} is required"));
        }
    }

    for (name, value) in record.values() {
        let Some(kind) = schema.kind(name) else {
            issue(name, "not a known field".to_string());
            continue;
        };
        if !kind.accepts(value) {
            issue(name, format!("expected {}, got {}", describe(kind), value.kind_name()));
        } else if !kind.admits(value) {
            issue(name, format!("{} outside {}", value.label(), describe(kind)));
        }
    }

    issues
}

fn describe(kind: &FieldKind) -> String {
    match kind {
        FieldKind::Integer { min, max } => match (min, max) {
            (Some(lo), Some(hi)) => format!("integer {lo}..={hi}"),
            (Some(lo), None) => format!("integer >= {lo}"),
            (None, Some(hi)) => format!("integer <= {hi}"),
            (None, None) => "integer".to_string(),
        },
        FieldKind::Real => "finite real".to_string(),
        FieldKind::Boolean => "boolean".to_string(),
        FieldKind::Category(values) => format!("one of {}", values.join("/")),
        FieldKind::Text => "text".to_string(),
        FieldKind::Date => "date".to_string(),
    }
}

/// per-column completeness
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnQuality {
    pub name: String,
    pub missing: usize,
    pub missing_pct: f64,
    pub unique: usize,
}

/// missing / distinct counts for every schema column, in schema order
pub fn data_quality(cohort: &Cohort) -> Vec<ColumnQuality> {
    let n = cohort.len();
    cohort
        .schema()
        .field_names()
        .map(|name| {
            let mut distinct = HashSet::new();
            let mut missing = 0;
            for record in cohort {
                match record.get(name) {
                    Some(v) => {
                        distinct.insert(v.label());
                    }
                    None => missing += 1,
                }
            }
            ColumnQuality {
                name: name.to_string(),
                missing,
                missing_pct: if n == 0 { 0.0 } else { 100.0 * missing as f64 / n as f64 },
                unique: distinct.len(),
            }
        })
        .collect()
}
