//! filtering and grouped summaries for dashboards

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cohort::{Cohort, SubjectRecord, Value};
use crate::error::{Result, RiskError};

/// one row filter; a list of them is combined with AND
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    /// inclusive numeric range
    Range { field: String, min: f64, max: f64 },
    /// value (as its label) is one of the listed ones
    OneOf { field: String, values: Vec<String> },
    /// case-insensitive substring of any textual value
    Text { needle: String },
}

impl Predicate {
    pub fn range(field: impl Into<String>, min: f64, max: f64) -> Self {
        Predicate::Range { field: field.into(), min, max }
    }

    pub fn one_of<I, S>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Predicate::OneOf {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn text(needle: impl Into<String>) -> Self {
        Predicate::Text { needle: needle.into() }
    }

    /// rows missing the field never match a range / set predicate
    pub fn matches(&self, record: &SubjectRecord) -> bool {
        match self {
            Predicate::Range { field, min, max } => {
                record.number(field).is_some_and(|v| v >= *min && v <= *max)
            }
            Predicate::OneOf { field, values } => record
                .get(field)
                .is_some_and(|v| {
                    let label = v.label();
                    values.iter().any(|allowed| *allowed == label)
                }),
            Predicate::Text { needle } => {
                let needle = needle.to_lowercase();
                record.values().any(|(_, v)| match v {
                    Value::Text(s) => s.to_lowercase().contains(&needle),
                    _ => false,
                })
            }
        }
    }
}

/// rows matching every predicate, as a new snapshot (no predicates = everything)
pub fn filter(cohort: &Cohort, predicates: &[Predicate]) -> Cohort {
    let kept: Vec<SubjectRecord> = cohort
        .iter()
        .filter(|r| predicates.iter().all(|p| p.matches(r)))
        .cloned()
        .collect();
    log::debug!("filter kept {} of {} rows", kept.len(), cohort.len());
    cohort.derive(kept)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggFn {
    Mean,
    Count,
    Sum,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupSummary {
    pub group: String,
    /// rows that had both a group and a metric value
    pub n: usize,
    pub value: f64,
}

/// `agg_fn` of `metric_field` per distinct `group_field` value, sorted by group label.
/// groups with no usable rows are left out.
pub fn aggregate(
    cohort: &Cohort,
    group_field: &str,
    metric_field: &str,
    agg_fn: AggFn,
) -> Result<Vec<GroupSummary>> {
    let schema = cohort.schema();
    let undeclared: Vec<&str> = [group_field, metric_field]
        .into_iter()
        .filter(|f| !schema.contains(f))
        .collect();
    if !undeclared.is_empty() {
        return Err(RiskError::schema(undeclared, "field not in schema"));
    }
    if agg_fn != AggFn::Count && schema.kind(metric_field).is_some_and(|k| !k.is_numeric()) {
        return Err(RiskError::schema([metric_field], format!("{agg_fn:?} needs a numeric field")));
    }

    let mut groups: BTreeMap<String, (usize, f64)> = BTreeMap::new();
    for record in cohort {
        let (Some(group), Some(metric)) = (record.get(group_field), record.get(metric_field)) else {
            continue;
        };
        let value = match (agg_fn, metric.as_f64()) {
            (AggFn::Count, _) => 0.0,
            (_, Some(v)) => v,
            (_, None) => {
                return Err(RiskError::schema(
                    [metric_field],
                    format!("subject {} has a {} value, expected a number", record.id(), metric.kind_name()),
                ));
            }
        };
        let entry = groups.entry(group.label()).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += value;
    }

    Ok(groups
        .into_iter()
        .map(|(group, (n, sum))| GroupSummary {
            group,
            n,
            value: match agg_fn {
                AggFn::Mean => sum / n as f64,
                AggFn::Count => n as f64,
                AggFn::Sum => sum,
            },
        })
        .collect())
}
