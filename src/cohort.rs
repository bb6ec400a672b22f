//! subject records, the declared schema, and immutable cohort snapshots
//!
//! a `Cohort` is built once from whatever the record store hands over and is
//! never mutated afterwards. filtering / validation produce *new* cohorts that
//! share the schema. every snapshot carries a content hash (`CohortVersion`)
//! so results can be keyed by the exact data they were computed from.

use std::collections::{BTreeMap, HashSet};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RiskError};

/// well-known column names from the crisis schema
pub mod fields {
    pub const AGE: &str = "Age";
    pub const SEX: &str = "Sex";
    pub const EMPLOYMENT_STATUS: &str = "Employment_Status";
    pub const HEALTHCARE_ROLE: &str = "Healthcare_Role";
    pub const WORK_STRESS_LEVEL: &str = "Work_Stress_Level";
    pub const BURNOUT_LEVEL: &str = "Burnout_Level";
    pub const SOCIAL_ISOLATION: &str = "Social_Isolation";
    pub const HOPELESSNESS: &str = "Hopelessness";
    pub const DESPAIR: &str = "Despair";
    pub const SUICIDAL_DISTRESS: &str = "Suicidal_Distress";
    pub const TIME_TO_CRISIS: &str = "Time_To_Crisis";
    pub const CRISIS_EVENT: &str = "Crisis_Event";
    pub const OBSERVATION_DATE: &str = "Observation_Date";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(pub u64);

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// a single cell value - absence from the record means "missing"
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Real(f64),
    Bool(bool),
    Text(String),
    Date(NaiveDate),
}

impl Value {
    /// numeric view (bools are 0/1), `None` for text & dates
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Real(v) => Some(*v),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Text(_) | Value::Date(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// string form used for group labels & export cells
    pub fn label(&self) -> String {
        match self {
            Value::Int(v) => v.to_string(),
            Value::Real(v) => v.to_string(),
            Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            Value::Text(s) => s.clone(),
            Value::Date(d) => d.format(DATE_FORMAT).to_string(),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "integer",
            Value::Real(_) => "real",
            Value::Bool(_) => "boolean",
            Value::Text(_) => "text",
            Value::Date(_) => "date",
        }
    }

    fn hash_into<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Int(v) => v.hash(state),
            Value::Real(v) => v.to_bits().hash(state),
            Value::Bool(b) => b.hash(state),
            Value::Text(s) => s.hash(state),
            Value::Date(d) => d.hash(state),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::Date(v)
    }
}

pub(crate) const DATE_FORMAT: &str = "%Y-%m-%d";
const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// declared type of a column
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Integer { min: Option<i64>, max: Option<i64> },
    Real,
    Boolean,
    Category(Vec<String>),
    Text,
    Date,
}

impl FieldKind {
    /// 0..=10 questionnaire score
    pub fn score() -> Self {
        FieldKind::Integer { min: Some(0), max: Some(10) }
    }

    /// non-negative count
    pub fn count() -> Self {
        FieldKind::Integer { min: Some(0), max: None }
    }

    pub fn category<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FieldKind::Category(values.into_iter().map(Into::into).collect())
    }

    /// does the value have the right *type* for this column
    pub fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (FieldKind::Integer { .. }, Value::Int(_))
                | (FieldKind::Real, Value::Real(_) | Value::Int(_))
                | (FieldKind::Boolean, Value::Bool(_))
                | (FieldKind::Category(_), Value::Text(_))
                | (FieldKind::Text, Value::Text(_))
                | (FieldKind::Date, Value::Date(_))
        )
    }

    /// type *and* declared range / allowed set
    pub fn admits(&self, value: &Value) -> bool {
        if !self.accepts(value) {
            return false;
        }
        match (self, value) {
            (FieldKind::Integer { min, max }, Value::Int(v)) => {
                min.is_none_or(|m| *v >= m) && max.is_none_or(|m| *v <= m)
            }
            (FieldKind::Category(allowed), Value::Text(s)) => allowed.iter().any(|a| a == s),
            (FieldKind::Real, Value::Real(v)) => v.is_finite(),
            _ => true,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldKind::Integer { .. } | FieldKind::Real | FieldKind::Boolean)
    }

    /// parse a raw cell; callers handle the empty-cell = missing case
    pub fn parse(&self, field: &str, raw: &str) -> Result<Value> {
        let raw_trimmed = raw.trim();
        let bad = || RiskError::parse(field, raw);
        match self {
            FieldKind::Integer { .. } => raw_trimmed.parse::<i64>().map(Value::Int).map_err(|_| bad()),
            FieldKind::Real => raw_trimmed.parse::<f64>().map(Value::Real).map_err(|_| bad()),
            FieldKind::Boolean => match raw_trimmed.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => Ok(Value::Bool(true)),
                "0" | "false" | "no" => Ok(Value::Bool(false)),
                _ => Err(bad()),
            },
            FieldKind::Category(_) | FieldKind::Text => Ok(Value::Text(raw.to_string())),
            FieldKind::Date => NaiveDate::parse_from_str(raw_trimmed, DATE_FORMAT)
                .or_else(|_| {
                    NaiveDateTime::parse_from_str(raw_trimmed, DATETIME_FORMAT).map(|dt| dt.date())
                })
                .map(Value::Date)
                .map_err(|_| bad()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self { name: name.into(), kind }
    }
}

/// named, typed columns shared by every record of a cohort
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    version: u32,
    fields: Vec<FieldSpec>,
}

impl Schema {
    pub fn new(version: u32, fields: Vec<FieldSpec>) -> Self {
        Self { version, fields }
    }

    /// the crisis-risk table: demographics, occupation, clinical history,
    /// psychological factors, support, and the time-to-crisis outcome
    pub fn crisis() -> Self {
        use FieldKind as K;
        let yes_no = || K::category(["Yes", "No"]);
        let fields = vec![
            // demographic & socioeconomic
            FieldSpec::new("Age", K::Integer { min: Some(18), max: Some(100) }),
            FieldSpec::new("Sex", K::category(["Male", "Female", "Other"])),
            FieldSpec::new("Employment_Status", K::Text),
            FieldSpec::new("Income_Level", K::category(["Low", "Medium", "High"])),
            FieldSpec::new("Social_Deprivation", K::score()),
            FieldSpec::new("Material_Deprivation", K::score()),
            // occupation
            FieldSpec::new("Healthcare_Role", K::Text),
            FieldSpec::new("Department", K::Text),
            FieldSpec::new("Years_Experience", K::count()),
            FieldSpec::new("Weekly_Hours", K::count()),
            FieldSpec::new("Night_Shifts_Monthly", K::count()),
            FieldSpec::new("Overtime_Hours_Monthly", K::count()),
            FieldSpec::new("Patient_Facing", yes_no()),
            FieldSpec::new("Management_Responsibilities", yes_no()),
            FieldSpec::new("Work_Stress_Level", K::score()),
            FieldSpec::new("Job_Satisfaction", K::score()),
            FieldSpec::new("Workplace_Support", K::score()),
            FieldSpec::new("Burnout_Level", K::score()),
            FieldSpec::new("Sick_Days_Last_Year", K::count()),
            FieldSpec::new("Workplace_Incidents", K::count()),
            FieldSpec::new("Recent_Promotion", yes_no()),
            FieldSpec::new("Recent_Demotion", yes_no()),
            // clinical & psychiatric
            FieldSpec::new("MH_Disorders", K::Text),
            FieldSpec::new("Substance_Use_Disorders", K::Text),
            FieldSpec::new("History_Suicidal_Ideation", K::Boolean),
            FieldSpec::new("Previous_Suicide_Attempts", K::count()),
            FieldSpec::new("Frequency_Suicidal_Thoughts", K::score()),
            FieldSpec::new("Intensity_Suicidal_Thoughts", K::score()),
            // health service use
            FieldSpec::new("Chronic_Illnesses", K::Text),
            FieldSpec::new("GP_Visits", K::count()),
            FieldSpec::new("ED_Visits", K::count()),
            FieldSpec::new("Hospitalizations", K::count()),
            // psychological factors
            FieldSpec::new("Hopelessness", K::score()),
            FieldSpec::new("Despair", K::score()),
            FieldSpec::new("Impulsivity", K::score()),
            FieldSpec::new("Aggression", K::score()),
            FieldSpec::new("Access_Lethal_Means", K::score()),
            FieldSpec::new("Social_Isolation", K::score()),
            // support & resilience
            FieldSpec::new("Coping_Strategies", K::score()),
            FieldSpec::new("Measured_Resilience", K::score()),
            FieldSpec::new("MH_Service_Engagement", K::score()),
            FieldSpec::new("Supportive_Relationships", K::score()),
            // risk assessment / outcome
            FieldSpec::new("Suicidal_Distress", K::score()),
            FieldSpec::new("Time_To_Crisis", K::count()),
            FieldSpec::new("Crisis_Event", K::Boolean),
            FieldSpec::new("Observation_Date", K::Date),
        ];
        Self::new(1, fields)
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn kind(&self, name: &str) -> Option<&FieldKind> {
        self.field(name).map(|f| &f.kind)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// type and range check of one value against its declared column
    pub fn check_value(&self, field: &str, value: &Value) -> Result<()> {
        let kind = self
            .kind(field)
            .ok_or_else(|| RiskError::schema([field], "field not declared in schema"))?;
        if kind.admits(value) {
            Ok(())
        } else {
            Err(RiskError::schema(
                [field],
                format!("{} value `{}` not admitted", value.kind_name(), value.label()),
            ))
        }
    }
}

/// one subject row - immutable once built
#[derive(Debug, Clone, PartialEq)]
pub struct SubjectRecord {
    id: SubjectId,
    values: BTreeMap<String, Value>,
}

impl SubjectRecord {
    pub fn new(id: SubjectId) -> Self {
        Self { id, values: BTreeMap::new() }
    }

    /// builder-style setter, consumes the record
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(field.into(), value.into());
        self
    }

    pub fn id(&self) -> SubjectId {
        self.id
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    pub fn has(&self, field: &str) -> bool {
        self.values.contains_key(field)
    }

    pub fn number(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(Value::as_f64)
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_text)
    }

    pub fn values(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    fn hash_into<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.values.len().hash(state);
        for (k, v) in &self.values {
            k.hash(state);
            v.hash_into(state);
        }
    }
}

/// content hash of a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CohortVersion(pub u64);

impl fmt::Display for CohortVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// immutable, cheaply clonable snapshot of subject records
#[derive(Debug, Clone)]
pub struct Cohort {
    schema: Arc<Schema>,
    records: Arc<[SubjectRecord]>,
    version: CohortVersion,
}

impl Cohort {
    /// build a snapshot; subject ids must be unique and text values non-empty
    /// (an empty cell means missing, so `""` can't be told apart from absent)
    pub fn new(schema: Schema, records: Vec<SubjectRecord>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(records.len());
        if let Some(dup) = records.iter().find(|r| !seen.insert(r.id)) {
            return Err(RiskError::schema(
                ["id"],
                format!("duplicate subject id {}", dup.id),
            ));
        }
        for record in &records {
            if let Some((field, _)) = record
                .values()
                .find(|(_, v)| matches!(v, Value::Text(t) if t.is_empty()))
            {
                return Err(RiskError::schema(
                    [field],
                    format!("subject {} has an empty text value; leave the field out instead", record.id),
                ));
            }
        }
        Ok(Self::from_parts(Arc::new(schema), records))
    }

    pub(crate) fn from_parts(schema: Arc<Schema>, records: Vec<SubjectRecord>) -> Self {
        let version = Self::fingerprint(&schema, &records);
        Self {
            schema,
            records: records.into(),
            version,
        }
    }

    /// derived snapshot sharing this cohort's schema (ids already unique)
    pub(crate) fn derive(&self, records: Vec<SubjectRecord>) -> Self {
        Self::from_parts(Arc::clone(&self.schema), records)
    }

    fn fingerprint(schema: &Schema, records: &[SubjectRecord]) -> CohortVersion {
        let mut hasher = DefaultHasher::new();
        schema.version.hash(&mut hasher);
        for field in &schema.fields {
            field.name.hash(&mut hasher);
        }
        records.len().hash(&mut hasher);
        for record in records {
            record.hash_into(&mut hasher);
        }
        CohortVersion(hasher.finish())
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn records(&self) -> &[SubjectRecord] {
        &self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SubjectRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn version(&self) -> CohortVersion {
        self.version
    }

    pub fn get(&self, id: SubjectId) -> Option<&SubjectRecord> {
        self.records.iter().find(|r| r.id == id)
    }
}

impl<'a> IntoIterator for &'a Cohort {
    type Item = &'a SubjectRecord;
    type IntoIter = std::slice::Iter<'a, SubjectRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}
