//! csv / json export and import of a cohort against its schema
//!
//! layout is one row (or object) per subject: `id` first, then the schema
//! columns in declaration order. a missing value is an empty cell in csv and
//! an absent key in json, so export followed by import gives back the same
//! rows.

use std::io::{Read, Write};

use serde_json::{Map, Number, Value as JsonValue};

use crate::cohort::{Cohort, FieldKind, Schema, SubjectId, SubjectRecord, Value};
use crate::error::{Result, RiskError};

const ID_COLUMN: &str = "id";

pub fn write_csv<W: Write>(cohort: &Cohort, writer: W) -> Result<()> {
    let schema = cohort.schema();
    let mut out = csv::Writer::from_writer(writer);

    let mut header = vec![ID_COLUMN];
    header.extend(schema.field_names());
    out.write_record(&header)?;

    for record in cohort {
        let mut row = Vec::with_capacity(header.len());
        row.push(record.id().to_string());
        for name in schema.field_names() {
            row.push(record.get(name).map(Value::label).unwrap_or_default());
        }
        out.write_record(&row)?;
    }
    out.flush()?;
    Ok(())
}

/// columns may come in any order; every column must be declared in `schema`
pub fn read_csv<R: Read>(schema: &Schema, reader: R) -> Result<Cohort> {
    let mut input = csv::Reader::from_reader(reader);
    let header: Vec<String> = input.headers()?.iter().map(str::to_string).collect();

    let id_col = header
        .iter()
        .position(|h| h == ID_COLUMN)
        .ok_or_else(|| RiskError::schema([ID_COLUMN], "csv has no id column"))?;
    let unknown: Vec<&str> = header
        .iter()
        .enumerate()
        .filter(|&(i, h)| i != id_col && !schema.contains(h))
        .map(|(_, h)| h.as_str())
        .collect();
    if !unknown.is_empty() {
        return Err(RiskError::schema(unknown, "column not in schema"));
    }
    let columns: Vec<(usize, &str, &FieldKind)> = header
        .iter()
        .enumerate()
        .filter(|&(i, _)| i != id_col)
        .filter_map(|(i, h)| schema.kind(h).map(|k| (i, h.as_str(), k)))
        .collect();

    let mut records = Vec::new();
    for row in input.records() {
        let row = row?;
        let raw_id = row.get(id_col).unwrap_or_default();
        let id = raw_id
            .trim()
            .parse::<u64>()
            .map_err(|_| RiskError::parse(ID_COLUMN, raw_id))?;

        let mut record = SubjectRecord::new(SubjectId(id));
        for &(i, name, kind) in &columns {
            match row.get(i) {
                Some(cell) if !cell.is_empty() => record = record.with(name, kind.parse(name, cell)?),
                _ => {}
            }
        }
        records.push(record);
    }

    log::debug!("read {} rows from csv", records.len());
    Cohort::new(schema.clone(), records)
}

/// pretty-printed array of objects
pub fn write_json<W: Write>(cohort: &Cohort, writer: W) -> Result<()> {
    let rows: Vec<JsonValue> = cohort
        .iter()
        .map(|record| {
            let mut object = Map::new();
            object.insert(ID_COLUMN.to_string(), JsonValue::from(record.id().0));
            for name in cohort.schema().field_names() {
                if let Some(value) = record.get(name) {
                    object.insert(name.to_string(), to_json(value));
                }
            }
            JsonValue::Object(object)
        })
        .collect();
    serde_json::to_writer_pretty(writer, &rows)?;
    Ok(())
}

pub fn read_json<R: Read>(schema: &Schema, reader: R) -> Result<Cohort> {
    let rows: Vec<Map<String, JsonValue>> = serde_json::from_reader(reader)?;

    let mut records = Vec::with_capacity(rows.len());
    for object in rows {
        let id = object
            .get(ID_COLUMN)
            .and_then(JsonValue::as_u64)
            .ok_or_else(|| RiskError::schema([ID_COLUMN], "object without a numeric id"))?;

        let mut record = SubjectRecord::new(SubjectId(id));
        for (name, json) in &object {
            if name == ID_COLUMN || json.is_null() {
                continue;
            }
            let kind = schema
                .kind(name)
                .ok_or_else(|| RiskError::schema([name.as_str()], "field not in schema"))?;
            record = record.with(name.as_str(), from_json(kind, name, json)?);
        }
        records.push(record);
    }

    log::debug!("read {} rows from json", records.len());
    Cohort::new(schema.clone(), records)
}

fn to_json(value: &Value) -> JsonValue {
    match value {
        Value::Int(v) => JsonValue::from(*v),
        Value::Real(v) => Number::from_f64(*v).map_or(JsonValue::Null, JsonValue::Number),
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::Text(s) => JsonValue::String(s.clone()),
        Value::Date(_) => JsonValue::String(value.label()),
    }
}

fn from_json(kind: &FieldKind, field: &str, json: &JsonValue) -> Result<Value> {
    let bad = || RiskError::parse(field, json.to_string());
    match (kind, json) {
        // strings go through the same parser as csv cells
        (_, JsonValue::String(s)) => kind.parse(field, s),
        (FieldKind::Integer { .. }, JsonValue::Number(n)) => n.as_i64().map(Value::Int).ok_or_else(bad),
        (FieldKind::Real, JsonValue::Number(n)) => n.as_f64().map(Value::Real).ok_or_else(bad),
        (FieldKind::Boolean, JsonValue::Bool(b)) => Ok(Value::Bool(*b)),
        (FieldKind::Boolean, JsonValue::Number(n)) => match n.as_i64() {
            Some(0) => Ok(Value::Bool(false)),
            Some(1) => Ok(Value::Bool(true)),
            _ => Err(bad()),
        },
        _ => Err(bad()),
    }
}
