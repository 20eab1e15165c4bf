//! Field projection and sorting for process listings.

use std::cmp::Ordering;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::ProcessError;
use super::models::{ProcessRecord, ProcessStatus};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl FromStr for SortOrder {
    type Err = ProcessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "asc" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            other => Err(ProcessError::BadRequest(format!(
                "sortOrder must be 'asc' or 'desc', got '{other}'"
            ))),
        }
    }
}

/// Raw listing parameters as a caller supplies them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessQuery {
    pub status: Option<String>,
    /// Comma-separated field names.
    pub fields: Option<String>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
}

impl ProcessQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_fields(mut self, fields: impl Into<String>) -> Self {
        self.fields = Some(fields.into());
        self
    }

    pub fn sorted_by(mut self, field: impl Into<String>, order: impl Into<String>) -> Self {
        self.sort_by = Some(field.into());
        self.sort_order = Some(order.into());
        self
    }
}

/// Split a `"a,b , c"` field list; `None` or an empty list selects everything.
pub fn parse_fields(fields: Option<&str>) -> Option<Vec<String>> {
    let parsed: Vec<String> = fields?
        .split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_string)
        .collect();
    if parsed.is_empty() {
        None
    } else {
        Some(parsed)
    }
}

/// Serialize `record`, keeping only `fields` when given. Unknown names are skipped.
pub fn project(record: &ProcessRecord, fields: Option<&[String]>) -> Result<Value, ProcessError> {
    let value = serde_json::to_value(record)
        .map_err(|e| ProcessError::Store(format!("serialize process {}: {e}", record.id)))?;
    let Some(fields) = fields else {
        return Ok(value);
    };
    let Value::Object(full) = value else {
        return Ok(value);
    };
    let projected: Map<String, Value> = fields
        .iter()
        .filter_map(|field| full.get(field).map(|v| (field.clone(), v.clone())))
        .collect();
    Ok(Value::Object(projected))
}

/// Filter, sort and project `records` per `query`.
pub fn run_query(
    records: Vec<ProcessRecord>,
    query: &ProcessQuery,
) -> Result<Vec<Value>, ProcessError> {
    let order = match query.sort_order.as_deref() {
        Some(raw) => raw.parse::<SortOrder>()?,
        None => SortOrder::Asc,
    };
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            raw.parse::<ProcessStatus>()
                .map_err(ProcessError::BadRequest)?,
        ),
        None => None,
    };

    let mut full: Vec<Map<String, Value>> = Vec::with_capacity(records.len());
    for record in records
        .iter()
        .filter(|r| status.map(|s| r.status == s).unwrap_or(true))
    {
        if let Value::Object(map) = project(record, None)? {
            full.push(map);
        }
    }

    if let Some(sort_by) = query.sort_by.as_deref() {
        // Unset optional fields are absent, so a schema field can still be missing
        // from every record. An empty result has nothing to sort.
        if !full.is_empty() && !full.iter().any(|r| r.contains_key(sort_by)) {
            return Err(ProcessError::BadRequest(format!(
                "sortBy field '{sort_by}' is not present on any process"
            )));
        }
        full.sort_by(|a, b| {
            let ord = compare_values(a.get(sort_by), b.get(sort_by));
            match order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        });
    }

    let fields = parse_fields(query.fields.as_deref());
    Ok(full
        .into_iter()
        .map(|map| match &fields {
            Some(fields) => Value::Object(
                fields
                    .iter()
                    .filter_map(|f| map.get(f).map(|v| (f.clone(), v.clone())))
                    .collect(),
            ),
            None => Value::Object(map),
        })
        .collect())
}

/// Missing and null sort first; numbers numerically; everything else by text.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(x), Some(y)) => x.to_string().cmp(&y.to_string()),
    }
}
