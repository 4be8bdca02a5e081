//! Query parsing, policy checks and static analysis.
//!
//! A query is a JSON object mixing filter clauses with `$`-prefixed
//! directives. [`parse_query`] separates the two so that the filter can be
//! analysed by [`safety`] and [`poll`] and executed by a storage engine.

/// Field-change analysis used to skip re-running continuous queries.
pub mod poll;
/// Rewriting that keeps tombstones out of query results.
pub mod safety;

use serde_json::{Map, Value};

use crate::{
    config::StoreConfig,
    engine::SortOrder,
};

/// Query rejected before execution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    /// `$where` with JS queries disabled.
    #[error("$where queries disabled")]
    WhereDisabled,
    /// `$mapReduce` with JS queries disabled.
    #[error("$mapReduce queries disabled")]
    MapReduceDisabled,
    /// `$aggregate` with aggregate queries disabled.
    #[error("$aggregate queries disabled")]
    AggregateDisabled,
    /// `$query` wrapper used.
    #[error("$query property deprecated in queries")]
    QueryDeprecated,
    /// A directive has a value of the wrong shape.
    #[error("malformed query operator: {0}")]
    MalformedOperator(String),
    /// More than one of `$distinct`, `$aggregate`, `$mapReduce`.
    #[error("only one collection operation allowed, found {0} and {1}")]
    MultipleCollectionOperations(String, String),
    /// More than one of `$count`, `$explain`, `$map`.
    #[error("only one cursor operation allowed, found {0} and {1}")]
    MultipleCursorOperations(String, String),
    /// A cursor transform or operation next to a collection operation.
    #[error("cursor methods can't run after collection method {0}")]
    CursorAfterCollectionOperation(String),
}

impl QueryError {
    /// Stable numeric error code.
    pub fn code(&self) -> u16 {
        match self {
            Self::WhereDisabled => 4103,
            Self::MapReduceDisabled => 4104,
            Self::AggregateDisabled => 4105,
            Self::QueryDeprecated => 4106,
            Self::MalformedOperator(_) => 4107,
            Self::MultipleCollectionOperations(..) => 4108,
            Self::MultipleCursorOperations(..) => 4109,
            Self::CursorAfterCollectionOperation(_) => 4110,
        }
    }
}

/// Operation that replaces the whole result with a computed value.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionOperation {
    /// Distinct values of one field.
    Distinct {
        /// Field to collect.
        field: String,
    },
    /// Aggregation pipeline.
    Aggregate(Vec<Value>),
    /// Map-reduce job description.
    MapReduce(Map<String, Value>),
}

impl CollectionOperation {
    /// The directive name, e.g. `$distinct`.
    pub fn key(&self) -> &'static str {
        match self {
            Self::Distinct { .. } => "$distinct",
            Self::Aggregate(_) => "$aggregate",
            Self::MapReduce(_) => "$mapReduce",
        }
    }
}

/// Operation applied to the cursor of matching rows.
#[derive(Debug, Clone, PartialEq)]
pub enum CursorOperation {
    /// Number of matching rows.
    Count,
    /// Execution description.
    Explain,
    /// Server-side map function.
    Map(Value),
}

impl CursorOperation {
    /// The directive name, e.g. `$count`.
    pub fn key(&self) -> &'static str {
        match self {
            Self::Count => "$count",
            Self::Explain => "$explain",
            Self::Map(_) => "$map",
        }
    }
}

/// Cursor modifiers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CursorTransforms {
    /// Sort keys in significance order.
    pub sort: Vec<(String, SortOrder)>,
    /// Rows to skip.
    pub skip: Option<u64>,
    /// Row limit; `$limit: 0` means no limit.
    pub limit: Option<u64>,
    /// Directives passed through without interpretation.
    pub passthrough: Map<String, Value>,
}

impl CursorTransforms {
    /// True when no transform was given.
    pub fn is_empty(&self) -> bool {
        self.sort.is_empty() && self.skip.is_none() && self.limit.is_none() && self.passthrough.is_empty()
    }
}

/// A query split into its parts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedQuery {
    /// Filter clauses.
    pub filter: Map<String, Value>,
    /// At most one collection operation.
    pub collection_operation: Option<CollectionOperation>,
    /// At most one cursor operation.
    pub cursor_operation: Option<CursorOperation>,
    /// Cursor modifiers.
    pub transforms: CursorTransforms,
    paging_given: bool,
}

impl ParsedQuery {
    /// True if `$sort`, `$skip` or `$limit` was present.
    pub fn has_paging(&self) -> bool {
        self.paging_given
    }
}

const PASSTHROUGH_TRANSFORMS: &[&str] = &[
    "$batchSize",
    "$comment",
    "$hint",
    "$max",
    "$maxScan",
    "$maxTimeMS",
    "$min",
    "$noCursorTimeout",
    "$readPref",
    "$returnKey",
    "$showDiskLoc",
    "$snapshot",
];

/// Splits `query` into filter, operations and cursor transforms.
pub fn parse_query(query: &Value) -> Result<ParsedQuery, QueryError> {
    let Value::Object(input) = query else {
        return Err(QueryError::MalformedOperator("query must be an object".to_string()));
    };
    if input.contains_key("$query") {
        return Err(QueryError::QueryDeprecated);
    }

    let mut collection_op: Option<(&str, &Value)> = None;
    let mut cursor_op: Option<(&str, &Value)> = None;
    let mut transforms: Vec<(&str, &Value)> = Vec::new();
    let mut filter = Map::new();
    for (key, value) in input {
        match key.as_str() {
            k @ ("$distinct" | "$aggregate" | "$mapReduce") => {
                if let Some((existing, _)) = collection_op {
                    return Err(QueryError::MultipleCollectionOperations(existing.to_string(), key.clone()));
                }
                collection_op = Some((k, value));
            }
            k @ ("$count" | "$explain" | "$map") => {
                if let Some((existing, _)) = cursor_op {
                    return Err(QueryError::MultipleCursorOperations(existing.to_string(), key.clone()));
                }
                cursor_op = Some((k, value));
            }
            k @ ("$sort" | "$skip" | "$limit") => transforms.push((k, value)),
            k if PASSTHROUGH_TRANSFORMS.contains(&k) => transforms.push((k, value)),
            _ => {
                filter.insert(key.clone(), value.clone());
            }
        }
    }

    if let Some((key, _)) = collection_op {
        if cursor_op.is_some() || !transforms.is_empty() {
            return Err(QueryError::CursorAfterCollectionOperation(key.to_string()));
        }
    }

    let mut parsed = ParsedQuery {
        filter,
        ..ParsedQuery::default()
    };
    if let Some((key, value)) = collection_op {
        parsed.collection_operation = Some(parse_collection_operation(key, value)?);
    }
    parsed.cursor_operation = cursor_op.map(|(key, value)| match key {
        "$count" => CursorOperation::Count,
        "$explain" => CursorOperation::Explain,
        _ => CursorOperation::Map(value.clone()),
    });
    for (key, value) in transforms {
        match key {
            "$sort" => {
                parsed.transforms.sort = parse_sort(value)?;
                parsed.paging_given = true;
            }
            "$skip" => {
                parsed.transforms.skip = Some(non_negative(key, value)?);
                parsed.paging_given = true;
            }
            "$limit" => {
                let limit = non_negative(key, value)?;
                parsed.transforms.limit = (limit > 0).then_some(limit);
                parsed.paging_given = true;
            }
            "$readPref" if !value.is_object() => {
                return Err(QueryError::MalformedOperator("$readPref must be an object".to_string()));
            }
            _ => {
                parsed.transforms.passthrough.insert(key.to_string(), value.clone());
            }
        }
    }
    Ok(parsed)
}

fn parse_collection_operation(key: &str, value: &Value) -> Result<CollectionOperation, QueryError> {
    match key {
        "$distinct" => {
            let field = value
                .as_object()
                .and_then(|spec| spec.get("field"))
                .and_then(Value::as_str)
                .ok_or_else(|| QueryError::MalformedOperator("$distinct needs {field: string}".to_string()))?;
            Ok(CollectionOperation::Distinct {
                field: field.to_string(),
            })
        }
        "$aggregate" => match value {
            Value::Array(stages) => Ok(CollectionOperation::Aggregate(stages.clone())),
            _ => Err(QueryError::MalformedOperator("$aggregate must be an array".to_string())),
        },
        _ => match value {
            Value::Object(spec) => Ok(CollectionOperation::MapReduce(spec.clone())),
            _ => Err(QueryError::MalformedOperator("$mapReduce must be an object".to_string())),
        },
    }
}

fn non_negative(key: &str, value: &Value) -> Result<u64, QueryError> {
    value
        .as_u64()
        .ok_or_else(|| QueryError::MalformedOperator(format!("{key} must be a non-negative integer")))
}

fn sort_direction(value: &Value) -> Option<SortOrder> {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(d) if d > 0.0 => Some(SortOrder::Ascending),
            Some(d) if d < 0.0 => Some(SortOrder::Descending),
            _ => None,
        },
        Value::String(s) => match s.as_str() {
            "asc" | "ascending" => Some(SortOrder::Ascending),
            "desc" | "descending" => Some(SortOrder::Descending),
            _ => None,
        },
        _ => None,
    }
}

/// Parses `{field: 1 | -1}` or `[[field, dir], ...]`.
pub fn parse_sort(value: &Value) -> Result<Vec<(String, SortOrder)>, QueryError> {
    let malformed = || QueryError::MalformedOperator("$sort must map fields to 1 or -1".to_string());
    match value {
        Value::Object(spec) => spec
            .iter()
            .map(|(field, dir)| sort_direction(dir).map(|d| (field.clone(), d)).ok_or_else(malformed))
            .collect(),
        Value::Array(pairs) => pairs
            .iter()
            .map(|pair| match pair {
                Value::String(field) => Ok((field.clone(), SortOrder::Ascending)),
                Value::Array(kv) if kv.len() == 2 => {
                    let field = kv[0].as_str().ok_or_else(malformed)?;
                    let dir = sort_direction(&kv[1]).ok_or_else(malformed)?;
                    Ok((field.to_string(), dir))
                }
                _ => Err(malformed()),
            })
            .collect(),
        _ => Err(malformed()),
    }
}

/// Rejects query forms disabled by `config`.
pub fn check_policy(parsed: &ParsedQuery, config: &StoreConfig) -> Result<(), QueryError> {
    if !config.allow_js_queries {
        if contains_where(&parsed.filter) {
            return Err(QueryError::WhereDisabled);
        }
        if matches!(parsed.collection_operation, Some(CollectionOperation::MapReduce(_))) {
            return Err(QueryError::MapReduceDisabled);
        }
    }
    if !config.allow_aggregate_queries
        && matches!(parsed.collection_operation, Some(CollectionOperation::Aggregate(_)))
    {
        return Err(QueryError::AggregateDisabled);
    }
    Ok(())
}

fn contains_where(filter: &Map<String, Value>) -> bool {
    filter.iter().any(|(key, value)| match key.as_str() {
        "$where" => !value.is_null(),
        "$and" | "$or" | "$nor" => value
            .as_array()
            .is_some_and(|items| items.iter().filter_map(Value::as_object).any(contains_where)),
        "$not" => value.as_object().is_some_and(contains_where),
        _ => false,
    })
}
