use std::cmp::Ordering;

use serde_json::{Map, Number, Value};

use super::{EngineError, EngineResult, FindOptions, Projection, SortOrder};
use crate::types::Row;

static NULL: Value = Value::Null;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JsonType {
    Double,
    Integer,
    Number,
    String,
    Object,
    Array,
    Bool,
    Null,
}

/// True if `row` satisfies `filter`.
pub fn matches(row: &Row, filter: &Value) -> EngineResult<bool> {
    let Value::Object(clauses) = filter else {
        return Err(EngineError::Malformed("filter must be an object".to_string()));
    };
    for (key, cond) in clauses {
        let hit = match key.as_str() {
            "$and" => {
                let mut all = true;
                for sub in branches(key, cond)? {
                    if !matches(row, sub)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => any_branch(row, key, cond)?,
            "$nor" => !any_branch(row, key, cond)?,
            "$not" => !matches(row, cond)?,
            "$comment" => true,
            "$where" => return Err(EngineError::Unsupported("$where".to_string())),
            op if op.starts_with('$') => {
                return Err(EngineError::Unsupported(format!("top-level operator {op}")));
            }
            field => condition_matches(&resolve(row, field), cond)?,
        };
        if !hit {
            return Ok(false);
        }
    }
    Ok(true)
}

fn branches<'a>(key: &str, value: &'a Value) -> EngineResult<&'a [Value]> {
    match value {
        Value::Array(items) if !items.is_empty() => Ok(items),
        _ => Err(EngineError::Malformed(format!("{key} needs a non-empty array"))),
    }
}

fn any_branch(row: &Row, key: &str, value: &Value) -> EngineResult<bool> {
    for sub in branches(key, value)? {
        if matches(row, sub)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// True if `map` is an operator expression such as `{"$gt": 1}`.
pub fn is_operator_object(map: &Map<String, Value>) -> bool {
    !map.is_empty() && map.keys().all(|k| k.starts_with('$'))
}

/// Values reachable at dotted `field`, descending through arrays. A `None`
/// entry marks a path that does not exist.
pub fn resolve<'a>(row: &'a Row, field: &str) -> Vec<Option<&'a Value>> {
    let mut segments = field.split('.');
    let head = segments.next().unwrap_or_default();
    let rest: Vec<&str> = segments.collect();
    let mut out = Vec::new();
    descend(row.get(head), &rest, &mut out);
    out
}

fn descend<'a>(value: Option<&'a Value>, path: &[&str], out: &mut Vec<Option<&'a Value>>) {
    let Some((head, rest)) = path.split_first() else {
        out.push(value);
        return;
    };
    match value {
        Some(Value::Object(map)) => descend(map.get(*head), rest, out),
        Some(Value::Array(items)) => {
            if let Ok(idx) = head.parse::<usize>() {
                descend(items.get(idx), rest, out);
                return;
            }
            let before = out.len();
            for item in items {
                if let Value::Object(map) = item {
                    descend(map.get(*head), rest, out);
                }
            }
            if out.len() == before {
                out.push(None);
            }
        }
        _ => out.push(None),
    }
}

fn condition_matches(cands: &[Option<&Value>], cond: &Value) -> EngineResult<bool> {
    match cond {
        Value::Object(ops) if is_operator_object(ops) => {
            for (op, arg) in ops {
                if !operator_matches(cands, op, arg)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        _ => Ok(equals_any(cands, cond)),
    }
}

fn operator_matches(cands: &[Option<&Value>], op: &str, arg: &Value) -> EngineResult<bool> {
    let hit = match op {
        "$eq" => equals_any(cands, arg),
        "$ne" => !equals_any(cands, arg),
        "$gt" | "$lt" if arg.is_null() => false,
        "$gte" | "$lte" if arg.is_null() => equals_any(cands, &NULL),
        "$gt" => compare_any(cands, arg, |o| o == Ordering::Greater),
        "$gte" => compare_any(cands, arg, |o| o != Ordering::Less),
        "$lt" => compare_any(cands, arg, |o| o == Ordering::Less),
        "$lte" => compare_any(cands, arg, |o| o != Ordering::Greater),
        "$in" => operand_array(op, arg)?.iter().any(|t| equals_any(cands, t)),
        "$nin" => !operand_array(op, arg)?.iter().any(|t| equals_any(cands, t)),
        "$all" => {
            let items = operand_array(op, arg)?;
            !items.is_empty() && items.iter().all(|t| equals_any(cands, t))
        }
        "$exists" => cands.iter().any(Option::is_some) == truthy(arg),
        "$size" => {
            let n = arg
                .as_u64()
                .ok_or_else(|| EngineError::Malformed("$size needs a non-negative integer".to_string()))?;
            cands
                .iter()
                .any(|c| matches!(c, Some(Value::Array(items)) if items.len() as u64 == n))
        }
        "$type" => {
            let ty = parse_type(arg)?;
            cands.iter().flatten().any(|v| {
                type_matches(v, ty) || matches!(v, Value::Array(items) if items.iter().any(|i| type_matches(i, ty)))
            })
        }
        "$not" => match arg {
            Value::Object(inner) if is_operator_object(inner) => !condition_matches(cands, arg)?,
            _ => return Err(EngineError::Malformed("$not needs an operator object".to_string())),
        },
        other => return Err(EngineError::Unsupported(format!("operator {other}"))),
    };
    Ok(hit)
}

fn operand_array<'a>(op: &str, arg: &'a Value) -> EngineResult<&'a [Value]> {
    match arg {
        Value::Array(items) => Ok(items),
        _ => Err(EngineError::Malformed(format!("{op} needs an array"))),
    }
}

fn equals_any(cands: &[Option<&Value>], target: &Value) -> bool {
    cands.iter().any(|cand| match cand {
        None => target.is_null(),
        Some(v) => {
            values_equal(v, target)
                || matches!(v, Value::Array(items) if items.iter().any(|i| values_equal(i, target)))
        }
    })
}

fn compare_any(cands: &[Option<&Value>], target: &Value, pred: impl Fn(Ordering) -> bool) -> bool {
    let check = |x: &Value| type_rank(x) == type_rank(target) && pred(compare_values(x, target));
    cands.iter().flatten().any(|&v| {
        check(v) || matches!(v, Value::Array(items) if items.iter().any(|i| check(i)))
    })
}

/// Truthiness as used by `$exists` style flags.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

fn parse_type(code: &Value) -> EngineResult<JsonType> {
    let ty = match code {
        Value::Number(n) => match n.as_u64() {
            Some(1) => JsonType::Double,
            Some(2) => JsonType::String,
            Some(3) => JsonType::Object,
            Some(4) => JsonType::Array,
            Some(8) => JsonType::Bool,
            Some(10) => JsonType::Null,
            Some(16) | Some(18) => JsonType::Integer,
            _ => return Err(EngineError::Malformed(format!("unknown $type code {n}"))),
        },
        Value::String(alias) => match alias.as_str() {
            "double" => JsonType::Double,
            "string" => JsonType::String,
            "object" => JsonType::Object,
            "array" => JsonType::Array,
            "bool" => JsonType::Bool,
            "null" => JsonType::Null,
            "int" | "long" => JsonType::Integer,
            "number" => JsonType::Number,
            other => return Err(EngineError::Malformed(format!("unknown $type alias {other}"))),
        },
        _ => return Err(EngineError::Malformed("$type needs a code or alias".to_string())),
    };
    Ok(ty)
}

fn type_matches(value: &Value, ty: JsonType) -> bool {
    match ty {
        JsonType::Double => matches!(value, Value::Number(n) if n.is_f64()),
        JsonType::Integer => matches!(value, Value::Number(n) if !n.is_f64()),
        JsonType::Number => value.is_number(),
        JsonType::String => value.is_string(),
        JsonType::Object => value.is_object(),
        JsonType::Array => value.is_array(),
        JsonType::Bool => value.is_boolean(),
        JsonType::Null => value.is_null(),
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Object(_) => 3,
        Value::Array(_) => 4,
        Value::Bool(_) => 5,
    }
}

fn compare_numbers(a: &Number, b: &Number) -> Ordering {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x.cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x.cmp(&y);
    }
    let x = a.as_f64().unwrap_or(f64::NAN);
    let y = b.as_f64().unwrap_or(f64::NAN);
    x.partial_cmp(&y).unwrap_or(Ordering::Equal)
}

/// Total order over JSON values: null, numbers, strings, objects, arrays,
/// booleans.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => compare_numbers(x, y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y) {
                let o = compare_values(l, r);
                if o != Ordering::Equal {
                    return o;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((lk, lv), (rk, rv)) in x.iter().zip(y) {
                let o = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if o != Ordering::Equal {
                    return o;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => Ordering::Equal,
    }
}

/// Equality under [`compare_values`]; `1` equals `1.0`.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    compare_values(a, b) == Ordering::Equal
}

/// Sorts rows by the given keys. Missing fields sort as null.
pub fn sort_rows(rows: &mut [Row], keys: &[(String, SortOrder)]) {
    rows.sort_by(|a, b| {
        for (field, order) in keys {
            let av = resolve(a, field).into_iter().flatten().next().unwrap_or(&NULL);
            let bv = resolve(b, field).into_iter().flatten().next().unwrap_or(&NULL);
            let o = compare_values(av, bv);
            let o = match order {
                SortOrder::Ascending => o,
                SortOrder::Descending => o.reverse(),
            };
            if o != Ordering::Equal {
                return o;
            }
        }
        Ordering::Equal
    });
}

/// Applies a projection to one row.
pub fn project(row: Row, projection: &Projection) -> Row {
    match projection {
        Projection::All => row,
        Projection::Include(fields) => row
            .into_iter()
            .filter(|(k, _)| k == "_id" || fields.iter().any(|f| top_level(f) == k))
            .collect(),
        Projection::Exclude(fields) => row
            .into_iter()
            .filter(|(k, _)| !fields.iter().any(|f| top_level(f) == k))
            .collect(),
    }
}

fn top_level(field: &str) -> &str {
    field.split('.').next().unwrap_or(field)
}

/// Filters, sorts, pages and projects a row set.
pub fn select_rows<I>(rows: I, filter: &Value, options: &FindOptions) -> EngineResult<Vec<Row>>
where
    I: IntoIterator<Item = Row>,
{
    let mut out = Vec::new();
    for row in rows {
        if matches(&row, filter)? {
            out.push(row);
        }
    }
    if !options.sort.is_empty() {
        sort_rows(&mut out, &options.sort);
    }
    let skip = usize::try_from(options.skip).unwrap_or(usize::MAX);
    let limit = options
        .limit
        .map(|l| usize::try_from(l).unwrap_or(usize::MAX))
        .unwrap_or(usize::MAX);
    Ok(out
        .into_iter()
        .skip(skip)
        .take(limit)
        .map(|row| project(row, &options.projection))
        .collect())
}

/// Distinct values of `field`, flattening arrays, in first-seen order.
pub fn distinct_values(rows: &[Row], field: &str) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::new();
    let mut push = |v: &Value| {
        if !out.iter().any(|seen| values_equal(seen, v)) {
            out.push(v.clone());
        }
    };
    for row in rows {
        for v in resolve(row, field).into_iter().flatten() {
            match v {
                Value::Array(items) => items.iter().for_each(&mut push),
                other => push(other),
            }
        }
    }
    out
}
