//! Document access helpers: dotted paths, ordering, literal normalization.

use super::numeric::Num;
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Get the value at a dotted path. Numeric segments index arrays.
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Every value a query predicate should be tested against. Arrays of
/// objects fan out (`direcciones.ciudad` reaches each address); a numeric
/// segment selects one element (`telefonos.1`).
pub fn match_candidates<'a>(doc: &'a Value, path: &str) -> Vec<&'a Value> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    collect_candidates(doc, &segments, &mut out);
    out
}

fn collect_candidates<'a>(value: &'a Value, segments: &[&str], out: &mut Vec<&'a Value>) {
    let Some((head, rest)) = segments.split_first() else {
        out.push(value);
        return;
    };
    match value {
        Value::Object(map) => {
            if let Some(child) = map.get(*head) {
                collect_candidates(child, rest, out);
            }
        }
        Value::Array(items) => {
            if let Ok(index) = head.parse::<usize>() {
                if let Some(child) = items.get(index) {
                    collect_candidates(child, rest, out);
                }
            } else {
                for item in items.iter().filter(|item| item.is_object()) {
                    collect_candidates(item, segments, out);
                }
            }
        }
        _ => {}
    }
}

/// Aggregation-expression path semantics: traversing an array maps the rest
/// of the path over its elements. `None` means the field is missing.
pub fn expression_path(doc: &Value, path: &str) -> Option<Value> {
    let segments: Vec<&str> = path.split('.').collect();
    resolve_expression(doc, &segments)
}

fn resolve_expression(value: &Value, segments: &[&str]) -> Option<Value> {
    let Some((head, rest)) = segments.split_first() else {
        return Some(value.clone());
    };
    match value {
        Value::Object(map) => resolve_expression(map.get(*head)?, rest),
        Value::Array(items) => Some(Value::Array(
            items
                .iter()
                .filter_map(|item| resolve_expression(item, segments))
                .collect(),
        )),
        _ => None,
    }
}

/// Set a value at a dotted path, creating intermediate objects.
pub fn set_path(doc: &mut Value, path: &str, value: Value) -> Result<(), String> {
    let (parent_path, leaf) = match path.rsplit_once('.') {
        Some((parent, leaf)) => (Some(parent), leaf),
        None => (None, path),
    };

    let mut current = doc;
    if let Some(parent_path) = parent_path {
        for segment in parent_path.split('.') {
            current = match current {
                Value::Object(map) => map
                    .entry(segment.to_string())
                    .or_insert_with(|| Value::Object(Map::new())),
                Value::Array(items) => {
                    let index = segment.parse::<usize>().map_err(|_| {
                        format!("cannot create field '{segment}' in an array at '{path}'")
                    })?;
                    items
                        .get_mut(index)
                        .ok_or_else(|| format!("array index {index} out of range at '{path}'"))?
                }
                other => {
                    return Err(format!(
                        "cannot create field '{segment}' in element of type {} at '{path}'",
                        type_name(other)
                    ))
                }
            };
        }
    }

    match current {
        Value::Object(map) => {
            map.insert(leaf.to_string(), value);
            Ok(())
        }
        Value::Array(items) => {
            let index = leaf
                .parse::<usize>()
                .map_err(|_| format!("cannot create field '{leaf}' in an array at '{path}'"))?;
            let slot = items
                .get_mut(index)
                .ok_or_else(|| format!("array index {index} out of range at '{path}'"))?;
            *slot = value;
            Ok(())
        }
        other => Err(format!(
            "cannot create field '{leaf}' in element of type {} at '{path}'",
            type_name(other)
        )),
    }
}

/// Remove the value at a dotted path, returning it.
pub fn remove_path(doc: &mut Value, path: &str) -> Option<Value> {
    match path.rsplit_once('.') {
        None => doc.as_object_mut()?.shift_remove(path),
        Some((parent, leaf)) => {
            let mut current = doc;
            for segment in parent.split('.') {
                current = match current {
                    Value::Object(map) => map.get_mut(segment)?,
                    Value::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
                    _ => return None,
                };
            }
            current.as_object_mut()?.shift_remove(leaf)
        }
    }
}

/// Copy the value at `path` from `src` into `dst`, keeping its nesting.
/// Arrays of objects are projected element-wise, so `items.total` keeps the
/// `items` array with only `total` in each element.
pub fn copy_path(src: &Value, dst: &mut Map<String, Value>, path: &str) {
    let segments: Vec<&str> = path.split('.').collect();
    if let Value::Object(map) = src {
        copy_segments(map, dst, &segments);
    }
}

fn copy_segments(src: &Map<String, Value>, dst: &mut Map<String, Value>, segments: &[&str]) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };
    let Some(value) = src.get(*head) else {
        return;
    };
    if rest.is_empty() {
        dst.insert(head.to_string(), value.clone());
        return;
    }
    match value {
        Value::Object(child) => {
            let entry = dst
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Value::Object(out) = entry {
                copy_segments(child, out, rest);
            }
        }
        Value::Array(items) => {
            let objects: Vec<&Map<String, Value>> =
                items.iter().filter_map(Value::as_object).collect();
            let entry = dst
                .entry(head.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(out_items) = entry {
                while out_items.len() < objects.len() {
                    out_items.push(Value::Object(Map::new()));
                }
                for (item, out) in objects.iter().zip(out_items.iter_mut()) {
                    if let Value::Object(out) = out {
                        copy_segments(item, out, rest);
                    }
                }
            }
        }
        _ => {}
    }
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// BSON-style ordering between types: null < numbers < strings < objects < arrays < booleans.
fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Object(_) => 4,
        Value::Array(_) => 5,
        Value::Bool(_) => 8,
    }
}

/// Total order over JSON values used by `$sort`, comparisons and grouping.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            Num::from_json(x, false).compare(Num::from_json(y, false))
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (left, right) in x.iter().zip(y.iter()) {
                let ord = compare_values(left, right);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((lk, lv), (rk, rv)) in x.iter().zip(y.iter()) {
                let ord = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Equality with numeric normalization (`1 == 1.0`).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    type_rank(a) == type_rank(b) && compare_values(a, b) == Ordering::Equal
}

/// Text key under which equal values collide, so `1`, `1.0` and `{"a": 1.0}`
/// vs `{"a": 1}` group together.
pub fn canonical_key(value: &Value) -> String {
    match value {
        Value::Number(n) => match (n.as_i64(), n.as_u64(), n.as_f64()) {
            (Some(i), _, _) => i.to_string(),
            (None, Some(u), _) => u.to_string(),
            (None, None, Some(f)) if f.fract() == 0.0 && f.abs() < 9.0e18 => {
                (f as i64).to_string()
            }
            (None, None, Some(f)) => format!("{f:?}"),
            _ => n.to_string(),
        },
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonical_key).collect();
            format!("[{}]", inner.join(","))
        }
        Value::Object(map) => {
            let inner: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), canonical_key(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        other => other.to_string(),
    }
}

/// Parse the date forms found in fixtures and literals.
pub fn parse_date(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Fixed-width UTC form; lexical order equals chronological order.
pub fn canonical_date(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn date_from_extended(inner: &Value) -> Option<DateTime<Utc>> {
    match inner {
        Value::String(text) => parse_date(text),
        Value::Number(n) => Utc.timestamp_millis_opt(n.as_i64()?).single(),
        Value::Object(map) => {
            let millis = map.get("$numberLong")?;
            let millis = match millis {
                Value::String(s) => s.parse::<i64>().ok()?,
                other => other.as_i64()?,
            };
            Utc.timestamp_millis_opt(millis).single()
        }
        _ => None,
    }
}

/// Rewrite extended-JSON literals: `{"$date": ..}` becomes the canonical
/// date string, `{"$oid": ..}` becomes the plain id string.
pub fn normalize_literal(value: &Value) -> Result<Value, String> {
    match value {
        Value::Object(map) if map.len() == 1 && map.contains_key("$date") => {
            let inner = &map["$date"];
            date_from_extended(inner)
                .map(|dt| Value::String(canonical_date(&dt)))
                .ok_or_else(|| format!("invalid $date literal: {inner}"))
        }
        Value::Object(map) if map.len() == 1 && map.contains_key("$oid") => match &map["$oid"] {
            Value::String(id) => Ok(Value::String(id.clone())),
            other => Err(format!("invalid $oid literal: {other}")),
        },
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, child) in map {
                out.insert(key.clone(), normalize_literal(child)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => items
            .iter()
            .map(normalize_literal)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_path_nested_and_indexed() {
        let doc = json!({"stock": {"actual": 5}, "items": [{"cantidad": 2}, {"cantidad": 3}]});
        assert_eq!(get_path(&doc, "stock.actual"), Some(&json!(5)));
        assert_eq!(get_path(&doc, "items.1.cantidad"), Some(&json!(3)));
        assert_eq!(get_path(&doc, "items.cantidad"), None);
        assert_eq!(get_path(&doc, "stock.minimo"), None);
    }

    #[test]
    fn test_match_candidates_fan_out() {
        let doc = json!({"direcciones": [{"ciudad": "Bogotá"}, {"ciudad": "Cali"}, "loose"]});
        let found = match_candidates(&doc, "direcciones.ciudad");
        assert_eq!(found, vec![&json!("Bogotá"), &json!("Cali")]);
    }

    #[test]
    fn test_match_candidates_index() {
        let doc = json!({"telefonos": [{"numero": "1"}, {"numero": "2"}]});
        assert_eq!(match_candidates(&doc, "telefonos.1").len(), 1);
        assert!(match_candidates(&doc, "telefonos.2").is_empty());
    }

    #[test]
    fn test_expression_path_maps_over_arrays() {
        let doc = json!({"items": [{"total": 10}, {"total": 20}, {}]});
        assert_eq!(expression_path(&doc, "items.total"), Some(json!([10, 20])));
        assert_eq!(expression_path(&doc, "missing"), None);
    }

    #[test]
    fn test_set_and_remove_path() {
        let mut doc = json!({"nombre": "Lente"});
        set_path(&mut doc, "stock.actual", json!(8)).unwrap();
        assert_eq!(doc, json!({"nombre": "Lente", "stock": {"actual": 8}}));

        assert_eq!(remove_path(&mut doc, "stock.actual"), Some(json!(8)));
        assert_eq!(doc, json!({"nombre": "Lente", "stock": {}}));

        let err = set_path(&mut doc, "nombre.corto", json!("L")).unwrap_err();
        assert!(err.contains("string"));
    }

    #[test]
    fn test_copy_path_keeps_nesting() {
        let doc = json!({
            "nombre": "Aro",
            "stock": {"actual": 5, "minimo": 10},
            "items": [{"total": 10, "cantidad": 1}, {"total": 20, "cantidad": 2}]
        });
        let mut out = Map::new();
        copy_path(&doc, &mut out, "stock.actual");
        copy_path(&doc, &mut out, "items.total");
        copy_path(&doc, &mut out, "items.cantidad");
        copy_path(&doc, &mut out, "missing.field");
        assert_eq!(
            Value::Object(out),
            json!({
                "stock": {"actual": 5},
                "items": [{"total": 10, "cantidad": 1}, {"total": 20, "cantidad": 2}]
            })
        );
    }

    #[test]
    fn test_compare_values_type_order() {
        assert_eq!(compare_values(&json!(null), &json!(0)), Ordering::Less);
        assert_eq!(compare_values(&json!(5), &json!("5")), Ordering::Less);
        assert_eq!(compare_values(&json!(2), &json!(2.0)), Ordering::Equal);
        assert_eq!(compare_values(&json!("b"), &json!("a")), Ordering::Greater);
        assert!(values_equal(&json!([1, 2]), &json!([1.0, 2])));
        assert!(!values_equal(&json!(0), &json!(false)));
    }

    #[test]
    fn test_canonical_key_collapses_numeric_forms() {
        assert_eq!(canonical_key(&json!(1)), canonical_key(&json!(1.0)));
        assert_eq!(canonical_key(&json!([1, {"a": -0.0}])), canonical_key(&json!([1.0, {"a": 0}])));
        assert_ne!(canonical_key(&json!(1)), canonical_key(&json!("1")));
        assert_ne!(canonical_key(&json!(0.1)), canonical_key(&json!(0)));
    }

    #[test]
    fn test_normalize_date_literals() {
        let literal = json!({"fecha": {"$date": "2025-10-25"}});
        assert_eq!(
            normalize_literal(&literal).unwrap(),
            json!({"fecha": "2025-10-25T00:00:00.000Z"})
        );
        assert_eq!(
            normalize_literal(&json!({"$date": "2025-10-25T14:30:00-05:00"})).unwrap(),
            json!("2025-10-25T19:30:00.000Z")
        );
        assert_eq!(
            normalize_literal(&json!({"$oid": "67189a1b2c3d4e5f60719001"})).unwrap(),
            json!("67189a1b2c3d4e5f60719001")
        );
        assert!(normalize_literal(&json!({"$date": "yesterday"})).is_err());
    }
}
