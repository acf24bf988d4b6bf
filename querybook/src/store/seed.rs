use super::SqliteStore;
use crate::engine::value::{canonical_date, normalize_literal, parse_date};
use crate::error::{QueryBookError, Result};
use crate::schema::{CollectionSchema, FieldList, FieldType, SchemaRegistry};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// What a directory seed did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SeedReport {
    /// Collections reloaded, with their document counts
    pub seeded: Vec<(String, usize)>,
    /// Collections whose fixture file had not changed
    pub unchanged: Vec<String>,
    /// Fixture files that match no registered collection
    pub skipped: Vec<PathBuf>,
}

/// Rewrite extended-JSON literals and bring `date` fields into canonical
/// UTC form, so stored dates compare chronologically as strings.
pub fn normalize_document(doc: &Value, fields: &FieldList) -> std::result::Result<Value, String> {
    let mut doc = normalize_literal(doc)?;
    normalize_fields(&mut doc, fields, "")?;
    Ok(doc)
}

fn normalize_fields(doc: &mut Value, fields: &FieldList, prefix: &str) -> std::result::Result<(), String> {
    let Value::Object(map) = doc else {
        return Ok(());
    };
    for field in fields.iter() {
        if let Some(value) = map.get_mut(&field.name) {
            let path = if prefix.is_empty() {
                field.name.clone()
            } else {
                format!("{prefix}.{}", field.name)
            };
            normalize_value(value, &field.field_type, &path)?;
        }
    }
    Ok(())
}

fn normalize_value(value: &mut Value, field_type: &FieldType, path: &str) -> std::result::Result<(), String> {
    match (field_type, &*value) {
        (FieldType::Date, Value::String(text)) => {
            let date = parse_date(text).ok_or_else(|| format!("'{path}' is not a date: {text}"))?;
            *value = Value::String(canonical_date(&date));
        }
        (FieldType::Object { fields }, Value::Object(_)) => normalize_fields(value, fields, path)?,
        (FieldType::List { items }, Value::Array(_)) => {
            if let Value::Array(elements) = value {
                for element in elements {
                    normalize_value(element, items, path)?;
                }
            }
        }
        _ => {}
    }
    Ok(())
}

/// Replace a collection's documents with `docs`.
pub fn seed_collection(store: &SqliteStore, schema: &CollectionSchema, docs: Vec<Value>) -> Result<usize> {
    let normalized = docs
        .iter()
        .map(|doc| normalize_document(doc, &schema.fields))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| QueryBookError::Other(format!("fixture for '{}': {e}", schema.name)))?;
    store.clear_collection(&schema.name)?;
    let count = store.insert_many(&schema.name, normalized)?;
    log::info!("Seeded {count} documents into '{}'", schema.name);
    Ok(count)
}

/// Compute a fixture hash from (file name, mtime, size) entries.
fn compute_fixture_hash(entries: &[(String, u64, u64)]) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut sorted = entries.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = DefaultHasher::new();
    for entry in &sorted {
        entry.hash(&mut hasher);
    }
    format!("{:016x}", hasher.finish())
}

fn fixture_hash(path: &Path) -> Result<String> {
    let metadata = std::fs::metadata(path)?;
    let mtime = metadata
        .modified()?
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let name = path
        .file_name()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();
    Ok(compute_fixture_hash(&[(name, mtime, metadata.len())]))
}

/// Load `<dir>/<collection>.json` fixtures (JSON arrays) into the store.
/// Collections whose fixture is unchanged since the last seed are left as
/// they are unless `force` is set.
pub fn seed_directory(
    store: &SqliteStore,
    registry: &SchemaRegistry,
    dir: &Path,
    force: bool,
) -> Result<SeedReport> {
    let pattern = format!("{}/*.json", dir.display());
    let files: HashMap<String, PathBuf> = glob::glob(&pattern)
        .map_err(|e| QueryBookError::Other(format!("Glob error: {e}")))?
        .filter_map(|r| r.ok())
        .filter_map(|path| {
            let stem = path.file_stem()?.to_string_lossy().to_string();
            Some((stem, path))
        })
        .collect();

    let mut report = SeedReport::default();
    for (stem, path) in &files {
        if !registry.contains(stem) {
            log::warn!("Skipping fixture {} (no collection '{stem}')", path.display());
            report.skipped.push(path.clone());
        }
    }
    report.skipped.sort();

    for schema in registry.collections() {
        let Some(path) = files.get(&schema.name) else {
            log::debug!("No fixture for '{}'", schema.name);
            continue;
        };
        let hash = fixture_hash(path)?;
        if !force && store.seed_hash(&schema.name)?.as_deref() == Some(hash.as_str()) {
            report.unchanged.push(schema.name.clone());
            continue;
        }

        let content = std::fs::read_to_string(path)?;
        let docs: Vec<Value> = serde_json::from_str(&content)?;
        let count = seed_collection(store, schema, docs)?;
        store.set_seed_hash(&schema.name, &hash)?;
        report.seeded.push((schema.name.clone(), count));
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::from_yaml_str(
            r#"
collections:
  citas:
    fields:
      fecha: { type: date }
      historial:
        type: list
        items:
          type: object
          fields:
            fecha: { type: date }
  clientes:
    fields:
      nombre: { type: string }
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_normalize_dates_and_extended_json() {
        let registry = registry();
        let schema = registry.schema("citas").unwrap();
        let doc = json!({
            "_id": {"$oid": "65a1"},
            "fecha": "2025-10-25 09:30:00",
            "historial": [{"fecha": {"$date": "2025-10-01T00:00:00Z"}}]
        });
        let out = normalize_document(&doc, &schema.fields).unwrap();
        assert_eq!(
            out,
            json!({
                "_id": "65a1",
                "fecha": "2025-10-25T09:30:00.000Z",
                "historial": [{"fecha": "2025-10-01T00:00:00.000Z"}]
            })
        );
    }

    #[test]
    fn test_normalize_rejects_bad_date() {
        let registry = registry();
        let schema = registry.schema("citas").unwrap();
        let err = normalize_document(&json!({"fecha": "mañana"}), &schema.fields).unwrap_err();
        assert!(err.contains("'fecha' is not a date"));
    }

    #[test]
    fn test_seed_directory_is_incremental() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("clientes.json"),
            r#"[{"_id": "c1", "nombre": "Ana"}, {"_id": "c2", "nombre": "Luis"}]"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("bodegas.json"), "[]").unwrap();

        let store = SqliteStore::open_in_memory().unwrap();
        let registry = registry();

        let first = seed_directory(&store, &registry, dir.path(), false).unwrap();
        assert_eq!(first.seeded, vec![("clientes".to_string(), 2)]);
        assert_eq!(first.skipped, vec![dir.path().join("bodegas.json")]);

        let second = seed_directory(&store, &registry, dir.path(), false).unwrap();
        assert!(second.seeded.is_empty());
        assert_eq!(second.unchanged, vec!["clientes".to_string()]);

        let forced = seed_directory(&store, &registry, dir.path(), true).unwrap();
        assert_eq!(forced.seeded, vec![("clientes".to_string(), 2)]);
        assert_eq!(store.count("clientes").unwrap(), 2);
    }
}
