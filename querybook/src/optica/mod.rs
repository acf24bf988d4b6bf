//! The bundled optical-store demo: schema, 13-section catalog and fixtures.

use crate::catalog::{CatalogLoader, QueryCatalog};
use crate::error::Result;
use crate::schema::SchemaRegistry;
use serde_json::Value;
use std::path::Path;

pub const SCHEMA: &str = include_str!("schema.yaml");
pub const CATALOG: &str = include_str!("catalog.yaml");

const FIXTURES: &[(&str, &str)] = &[
    ("clientes", include_str!("data/clientes.json")),
    ("asesores", include_str!("data/asesores.json")),
    ("especialistas", include_str!("data/especialistas.json")),
    ("proveedores", include_str!("data/proveedores.json")),
    ("suministros", include_str!("data/suministros.json")),
    ("productos", include_str!("data/productos.json")),
    ("citas", include_str!("data/citas.json")),
    ("examenes", include_str!("data/examenes.json")),
    ("ventas", include_str!("data/ventas.json")),
];

pub fn registry() -> Result<SchemaRegistry> {
    SchemaRegistry::from_yaml_str(SCHEMA)
}

pub fn catalog(registry: &SchemaRegistry) -> Result<QueryCatalog> {
    CatalogLoader::new(registry).load_str(CATALOG)
}

/// Fixture documents per collection, still in extended-JSON form.
pub fn fixtures() -> Result<Vec<(&'static str, Vec<Value>)>> {
    FIXTURES
        .iter()
        .map(|(collection, json)| Ok((*collection, serde_json::from_str(json)?)))
        .collect()
}

/// Lay the demo out as a project directory that `Project::open` accepts.
pub fn write_project(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir.join("data"))?;
    std::fs::write(dir.join("schema.yaml"), SCHEMA)?;
    std::fs::write(dir.join("catalog.yaml"), CATALOG)?;
    for (collection, json) in FIXTURES {
        std::fs::write(dir.join("data").join(format!("{collection}.json")), json)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_every_entry_validates() {
        let registry = registry().unwrap();
        let catalog = catalog(&registry).unwrap();
        let rejected: Vec<String> = catalog
            .rejected()
            .map(|r| format!("{}: {}", r.id, r.error))
            .collect();
        assert_eq!(rejected, Vec::<String>::new());
        assert_eq!(catalog.ids().first(), Some(&"1.1"));
        assert_eq!(catalog.ids().last(), Some(&"13.3"));
    }

    #[test]
    fn test_fixtures_cover_registered_collections() {
        let registry = registry().unwrap();
        let fixtures = fixtures().unwrap();
        assert_eq!(fixtures.len(), registry.collections().count());
        for (collection, docs) in fixtures {
            assert!(registry.contains(collection), "{collection}");
            assert!(!docs.is_empty(), "{collection}");
        }
    }
}
