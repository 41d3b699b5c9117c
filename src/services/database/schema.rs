// Catalog rows in, normalized SchemaInfo out. Every adapter feeds this
// builder so keys are qualified the same way for every engine.
use std::collections::{HashMap, HashSet};

use crate::models::{
    qualified_table_key, ColumnMetadata, ForeignKeyRef, RelationshipMetadata, SchemaInfo,
};

/// One column as read from a catalog
#[derive(Debug, Clone)]
pub struct CatalogColumn {
    pub namespace: Option<String>,
    pub table: String,
    pub column: String,
    pub data_type: String,
    pub nullable: bool,
    pub default_value: Option<String>,
    pub auto_increment: bool,
    pub ordinal: i64,
}

/// A primary-key column
#[derive(Debug, Clone)]
pub struct CatalogKey {
    pub namespace: Option<String>,
    pub table: String,
    pub column: String,
}

/// A foreign-key column and the column it references
#[derive(Debug, Clone)]
pub struct CatalogForeignKey {
    pub namespace: Option<String>,
    pub table: String,
    pub column: String,
    pub ref_namespace: Option<String>,
    pub ref_table: String,
    pub ref_column: String,
}

/// Collects catalog rows and merges them on (qualified table, column).
/// Bare table names are never used as join keys.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    columns: Vec<CatalogColumn>,
    primary_keys: HashSet<(String, String)>,
    foreign_keys: Vec<CatalogForeignKey>,
    namespaces: Vec<String>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep only tables in these namespaces. Ignored for namespace-less
    /// tables; empty keeps everything.
    pub fn with_namespaces(mut self, namespaces: &[String]) -> Self {
        self.namespaces = namespaces.to_vec();
        self
    }

    pub fn column(&mut self, column: CatalogColumn) {
        self.columns.push(column);
    }

    pub fn primary_key(&mut self, key: CatalogKey) {
        let table = qualified_table_key(key.namespace.as_deref(), &key.table);
        self.primary_keys.insert((table, key.column));
    }

    pub fn foreign_key(&mut self, fk: CatalogForeignKey) {
        self.foreign_keys.push(fk);
    }

    fn keeps(&self, namespace: Option<&str>) -> bool {
        match namespace {
            Some(ns) if !self.namespaces.is_empty() => self.namespaces.iter().any(|n| n == ns),
            _ => true,
        }
    }

    pub fn build(mut self) -> SchemaInfo {
        self.columns.sort_by_key(|c| c.ordinal);

        let mut references: HashMap<(String, String), ForeignKeyRef> = HashMap::new();
        let mut relationships = Vec::new();
        for fk in &self.foreign_keys {
            if !self.keeps(fk.namespace.as_deref()) {
                continue;
            }
            let from = qualified_table_key(fk.namespace.as_deref(), &fk.table);
            let to = qualified_table_key(fk.ref_namespace.as_deref(), &fk.ref_table);

            references.insert(
                (from.clone(), fk.column.clone()),
                ForeignKeyRef {
                    table: to.clone(),
                    column: fk.ref_column.clone(),
                },
            );
            relationships.push(RelationshipMetadata {
                from,
                from_column: fk.column.clone(),
                to,
                to_column: fk.ref_column.clone(),
            });
        }

        let mut schema = SchemaInfo::default();
        for col in &self.columns {
            if !self.keeps(col.namespace.as_deref()) {
                continue;
            }
            let table = qualified_table_key(col.namespace.as_deref(), &col.table);
            let key = (table.clone(), col.column.clone());
            let reference = references.get(&key).cloned();

            schema.tables.entry(table).or_default().push(ColumnMetadata {
                name: col.column.clone(),
                data_type: col.data_type.clone(),
                nullable: col.nullable,
                primary_key: self.primary_keys.contains(&key),
                foreign_key: reference.is_some(),
                auto_increment: col.auto_increment,
                default_value: col.default_value.clone(),
                references: reference,
            });
        }

        relationships.sort_by(|a, b| {
            (&a.from, &a.from_column, &a.to, &a.to_column).cmp(&(&b.from, &b.from_column, &b.to, &b.to_column))
        });
        relationships.dedup();
        schema.relationships = relationships;
        schema
    }
}
