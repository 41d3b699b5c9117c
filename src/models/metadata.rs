use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Key a table as `"<namespace>.<table>"`, or just `"<table>"` for engines
/// with no namespace concept. Every map key and relationship endpoint in a
/// [`SchemaInfo`] goes through this function.
pub fn qualified_table_key(namespace: Option<&str>, table: &str) -> String {
    match namespace.filter(|ns| !ns.is_empty()) {
        Some(ns) => format!("{}.{}", ns, table),
        None => table.to_string(),
    }
}

/// Qualified target of a foreign key column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKeyRef {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMetadata {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub primary_key: bool,
    pub foreign_key: bool,
    pub auto_increment: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub references: Option<ForeignKeyRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationshipMetadata {
    pub from: String,
    pub from_column: String,
    pub to: String,
    pub to_column: String,
}

/// Normalized description of a database's shape
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaInfo {
    pub tables: BTreeMap<String, Vec<ColumnMetadata>>,
    pub relationships: Vec<RelationshipMetadata>,
}

impl SchemaInfo {
    pub fn table(&self, qualified_key: &str) -> Option<&[ColumnMetadata]> {
        self.tables.get(qualified_key).map(Vec::as_slice)
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    /// SHA-256 over the canonical JSON form. `tables` is ordered, so two
    /// introspections of an unchanged database hash identically.
    pub fn content_hash(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&canonical))
    }
}

/// Knobs for [`crate::services::database::DatabaseAdapter::get_schema`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaOptions {
    /// Restrict to these namespaces; empty means every user namespace
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default)]
    pub include_views: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str) -> ColumnMetadata {
        ColumnMetadata {
            name: name.to_string(),
            data_type: "int".to_string(),
            nullable: false,
            primary_key: false,
            foreign_key: false,
            auto_increment: false,
            default_value: None,
            references: None,
        }
    }

    #[test]
    fn test_qualified_table_key() {
        assert_eq!(qualified_table_key(Some("SalesLT"), "Product"), "SalesLT.Product");
        assert_eq!(qualified_table_key(None, "users"), "users");
        assert_eq!(qualified_table_key(Some(""), "users"), "users");
    }

    #[test]
    fn test_content_hash_is_stable() {
        let mut a = SchemaInfo::default();
        a.tables.insert("b".into(), vec![column("id")]);
        a.tables.insert("a".into(), vec![column("id")]);

        let mut b = SchemaInfo::default();
        b.tables.insert("a".into(), vec![column("id")]);
        b.tables.insert("b".into(), vec![column("id")]);

        assert_eq!(a.content_hash(), b.content_hash());
        assert_eq!(a.content_hash().len(), 64);

        b.tables.insert("c".into(), vec![column("id")]);
        assert_ne!(a.content_hash(), b.content_hash());
    }
}
