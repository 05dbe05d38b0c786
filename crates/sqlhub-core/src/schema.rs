//! Schema introspection traits and metadata types

use crate::{Result, ValueKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Schema introspection interface exposed by connections
#[async_trait]
pub trait SchemaIntrospection: Send + Sync {
    /// List all schemas in the current database
    async fn list_schemas(&self) -> Result<Vec<SchemaInfo>>;

    /// List all tables and views in a schema
    async fn list_tables(&self, schema: Option<&str>) -> Result<Vec<TableInfo>>;

    /// Get columns for a table
    async fn get_columns(&self, schema: Option<&str>, table: &str) -> Result<Vec<ColumnInfo>>;

    /// Get the primary key for a table
    async fn get_primary_key(
        &self,
        schema: Option<&str>,
        table: &str,
    ) -> Result<Option<PrimaryKeyInfo>>;

    /// Get indexes for a table
    async fn get_indexes(&self, schema: Option<&str>, table: &str) -> Result<Vec<IndexInfo>>;

    /// Get foreign keys for a table
    async fn get_foreign_keys(
        &self,
        schema: Option<&str>,
        table: &str,
    ) -> Result<Vec<ForeignKeyInfo>>;

    /// Get the full structural description of a table.
    ///
    /// The default assembles the pieces from the other methods; drivers
    /// that can fetch everything in fewer round trips override it.
    async fn get_table(&self, schema: Option<&str>, table: &str) -> Result<TableDetails> {
        let columns = self.get_columns(schema, table).await?;
        let primary_key = self.get_primary_key(schema, table).await?;
        let indexes = self.get_indexes(schema, table).await?;
        let foreign_keys = self.get_foreign_keys(schema, table).await?;
        Ok(TableDetails {
            schema: schema.map(|s| s.to_string()),
            name: table.to_string(),
            columns,
            primary_key,
            indexes,
            foreign_keys,
        })
    }
}

/// Schema (namespace) information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaInfo {
    pub name: String,
}

/// Table type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableType {
    Table,
    View,
}

/// Basic table information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableInfo {
    pub schema: Option<String>,
    pub name: String,
    pub table_type: TableType,
}

/// Column structural metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    /// Ordinal position (0-based)
    pub ordinal: usize,
    /// Engine-native type name
    pub data_type: String,
    /// Canonical kind the engine type maps into
    pub kind: ValueKind,
    pub nullable: bool,
    pub default_value: Option<String>,
    pub is_primary_key: bool,
    pub is_auto_increment: bool,
    pub is_unique: bool,
    pub foreign_key: Option<ForeignKeyRef>,
}

/// Foreign key target recorded on a column
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKeyRef {
    pub schema: Option<String>,
    pub table: String,
    pub column: String,
}

/// Primary key information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimaryKeyInfo {
    pub name: Option<String>,
    pub columns: Vec<String>,
}

/// Index information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub columns: Vec<String>,
    pub is_unique: bool,
    pub is_primary: bool,
}

/// Foreign key constraint information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeignKeyInfo {
    pub name: String,
    pub columns: Vec<String>,
    pub referenced_schema: Option<String>,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
}

/// Full structural description of a table.
///
/// Tables reference each other only through name-based `ForeignKeyRef`
/// records, so metadata with FK cycles stays acyclic in ownership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableDetails {
    pub schema: Option<String>,
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub primary_key: Option<PrimaryKeyInfo>,
    pub indexes: Vec<IndexInfo>,
    pub foreign_keys: Vec<ForeignKeyInfo>,
}

impl TableDetails {
    /// The column set that uniquely identifies a row, if one exists.
    ///
    /// A table is editable iff this is non-empty: the declared primary key
    /// wins, otherwise the first unique index whose columns are all
    /// non-nullable.
    pub fn unique_identity(&self) -> Option<Vec<String>> {
        if let Some(pk) = &self.primary_key
            && !pk.columns.is_empty()
        {
            return Some(pk.columns.clone());
        }

        self.indexes
            .iter()
            .filter(|idx| idx.is_unique && !idx.columns.is_empty())
            .find(|idx| {
                idx.columns.iter().all(|col| {
                    self.columns
                        .iter()
                        .any(|c| c.name == *col && !c.nullable)
                })
            })
            .map(|idx| idx.columns.clone())
    }

    /// Look up a column by name
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }
}
