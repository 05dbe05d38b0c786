//! MySQL schema introspection over information_schema
//!
//! MySQL treats databases as schemas; when no schema is given the
//! database selected at connect time is used.

use crate::MySqlConnection;
use async_trait::async_trait;
use sqlhub_core::{
    ColumnInfo, Connection, EngineError, ForeignKeyInfo, ForeignKeyRef, IndexInfo, PrimaryKeyInfo,
    Result, SchemaInfo, SchemaIntrospection, TableInfo, TableType, Value, ValueKind,
};

/// Map an information_schema DATA_TYPE name into the canonical kind
pub(crate) fn map_mysql_type_name(data_type: &str) -> ValueKind {
    match data_type.to_lowercase().as_str() {
        "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" | "year" | "bit" => {
            ValueKind::Int64
        }
        "float" | "double" => ValueKind::Float64,
        "decimal" | "numeric" => ValueKind::Decimal,
        "date" => ValueKind::Date,
        "time" => ValueKind::Time,
        "datetime" | "timestamp" => ValueKind::Timestamp,
        "json" => ValueKind::Json,
        "binary" | "varbinary" | "tinyblob" | "blob" | "mediumblob" | "longblob" => {
            ValueKind::Bytes
        }
        _ => ValueKind::Text,
    }
}

impl MySqlConnection {
    fn resolve_schema(&self, schema: Option<&str>) -> Result<String> {
        schema
            .map(|s| s.to_string())
            .or_else(|| self.database_name().map(|s| s.to_string()))
            .ok_or_else(|| {
                EngineError::InvalidInput(
                    "no schema given and the connection has no default database".into(),
                )
            })
    }
}

#[async_trait]
impl SchemaIntrospection for MySqlConnection {
    #[tracing::instrument(skip(self))]
    async fn list_schemas(&self) -> Result<Vec<SchemaInfo>> {
        let result = self
            .query(
                "SELECT schema_name FROM information_schema.schemata \
                 WHERE schema_name NOT IN ('mysql', 'information_schema', 'performance_schema', 'sys') \
                 ORDER BY schema_name",
                &[],
            )
            .await?;

        Ok(result
            .rows
            .iter()
            .filter_map(|row| row.get(0).and_then(|v| v.as_str()))
            .map(|name| SchemaInfo {
                name: name.to_string(),
            })
            .collect())
    }

    #[tracing::instrument(skip(self))]
    async fn list_tables(&self, schema: Option<&str>) -> Result<Vec<TableInfo>> {
        let schema = self.resolve_schema(schema)?;
        let result = self
            .query(
                "SELECT table_name, table_type FROM information_schema.tables \
                 WHERE table_schema = ? ORDER BY table_name",
                &[Value::Text(schema.clone())],
            )
            .await?;

        Ok(result
            .rows
            .iter()
            .map(|row| {
                let name = row.get(0).and_then(|v| v.as_str()).unwrap_or("").to_string();
                let table_type = match row.get(1).and_then(|v| v.as_str()) {
                    Some("VIEW") => TableType::View,
                    _ => TableType::Table,
                };
                TableInfo {
                    schema: Some(schema.clone()),
                    name,
                    table_type,
                }
            })
            .collect())
    }

    #[tracing::instrument(skip(self), fields(table = %table))]
    async fn get_columns(&self, schema: Option<&str>, table: &str) -> Result<Vec<ColumnInfo>> {
        let schema = self.resolve_schema(schema)?;
        let result = self
            .query(
                "SELECT column_name, ordinal_position, data_type, is_nullable, \
                        column_default, column_key, extra \
                 FROM information_schema.columns \
                 WHERE table_schema = ? AND table_name = ? \
                 ORDER BY ordinal_position",
                &[Value::Text(schema.clone()), Value::Text(table.to_string())],
            )
            .await?;

        let foreign_keys = self.get_foreign_keys(Some(&schema), table).await?;

        let mut columns = Vec::with_capacity(result.rows.len());
        for row in &result.rows {
            let name = row.get(0).and_then(|v| v.as_str()).unwrap_or("").to_string();
            let ordinal = row.get(1).and_then(|v| v.as_i64()).unwrap_or(1).max(1) as usize - 1;
            let data_type = row.get(2).and_then(|v| v.as_str()).unwrap_or("").to_string();
            let nullable = row.get(3).and_then(|v| v.as_str()) == Some("YES");
            let default_value = row.get(4).and_then(|v| v.as_str()).map(|s| s.to_string());
            let column_key = row.get(5).and_then(|v| v.as_str()).unwrap_or("");
            let extra = row.get(6).and_then(|v| v.as_str()).unwrap_or("");

            let is_primary_key = column_key == "PRI";
            let is_unique = is_primary_key || column_key == "UNI";
            let is_auto_increment = extra.contains("auto_increment");
            let foreign_key = foreign_keys
                .iter()
                .find(|fk| fk.columns.len() == 1 && fk.columns[0] == name)
                .map(|fk| ForeignKeyRef {
                    schema: fk.referenced_schema.clone(),
                    table: fk.referenced_table.clone(),
                    column: fk.referenced_columns.first().cloned().unwrap_or_default(),
                });

            let kind = map_mysql_type_name(&data_type);
            columns.push(ColumnInfo {
                name,
                ordinal,
                data_type,
                kind,
                nullable,
                default_value,
                is_primary_key,
                is_auto_increment,
                is_unique,
                foreign_key,
            });
        }

        Ok(columns)
    }

    #[tracing::instrument(skip(self), fields(table = %table))]
    async fn get_primary_key(
        &self,
        schema: Option<&str>,
        table: &str,
    ) -> Result<Option<PrimaryKeyInfo>> {
        let schema = self.resolve_schema(schema)?;
        let result = self
            .query(
                "SELECT column_name FROM information_schema.statistics \
                 WHERE table_schema = ? AND table_name = ? AND index_name = 'PRIMARY' \
                 ORDER BY seq_in_index",
                &[Value::Text(schema), Value::Text(table.to_string())],
            )
            .await?;

        if result.rows.is_empty() {
            return Ok(None);
        }

        let columns = result
            .rows
            .iter()
            .filter_map(|row| row.get(0).and_then(|v| v.as_str()).map(|s| s.to_string()))
            .collect();

        Ok(Some(PrimaryKeyInfo {
            name: Some("PRIMARY".to_string()),
            columns,
        }))
    }

    #[tracing::instrument(skip(self), fields(table = %table))]
    async fn get_indexes(&self, schema: Option<&str>, table: &str) -> Result<Vec<IndexInfo>> {
        let schema = self.resolve_schema(schema)?;
        let result = self
            .query(
                "SELECT index_name, column_name, non_unique FROM information_schema.statistics \
                 WHERE table_schema = ? AND table_name = ? \
                 ORDER BY index_name, seq_in_index",
                &[Value::Text(schema), Value::Text(table.to_string())],
            )
            .await?;

        let mut indexes: Vec<IndexInfo> = Vec::new();
        for row in &result.rows {
            let name = row.get(0).and_then(|v| v.as_str()).unwrap_or("").to_string();
            let column = row.get(1).and_then(|v| v.as_str()).unwrap_or("").to_string();
            let non_unique = row.get(2).and_then(|v| v.as_i64()).unwrap_or(1) != 0;

            match indexes.iter_mut().find(|idx| idx.name == name) {
                Some(idx) => idx.columns.push(column),
                None => indexes.push(IndexInfo {
                    is_primary: name == "PRIMARY",
                    is_unique: !non_unique,
                    name,
                    columns: vec![column],
                }),
            }
        }

        Ok(indexes)
    }

    #[tracing::instrument(skip(self), fields(table = %table))]
    async fn get_foreign_keys(
        &self,
        schema: Option<&str>,
        table: &str,
    ) -> Result<Vec<ForeignKeyInfo>> {
        let schema = self.resolve_schema(schema)?;
        let result = self
            .query(
                "SELECT constraint_name, column_name, \
                        referenced_table_schema, referenced_table_name, referenced_column_name \
                 FROM information_schema.key_column_usage \
                 WHERE table_schema = ? AND table_name = ? \
                   AND referenced_table_name IS NOT NULL \
                 ORDER BY constraint_name, ordinal_position",
                &[Value::Text(schema), Value::Text(table.to_string())],
            )
            .await?;

        let mut keys: Vec<ForeignKeyInfo> = Vec::new();
        for row in &result.rows {
            let name = row.get(0).and_then(|v| v.as_str()).unwrap_or("").to_string();
            let column = row.get(1).and_then(|v| v.as_str()).unwrap_or("").to_string();
            let ref_schema = row.get(2).and_then(|v| v.as_str()).map(|s| s.to_string());
            let ref_table = row.get(3).and_then(|v| v.as_str()).unwrap_or("").to_string();
            let ref_column = row.get(4).and_then(|v| v.as_str()).unwrap_or("").to_string();

            match keys.iter_mut().find(|fk| fk.name == name) {
                Some(fk) => {
                    fk.columns.push(column);
                    fk.referenced_columns.push(ref_column);
                }
                None => keys.push(ForeignKeyInfo {
                    name,
                    columns: vec![column],
                    referenced_schema: ref_schema,
                    referenced_table: ref_table,
                    referenced_columns: vec![ref_column],
                }),
            }
        }

        Ok(keys)
    }
}
