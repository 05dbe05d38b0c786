//! PostgreSQL schema introspection
//!
//! Lists come from information_schema where it is sufficient; primary key
//! and index details need pg_catalog because information_schema hides
//! non-constraint indexes.

use crate::PostgresConnection;
use async_trait::async_trait;
use sqlhub_core::{
    ColumnInfo, Connection, ForeignKeyInfo, ForeignKeyRef, IndexInfo, PrimaryKeyInfo, Result,
    SchemaInfo, SchemaIntrospection, TableInfo, TableType, Value, ValueKind,
};

/// Map an information_schema data_type name into the canonical kind
pub(crate) fn map_pg_type_name(data_type: &str) -> ValueKind {
    match data_type.to_lowercase().as_str() {
        "boolean" => ValueKind::Bool,
        "smallint" | "integer" | "bigint" | "smallserial" | "serial" | "bigserial" => {
            ValueKind::Int64
        }
        "real" | "double precision" => ValueKind::Float64,
        "numeric" | "decimal" | "money" => ValueKind::Decimal,
        "bytea" => ValueKind::Bytes,
        "uuid" => ValueKind::Uuid,
        "json" | "jsonb" => ValueKind::Json,
        "date" => ValueKind::Date,
        "interval" => ValueKind::Interval,
        other => {
            if other.starts_with("timestamp") {
                ValueKind::Timestamp
            } else if other.starts_with("time") {
                ValueKind::Time
            } else {
                ValueKind::Text
            }
        }
    }
}

impl PostgresConnection {
    fn schema_or_default<'a>(&'a self, schema: Option<&'a str>) -> &'a str {
        schema.unwrap_or_else(|| self.default_schema())
    }
}

#[async_trait]
impl SchemaIntrospection for PostgresConnection {
    #[tracing::instrument(skip(self))]
    async fn list_schemas(&self) -> Result<Vec<SchemaInfo>> {
        let result = self
            .query(
                "SELECT schema_name FROM information_schema.schemata \
                 WHERE schema_name NOT IN ('pg_catalog', 'information_schema') \
                 AND schema_name NOT LIKE 'pg_toast%' AND schema_name NOT LIKE 'pg_temp%' \
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

    #[tracing::instrument(skip(self), fields(schema = schema.unwrap_or("public")))]
    async fn list_tables(&self, schema: Option<&str>) -> Result<Vec<TableInfo>> {
        let schema = self.schema_or_default(schema);
        let result = self
            .query(
                "SELECT table_name, table_type FROM information_schema.tables \
                 WHERE table_schema = $1 ORDER BY table_name",
                &[Value::Text(schema.to_string())],
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
                    schema: Some(schema.to_string()),
                    name,
                    table_type,
                }
            })
            .collect())
    }

    #[tracing::instrument(skip(self), fields(table = %table))]
    async fn get_columns(&self, schema: Option<&str>, table: &str) -> Result<Vec<ColumnInfo>> {
        let schema = self.schema_or_default(schema);
        let result = self
            .query(
                "SELECT column_name, ordinal_position, data_type, is_nullable, \
                        column_default, is_identity \
                 FROM information_schema.columns \
                 WHERE table_schema = $1 AND table_name = $2 \
                 ORDER BY ordinal_position",
                &[Value::Text(schema.to_string()), Value::Text(table.to_string())],
            )
            .await?;

        let primary_key = self.get_primary_key(Some(schema), table).await?;
        let indexes = self.get_indexes(Some(schema), table).await?;
        let foreign_keys = self.get_foreign_keys(Some(schema), table).await?;

        let mut columns = Vec::with_capacity(result.rows.len());
        for row in &result.rows {
            let name = row.get(0).and_then(|v| v.as_str()).unwrap_or("").to_string();
            let ordinal = row.get(1).and_then(|v| v.as_i64()).unwrap_or(1).max(1) as usize - 1;
            let data_type = row.get(2).and_then(|v| v.as_str()).unwrap_or("").to_string();
            let nullable = row.get(3).and_then(|v| v.as_str()) == Some("YES");
            let default_value = row.get(4).and_then(|v| v.as_str()).map(|s| s.to_string());
            let is_identity = row.get(5).and_then(|v| v.as_str()) == Some("YES");

            let is_primary_key = primary_key
                .as_ref()
                .is_some_and(|pk| pk.columns.contains(&name));
            let is_unique = is_primary_key
                || indexes
                    .iter()
                    .any(|idx| idx.is_unique && idx.columns.len() == 1 && idx.columns[0] == name);
            let is_auto_increment = is_identity
                || default_value
                    .as_deref()
                    .is_some_and(|d| d.starts_with("nextval("));
            let foreign_key = foreign_keys
                .iter()
                .find(|fk| fk.columns.len() == 1 && fk.columns[0] == name)
                .map(|fk| ForeignKeyRef {
                    schema: fk.referenced_schema.clone(),
                    table: fk.referenced_table.clone(),
                    column: fk.referenced_columns.first().cloned().unwrap_or_default(),
                });

            let kind = map_pg_type_name(&data_type);
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
        let schema = self.schema_or_default(schema);
        let result = self
            .query(
                "SELECT i.relname, a.attname \
                 FROM pg_index x \
                 JOIN pg_class c ON c.oid = x.indrelid \
                 JOIN pg_class i ON i.oid = x.indexrelid \
                 JOIN pg_namespace n ON n.oid = c.relnamespace \
                 JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = ANY(x.indkey) \
                 WHERE n.nspname = $1 AND c.relname = $2 AND x.indisprimary \
                 ORDER BY array_position(x.indkey, a.attnum)",
                &[Value::Text(schema.to_string()), Value::Text(table.to_string())],
            )
            .await?;

        if result.rows.is_empty() {
            return Ok(None);
        }

        let name = result.rows[0]
            .get(0)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let columns = result
            .rows
            .iter()
            .filter_map(|row| row.get(1).and_then(|v| v.as_str()).map(|s| s.to_string()))
            .collect();

        Ok(Some(PrimaryKeyInfo { name, columns }))
    }

    #[tracing::instrument(skip(self), fields(table = %table))]
    async fn get_indexes(&self, schema: Option<&str>, table: &str) -> Result<Vec<IndexInfo>> {
        let schema = self.schema_or_default(schema);
        let result = self
            .query(
                "SELECT i.relname, a.attname, x.indisunique, x.indisprimary \
                 FROM pg_index x \
                 JOIN pg_class c ON c.oid = x.indrelid \
                 JOIN pg_class i ON i.oid = x.indexrelid \
                 JOIN pg_namespace n ON n.oid = c.relnamespace \
                 JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = ANY(x.indkey) \
                 WHERE n.nspname = $1 AND c.relname = $2 \
                 ORDER BY i.relname, array_position(x.indkey, a.attnum)",
                &[Value::Text(schema.to_string()), Value::Text(table.to_string())],
            )
            .await?;

        let mut indexes: Vec<IndexInfo> = Vec::new();
        for row in &result.rows {
            let name = row.get(0).and_then(|v| v.as_str()).unwrap_or("").to_string();
            let column = row.get(1).and_then(|v| v.as_str()).unwrap_or("").to_string();
            let is_unique = row.get(2).and_then(|v| v.as_bool()).unwrap_or(false);
            let is_primary = row.get(3).and_then(|v| v.as_bool()).unwrap_or(false);

            match indexes.iter_mut().find(|idx| idx.name == name) {
                Some(idx) => idx.columns.push(column),
                None => indexes.push(IndexInfo {
                    name,
                    columns: vec![column],
                    is_unique,
                    is_primary,
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
        let schema = self.schema_or_default(schema);
        let result = self
            .query(
                "SELECT tc.constraint_name, kcu.column_name, \
                        ccu.table_schema, ccu.table_name, ccu.column_name \
                 FROM information_schema.table_constraints tc \
                 JOIN information_schema.key_column_usage kcu \
                   ON kcu.constraint_name = tc.constraint_name \
                  AND kcu.table_schema = tc.table_schema \
                 JOIN information_schema.constraint_column_usage ccu \
                   ON ccu.constraint_name = tc.constraint_name \
                  AND ccu.constraint_schema = tc.constraint_schema \
                 WHERE tc.constraint_type = 'FOREIGN KEY' \
                   AND tc.table_schema = $1 AND tc.table_name = $2 \
                 ORDER BY tc.constraint_name, kcu.ordinal_position",
                &[Value::Text(schema.to_string()), Value::Text(table.to_string())],
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
