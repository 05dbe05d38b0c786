//! SQLite schema introspection via pragma table functions

use crate::connection::{SqliteConnection, map_decl_type};
use async_trait::async_trait;
use sqlhub_core::{
    ColumnInfo, Connection, ForeignKeyInfo, ForeignKeyRef, IndexInfo, PrimaryKeyInfo, Result,
    SchemaInfo, SchemaIntrospection, TableInfo, TableType, Value,
};

#[async_trait]
impl SchemaIntrospection for SqliteConnection {
    #[tracing::instrument(skip(self))]
    async fn list_schemas(&self) -> Result<Vec<SchemaInfo>> {
        Ok(vec![SchemaInfo {
            name: "main".to_string(),
        }])
    }

    #[tracing::instrument(skip(self))]
    async fn list_tables(&self, _schema: Option<&str>) -> Result<Vec<TableInfo>> {
        tracing::debug!("listing tables from sqlite_master");
        let result = self
            .query(
                "SELECT name, type FROM sqlite_master \
                 WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' ORDER BY name",
                &[],
            )
            .await?;

        Ok(result
            .rows
            .iter()
            .map(|row| {
                let name = row.get(0).and_then(|v| v.as_str()).unwrap_or("").to_string();
                let table_type = match row.get(1).and_then(|v| v.as_str()) {
                    Some("view") => TableType::View,
                    _ => TableType::Table,
                };
                TableInfo {
                    schema: Some("main".to_string()),
                    name,
                    table_type,
                }
            })
            .collect())
    }

    #[tracing::instrument(skip(self), fields(table = %table))]
    async fn get_columns(&self, _schema: Option<&str>, table: &str) -> Result<Vec<ColumnInfo>> {
        let result = self
            .query(
                "SELECT cid, name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?)",
                &[Value::Text(table.to_string())],
            )
            .await?;

        let indexes = self.get_indexes(None, table).await?;
        let foreign_keys = self.get_foreign_keys(None, table).await?;
        let pk_column_count = result
            .rows
            .iter()
            .filter(|row| row.get(5).and_then(|v| v.as_i64()).unwrap_or(0) > 0)
            .count();

        let mut columns = Vec::with_capacity(result.rows.len());
        for row in &result.rows {
            let name = row.get(1).and_then(|v| v.as_str()).unwrap_or("").to_string();
            let data_type = row.get(2).and_then(|v| v.as_str()).unwrap_or("").to_string();
            let not_null = row.get(3).and_then(|v| v.as_i64()).unwrap_or(0) != 0;
            let default_value = row.get(4).and_then(|v| v.as_str()).map(|s| s.to_string());
            let pk_position = row.get(5).and_then(|v| v.as_i64()).unwrap_or(0);
            let is_primary_key = pk_position > 0;

            let is_unique = is_primary_key
                || indexes
                    .iter()
                    .any(|idx| idx.is_unique && idx.columns.len() == 1 && idx.columns[0] == name);

            let foreign_key = foreign_keys
                .iter()
                .find(|fk| fk.columns.len() == 1 && fk.columns[0] == name)
                .map(|fk| ForeignKeyRef {
                    schema: fk.referenced_schema.clone(),
                    table: fk.referenced_table.clone(),
                    column: fk.referenced_columns.first().cloned().unwrap_or_default(),
                });

            // INTEGER PRIMARY KEY aliases the rowid and auto-assigns.
            let is_auto_increment =
                is_primary_key && pk_column_count == 1 && data_type.eq_ignore_ascii_case("integer");

            let kind = map_decl_type(&data_type);
            columns.push(ColumnInfo {
                name,
                ordinal: row.get(0).and_then(|v| v.as_i64()).unwrap_or(0) as usize,
                data_type,
                kind,
                nullable: !not_null && !is_primary_key,
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
        _schema: Option<&str>,
        table: &str,
    ) -> Result<Option<PrimaryKeyInfo>> {
        let result = self
            .query(
                "SELECT name, pk FROM pragma_table_info(?) WHERE pk > 0 ORDER BY pk",
                &[Value::Text(table.to_string())],
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
            name: None,
            columns,
        }))
    }

    #[tracing::instrument(skip(self), fields(table = %table))]
    async fn get_indexes(&self, _schema: Option<&str>, table: &str) -> Result<Vec<IndexInfo>> {
        let list = self
            .query(
                "SELECT name, \"unique\", origin FROM pragma_index_list(?)",
                &[Value::Text(table.to_string())],
            )
            .await?;

        let mut indexes = Vec::with_capacity(list.rows.len());
        for row in &list.rows {
            let name = row.get(0).and_then(|v| v.as_str()).unwrap_or("").to_string();
            let is_unique = row.get(1).and_then(|v| v.as_i64()).unwrap_or(0) != 0;
            let is_primary = row.get(2).and_then(|v| v.as_str()) == Some("pk");

            let info = self
                .query(
                    "SELECT name FROM pragma_index_info(?) ORDER BY seqno",
                    &[Value::Text(name.clone())],
                )
                .await?;
            let columns = info
                .rows
                .iter()
                .filter_map(|r| r.get(0).and_then(|v| v.as_str()).map(|s| s.to_string()))
                .collect();

            indexes.push(IndexInfo {
                name,
                columns,
                is_unique,
                is_primary,
            });
        }

        Ok(indexes)
    }

    #[tracing::instrument(skip(self), fields(table = %table))]
    async fn get_foreign_keys(
        &self,
        _schema: Option<&str>,
        table: &str,
    ) -> Result<Vec<ForeignKeyInfo>> {
        let result = self
            .query(
                "SELECT id, \"table\", \"from\", \"to\" FROM pragma_foreign_key_list(?) ORDER BY id, seq",
                &[Value::Text(table.to_string())],
            )
            .await?;

        // Rows arrive one per column; group by constraint id.
        let mut keys: Vec<(i64, ForeignKeyInfo)> = Vec::new();
        for row in &result.rows {
            let id = row.get(0).and_then(|v| v.as_i64()).unwrap_or(0);
            let referenced_table = row.get(1).and_then(|v| v.as_str()).unwrap_or("").to_string();
            let from = row.get(2).and_then(|v| v.as_str()).unwrap_or("").to_string();
            let to = row.get(3).and_then(|v| v.as_str()).unwrap_or("").to_string();

            match keys.iter_mut().find(|(existing, _)| *existing == id) {
                Some((_, fk)) => {
                    fk.columns.push(from);
                    fk.referenced_columns.push(to);
                }
                None => keys.push((
                    id,
                    ForeignKeyInfo {
                        name: format!("fk_{}_{}", table, id),
                        columns: vec![from],
                        referenced_schema: Some("main".to_string()),
                        referenced_table,
                        referenced_columns: vec![to],
                    },
                )),
            }
        }

        Ok(keys.into_iter().map(|(_, fk)| fk).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fixture() -> SqliteConnection {
        let conn = SqliteConnection::open(":memory:").unwrap();
        conn.execute(
            "CREATE TABLE users (\
                id INTEGER PRIMARY KEY, \
                email TEXT NOT NULL UNIQUE, \
                bio TEXT)",
            &[],
        )
        .await
        .unwrap();
        conn.execute(
            "CREATE TABLE posts (\
                id INTEGER PRIMARY KEY, \
                author_id INTEGER NOT NULL REFERENCES users(id), \
                title TEXT NOT NULL)",
            &[],
        )
        .await
        .unwrap();
        conn
    }

    #[tokio::test]
    async fn test_list_tables() {
        let conn = fixture().await;
        let tables = conn.list_tables(None).await.unwrap();
        let names: Vec<_> = tables.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["posts", "users"]);
    }

    #[tokio::test]
    async fn test_columns_and_primary_key() {
        let conn = fixture().await;
        let columns = conn.get_columns(None, "users").await.unwrap();
        assert_eq!(columns.len(), 3);

        let id = columns.iter().find(|c| c.name == "id").unwrap();
        assert!(id.is_primary_key);
        assert!(id.is_auto_increment);

        let email = columns.iter().find(|c| c.name == "email").unwrap();
        assert!(email.is_unique);
        assert!(!email.nullable);

        let pk = conn.get_primary_key(None, "users").await.unwrap().unwrap();
        assert_eq!(pk.columns, vec!["id".to_string()]);
    }

    #[tokio::test]
    async fn test_foreign_keys() {
        let conn = fixture().await;
        let fks = conn.get_foreign_keys(None, "posts").await.unwrap();
        assert_eq!(fks.len(), 1);
        assert_eq!(fks[0].referenced_table, "users");
        assert_eq!(fks[0].columns, vec!["author_id".to_string()]);
        assert_eq!(fks[0].referenced_columns, vec!["id".to_string()]);
    }

    #[tokio::test]
    async fn test_unique_identity_through_details() {
        let conn = fixture().await;
        let details = conn.get_table(None, "users").await.unwrap();
        assert_eq!(details.unique_identity(), Some(vec!["id".to_string()]));
    }
}
