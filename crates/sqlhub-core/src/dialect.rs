//! Engine-specific SQL syntax helpers
//!
//! Everywhere an identifier comes from data it goes through
//! `quote_ident`; interpolating unquoted identifiers is never correct.

use crate::DatabaseKind;

/// Quoting, placeholder and default-schema rules for one engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqlDialect {
    kind: DatabaseKind,
}

impl SqlDialect {
    pub fn new(kind: DatabaseKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> DatabaseKind {
        self.kind
    }

    /// Quote a single identifier with engine-correct escaping
    pub fn quote_ident(&self, ident: &str) -> String {
        match self.kind {
            DatabaseKind::Mysql | DatabaseKind::Mariadb => {
                format!("`{}`", ident.replace('`', "``"))
            }
            DatabaseKind::Postgres | DatabaseKind::Sqlite => {
                format!("\"{}\"", ident.replace('"', "\"\""))
            }
        }
    }

    /// Quote a possibly schema-qualified table reference
    pub fn quote_qualified(&self, schema: Option<&str>, name: &str) -> String {
        match schema {
            Some(s) if !s.is_empty() => {
                format!("{}.{}", self.quote_ident(s), self.quote_ident(name))
            }
            _ => self.quote_ident(name),
        }
    }

    /// Parameter placeholder for the 1-based position
    pub fn placeholder(&self, position: usize) -> String {
        match self.kind {
            DatabaseKind::Postgres => format!("${}", position),
            DatabaseKind::Mysql | DatabaseKind::Mariadb | DatabaseKind::Sqlite => "?".to_string(),
        }
    }

    /// The schema applied when a reference omits one.
    ///
    /// MySQL/MariaDB have no fixed answer: the active database selected at
    /// connect time is the namespace, so the resolver must supply it.
    pub fn default_schema(&self) -> Option<&'static str> {
        match self.kind {
            DatabaseKind::Postgres => Some("public"),
            DatabaseKind::Sqlite => Some("main"),
            DatabaseKind::Mysql | DatabaseKind::Mariadb => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_postgres_doubles_quotes() {
        let dialect = SqlDialect::new(DatabaseKind::Postgres);
        assert_eq!(dialect.quote_ident("users"), "\"users\"");
        assert_eq!(dialect.quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_quote_ident_mysql_backticks() {
        let dialect = SqlDialect::new(DatabaseKind::Mysql);
        assert_eq!(dialect.quote_ident("users"), "`users`");
        assert_eq!(dialect.quote_ident("we`ird"), "`we``ird`");
    }

    #[test]
    fn test_qualified_names() {
        let dialect = SqlDialect::new(DatabaseKind::Postgres);
        assert_eq!(
            dialect.quote_qualified(Some("public"), "users"),
            "\"public\".\"users\""
        );
        assert_eq!(dialect.quote_qualified(None, "users"), "\"users\"");
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(SqlDialect::new(DatabaseKind::Postgres).placeholder(2), "$2");
        assert_eq!(SqlDialect::new(DatabaseKind::Sqlite).placeholder(2), "?");
        assert_eq!(SqlDialect::new(DatabaseKind::Mariadb).placeholder(1), "?");
    }

    #[test]
    fn test_default_schemas() {
        assert_eq!(SqlDialect::new(DatabaseKind::Postgres).default_schema(), Some("public"));
        assert_eq!(SqlDialect::new(DatabaseKind::Sqlite).default_schema(), Some("main"));
        assert_eq!(SqlDialect::new(DatabaseKind::Mysql).default_schema(), None);
    }
}
