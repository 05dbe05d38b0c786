//! Strategy selection and plan building

use crate::parser::{MultiQueryRef, parse_multi_query};
use crate::plan::{FetchStep, Plan, ResolvedStrategy, Strategy, ValidationReport};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::collections::BTreeSet;
use std::sync::Arc;
use sqlhub_core::{EngineError, Result};
use sqlhub_connection::ConnectionManager;

/// Builds executable plans from parsed multi-queries.
///
/// Strategy `auto` resolves deterministically: one distinct connection
/// means push-down, anything else federates.
pub struct Planner {
    manager: Arc<ConnectionManager>,
}

impl Planner {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    /// Build a plan for the query.
    ///
    /// Every referenced connection must resolve to an active connection
    /// or the plan is rejected.
    #[tracing::instrument(skip(self, sql))]
    pub fn plan(&self, sql: &str, requested: Strategy) -> Result<Plan> {
        let parse = parse_multi_query(sql);
        if parse.refs.is_empty() {
            return Err(EngineError::InvalidInput(
                "query contains no @connection references".into(),
            ));
        }

        let mut steps = Vec::with_capacity(parse.refs.len());
        for reference in &parse.refs {
            let connection_id = self
                .manager
                .resolve_name(&reference.connection)
                .ok_or_else(|| {
                    EngineError::NotFound(format!(
                        "connection '{}' is not active",
                        reference.connection
                    ))
                })?;

            let schema = match &reference.schema {
                Some(schema) => Some(schema.clone()),
                None => self.manager.default_schema(connection_id)?,
            };

            steps.push(FetchStep {
                connection_id,
                connection_name: reference.connection.clone(),
                schema,
                table: reference.table.clone(),
                placeholder: reference.placeholder.clone(),
            });
        }

        let distinct: BTreeSet<&str> = parse
            .refs
            .iter()
            .map(|r| r.connection.as_str())
            .collect();

        let strategy = match requested {
            Strategy::Auto => {
                if distinct.len() == 1 {
                    ResolvedStrategy::PushDown
                } else {
                    ResolvedStrategy::Federated
                }
            }
            Strategy::Federated => ResolvedStrategy::Federated,
            Strategy::PushDown => {
                if distinct.len() != 1 {
                    return Err(EngineError::InvalidInput(format!(
                        "push-down requires a single connection, found {}",
                        distinct.len()
                    )));
                }
                ResolvedStrategy::PushDown
            }
        };

        let rewritten_sql = match strategy {
            ResolvedStrategy::Federated => parse.rewritten.clone(),
            ResolvedStrategy::PushDown => {
                self.rewrite_native(sql, &parse.refs, &steps)?
            }
        };

        let mut required_connections = Vec::new();
        for reference in &parse.refs {
            if !required_connections.contains(&reference.connection) {
                required_connections.push(reference.connection.clone());
            }
        }

        tracing::debug!(
            strategy = strategy.as_str(),
            connections = required_connections.len(),
            tables = steps.len(),
            "plan built"
        );
        Ok(Plan {
            strategy,
            rewritten_sql,
            steps,
            required_connections,
        })
    }

    /// Replace reference spans with engine-native quoted identifiers,
    /// preserving any trailing alias text.
    fn rewrite_native(
        &self,
        sql: &str,
        refs: &[MultiQueryRef],
        steps: &[FetchStep],
    ) -> Result<String> {
        let connection_id = steps[0].connection_id;
        let dialect = self.manager.dialect(connection_id)?;

        let mut rewritten = String::with_capacity(sql.len());
        let mut cursor = 0;
        for (reference, step) in refs.iter().zip(steps) {
            let (start, end) = reference.span;
            rewritten.push_str(&sql[cursor..start]);
            rewritten.push_str(&dialect.quote_qualified(step.schema.as_deref(), &step.table));
            if let Some(alias) = &reference.alias {
                rewritten.push(' ');
                rewritten.push_str(alias);
            }
            cursor = end;
        }
        rewritten.push_str(&sql[cursor..]);
        Ok(rewritten)
    }

    /// Validate a multi-query without executing it
    pub fn validate(&self, sql: &str) -> ValidationReport {
        let parse = parse_multi_query(sql);
        let mut errors = Vec::new();

        if parse.refs.is_empty() {
            errors.push("query contains no @connection references".to_string());
        }

        let mut required_connections = Vec::new();
        let mut tables = Vec::new();
        for reference in &parse.refs {
            if !required_connections.contains(&reference.connection) {
                required_connections.push(reference.connection.clone());
            }
            let rendered = match &reference.schema {
                Some(schema) => format!("{}.{}.{}", reference.connection, schema, reference.table),
                None => format!("{}.{}", reference.connection, reference.table),
            };
            tables.push(rendered);

            if self.manager.resolve_name(&reference.connection).is_none() {
                errors.push(format!(
                    "connection '{}' is not active",
                    reference.connection
                ));
            }
        }

        let distinct: BTreeSet<&str> = parse.refs.iter().map(|r| r.connection.as_str()).collect();
        let estimated_strategy = if parse.refs.is_empty() {
            None
        } else if distinct.len() == 1 {
            Some(ResolvedStrategy::PushDown)
        } else {
            Some(ResolvedStrategy::Federated)
        };

        // The coordinator must be able to parse what it would merge.
        if estimated_strategy == Some(ResolvedStrategy::Federated)
            && let Err(e) = Parser::parse_sql(&GenericDialect {}, &parse.rewritten)
        {
            errors.push(format!("query does not parse: {}", e));
        }

        ValidationReport {
            valid: errors.is_empty(),
            errors,
            required_connections,
            tables,
            estimated_strategy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlhub_core::{ConnectionConfig, EventBus};

    async fn manager_with(names: &[&str]) -> (Arc<ConnectionManager>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(ConnectionManager::new(Arc::new(EventBus::default())));
        for name in names {
            let path = dir.path().join(format!("{}.db", name));
            manager
                .create(ConnectionConfig::sqlite(path.to_str().unwrap()).with_name(*name))
                .await
                .unwrap();
        }
        (manager, dir)
    }

    #[tokio::test]
    async fn test_auto_resolves_push_down_for_single_connection() {
        let (manager, _dir) = manager_with(&["prod"]).await;
        let planner = Planner::new(manager);
        let plan = planner
            .plan("SELECT * FROM @prod.users", Strategy::Auto)
            .unwrap();
        assert_eq!(plan.strategy, ResolvedStrategy::PushDown);
        assert_eq!(plan.rewritten_sql, "SELECT * FROM \"main\".\"users\"");
    }

    #[tokio::test]
    async fn test_auto_resolves_federated_for_two_connections() {
        let (manager, _dir) = manager_with(&["prod", "analytics"]).await;
        let planner = Planner::new(manager);
        let plan = planner
            .plan(
                "SELECT * FROM @prod.users u JOIN @analytics.events e ON e.user_id = u.id",
                Strategy::Auto,
            )
            .unwrap();
        assert_eq!(plan.strategy, ResolvedStrategy::Federated);
        assert_eq!(plan.required_connections, vec!["prod", "analytics"]);
        assert!(plan.rewritten_sql.contains("__sqlhub_ref_0"));
    }

    #[tokio::test]
    async fn test_push_down_rejected_across_connections() {
        let (manager, _dir) = manager_with(&["prod", "analytics"]).await;
        let planner = Planner::new(manager);
        let err = planner
            .plan(
                "SELECT * FROM @prod.users u JOIN @analytics.events e ON e.user_id = u.id",
                Strategy::PushDown,
            )
            .unwrap_err();
        assert_eq!(err.kind(), sqlhub_core::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_unknown_connection_rejects_plan() {
        let (manager, _dir) = manager_with(&["prod"]).await;
        let planner = Planner::new(manager);
        let err = planner
            .plan("SELECT * FROM @ghost.users", Strategy::Auto)
            .unwrap_err();
        assert_eq!(err.kind(), sqlhub_core::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_validate_reports_without_executing() {
        let (manager, _dir) = manager_with(&["prod"]).await;
        let planner = Planner::new(manager);

        let report = planner.validate("SELECT * FROM @prod.users u JOIN @ghost.t x ON x.a = u.id");
        assert!(!report.valid);
        assert_eq!(report.required_connections, vec!["prod", "ghost"]);
        assert_eq!(report.tables, vec!["prod.users", "ghost.t"]);
        assert_eq!(report.estimated_strategy, Some(ResolvedStrategy::Federated));
        assert!(report.errors.iter().any(|e| e.contains("ghost")));

        let report = planner.validate("SELECT * FROM @prod.users");
        assert!(report.valid);
        assert_eq!(report.estimated_strategy, Some(ResolvedStrategy::PushDown));
    }
}
