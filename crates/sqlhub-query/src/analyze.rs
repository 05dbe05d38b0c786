//! Statement classification, limit probing and base-table analysis
//!
//! Everything here works on the sqlparser AST; string heuristics are the
//! fallback only when the statement does not parse.

use sqlparser::ast::{
    Expr, GroupByExpr, Query, Select, SelectItem, SetExpr, Statement, TableFactor,
    Value as AstValue,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

/// Broad statement classification driving the execution path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// Returns rows and accepts a limit probe
    Select,
    /// Modifies data; rejected under read-only options
    Mutation,
    /// Everything else routed through the query path untouched
    /// (SHOW, EXPLAIN, PRAGMA and friends)
    Other,
}

/// Classify a statement for the executor.
///
/// Unparseable SQL falls back to a keyword heuristic so engine-specific
/// syntax still executes.
pub fn classify_statement(sql: &str) -> StatementKind {
    let dialect = GenericDialect {};
    if let Ok(statements) = Parser::parse_sql(&dialect, sql)
        && let Some(statement) = statements.first()
    {
        return match statement {
            Statement::Query(_) => StatementKind::Select,
            Statement::Insert(_)
            | Statement::Update { .. }
            | Statement::Delete(_)
            | Statement::Truncate { .. }
            | Statement::Drop { .. }
            | Statement::CreateTable(_)
            | Statement::CreateIndex(_)
            | Statement::AlterTable { .. } => StatementKind::Mutation,
            _ => StatementKind::Other,
        };
    }

    let upper = sql.trim_start().to_uppercase();
    if upper.starts_with("SELECT") || upper.starts_with("WITH") {
        StatementKind::Select
    } else if upper.starts_with("INSERT")
        || upper.starts_with("UPDATE")
        || upper.starts_with("DELETE")
        || upper.starts_with("CREATE")
        || upper.starts_with("DROP")
        || upper.starts_with("ALTER")
        || upper.starts_with("TRUNCATE")
    {
        StatementKind::Mutation
    } else {
        StatementKind::Other
    }
}

/// Append a `LIMIT probe` to a SELECT that has none of its own.
///
/// Returns the SQL to execute plus whether the probe was injected; a
/// query with an explicit LIMIT/FETCH is left untouched and truncation
/// is detected by row counting alone.
pub fn inject_limit_probe(sql: &str, probe: u64) -> (String, bool) {
    let dialect = GenericDialect {};
    let Ok(mut statements) = Parser::parse_sql(&dialect, sql) else {
        return (sql.to_string(), false);
    };
    if statements.len() != 1 {
        return (sql.to_string(), false);
    }

    let Statement::Query(query) = &mut statements[0] else {
        return (sql.to_string(), false);
    };
    if query.limit.is_some() || query.fetch.is_some() {
        return (sql.to_string(), false);
    }

    query.limit = Some(Expr::Value(AstValue::Number(probe.to_string(), false)));
    (statements[0].to_string(), true)
}

/// Result of base-table analysis for editability
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseTableAnalysis {
    /// A single unambiguous base table
    Single {
        schema: Option<String>,
        table: String,
        /// Projected column names; empty means `SELECT *`
        projection: Vec<String>,
    },
    /// More than one base table could own the result rows
    Deferred { reason: String },
    /// Not a SELECT at all
    NotSelect,
}

/// Decide whether a query reads from exactly one base table.
///
/// The synchronous editability path accepts plain single-table SELECTs:
/// no CTEs, joins, set operations or derived tables. Anything else is
/// deferred to the background analyzer.
pub fn analyze_base_table(sql: &str) -> BaseTableAnalysis {
    let dialect = GenericDialect {};
    let Ok(statements) = Parser::parse_sql(&dialect, sql) else {
        return BaseTableAnalysis::Deferred {
            reason: "query did not parse".to_string(),
        };
    };
    if statements.len() != 1 {
        return BaseTableAnalysis::Deferred {
            reason: "multiple statements".to_string(),
        };
    }

    let Statement::Query(query) = &statements[0] else {
        return BaseTableAnalysis::NotSelect;
    };
    analyze_query(query)
}

fn analyze_query(query: &Query) -> BaseTableAnalysis {
    if query.with.is_some() {
        return BaseTableAnalysis::Deferred {
            reason: "query uses a CTE".to_string(),
        };
    }

    let select = match query.body.as_ref() {
        SetExpr::Select(select) => select,
        SetExpr::Query(inner) => return analyze_query(inner),
        _ => {
            return BaseTableAnalysis::Deferred {
                reason: "query uses a set operation".to_string(),
            };
        }
    };

    analyze_select(select)
}

fn analyze_select(select: &Select) -> BaseTableAnalysis {
    if select.from.len() != 1 {
        return BaseTableAnalysis::Deferred {
            reason: format!("{} FROM items", select.from.len()),
        };
    }
    let from = &select.from[0];
    if !from.joins.is_empty() {
        return BaseTableAnalysis::Deferred {
            reason: "query contains a join".to_string(),
        };
    }
    if select.distinct.is_some() {
        return BaseTableAnalysis::Deferred {
            reason: "DISTINCT may collapse base rows".to_string(),
        };
    }
    if !matches!(select.group_by, GroupByExpr::Expressions(ref exprs, _) if exprs.is_empty()) {
        return BaseTableAnalysis::Deferred {
            reason: "GROUP BY collapses base rows".to_string(),
        };
    }

    let TableFactor::Table { name, .. } = &from.relation else {
        return BaseTableAnalysis::Deferred {
            reason: "FROM is not a plain table".to_string(),
        };
    };

    let parts: Vec<String> = name.0.iter().map(|ident| ident.value.clone()).collect();
    let (schema, table) = match parts.len() {
        1 => (None, parts[0].clone()),
        2 => (Some(parts[0].clone()), parts[1].clone()),
        _ => (
            Some(parts[parts.len() - 2].clone()),
            parts[parts.len() - 1].clone(),
        ),
    };

    let mut projection = Vec::new();
    for item in &select.projection {
        match item {
            SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(_, _) => {
                // Wildcard: the caller resolves the full column list.
                return BaseTableAnalysis::Single {
                    schema,
                    table,
                    projection: Vec::new(),
                };
            }
            SelectItem::UnnamedExpr(Expr::Identifier(ident)) => {
                projection.push(ident.value.clone());
            }
            SelectItem::UnnamedExpr(Expr::CompoundIdentifier(parts)) => {
                if let Some(last) = parts.last() {
                    projection.push(last.value.clone());
                }
            }
            SelectItem::ExprWithAlias { alias, .. } => {
                projection.push(alias.value.clone());
            }
            SelectItem::UnnamedExpr(_) => {
                return BaseTableAnalysis::Deferred {
                    reason: "projection contains computed expressions".to_string(),
                };
            }
        }
    }

    BaseTableAnalysis::Single {
        schema,
        table,
        projection,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod classify_tests {
        use super::*;

        #[test]
        fn test_select_variants() {
            assert_eq!(classify_statement("SELECT 1"), StatementKind::Select);
            assert_eq!(
                classify_statement("WITH x AS (SELECT 1) SELECT * FROM x"),
                StatementKind::Select
            );
        }

        #[test]
        fn test_mutations() {
            assert_eq!(
                classify_statement("INSERT INTO t VALUES (1)"),
                StatementKind::Mutation
            );
            assert_eq!(
                classify_statement("UPDATE t SET a = 1"),
                StatementKind::Mutation
            );
            assert_eq!(classify_statement("DROP TABLE t"), StatementKind::Mutation);
        }

        #[test]
        fn test_other_passes_through() {
            assert_eq!(classify_statement("EXPLAIN SELECT 1"), StatementKind::Other);
            assert_eq!(classify_statement("PRAGMA table_info(t)"), StatementKind::Other);
        }
    }

    mod probe_tests {
        use super::*;

        #[test]
        fn test_probe_injected_when_no_limit() {
            let (sql, injected) = inject_limit_probe("SELECT id FROM users ORDER BY id", 11);
            assert!(injected);
            assert!(sql.ends_with("LIMIT 11"), "got: {}", sql);
        }

        #[test]
        fn test_existing_limit_untouched() {
            let (sql, injected) = inject_limit_probe("SELECT id FROM users LIMIT 5", 11);
            assert!(!injected);
            assert!(sql.contains("LIMIT 5"));
        }

        #[test]
        fn test_unparseable_left_alone() {
            let (sql, injected) = inject_limit_probe("PRAGMA table_info(users)", 11);
            assert!(!injected);
            assert_eq!(sql, "PRAGMA table_info(users)");
        }
    }

    mod base_table_tests {
        use super::*;

        #[test]
        fn test_plain_single_table() {
            let analysis =
                analyze_base_table("SELECT id, status FROM public.users WHERE status = 'a'");
            assert_eq!(
                analysis,
                BaseTableAnalysis::Single {
                    schema: Some("public".to_string()),
                    table: "users".to_string(),
                    projection: vec!["id".to_string(), "status".to_string()],
                }
            );
        }

        #[test]
        fn test_wildcard_resolves_later() {
            let analysis = analyze_base_table("SELECT * FROM users");
            assert_eq!(
                analysis,
                BaseTableAnalysis::Single {
                    schema: None,
                    table: "users".to_string(),
                    projection: Vec::new(),
                }
            );
        }

        #[test]
        fn test_alias_is_accepted() {
            let analysis = analyze_base_table("SELECT u.id FROM users u WHERE u.id > 3");
            assert!(matches!(analysis, BaseTableAnalysis::Single { table, .. } if table == "users"));
        }

        #[test]
        fn test_join_defers() {
            let analysis =
                analyze_base_table("SELECT * FROM users u JOIN orders o ON o.user_id = u.id");
            assert!(matches!(analysis, BaseTableAnalysis::Deferred { .. }));
        }

        #[test]
        fn test_cte_defers() {
            let analysis = analyze_base_table("WITH x AS (SELECT 1) SELECT * FROM x");
            assert!(matches!(analysis, BaseTableAnalysis::Deferred { .. }));
        }

        #[test]
        fn test_group_by_defers() {
            let analysis =
                analyze_base_table("SELECT status, count(*) FROM users GROUP BY status");
            assert!(matches!(analysis, BaseTableAnalysis::Deferred { .. }));
        }

        #[test]
        fn test_mutation_is_not_select() {
            assert_eq!(
                analyze_base_table("DELETE FROM users"),
                BaseTableAnalysis::NotSelect
            );
        }
    }
}
