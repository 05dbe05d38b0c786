//! In-memory evaluation of federated queries
//!
//! The coordinator materializes every referenced table and evaluates the
//! rewritten statement here: joins, WHERE, GROUP BY with aggregates,
//! HAVING, projection, ORDER BY and LIMIT over canonical `Value` rows.
//! This is a merge engine, not an optimizer; joins are nested loops over
//! already-capped fetches.

use sqlparser::ast::{
    BinaryOperator, Distinct, Expr, Function, FunctionArg, FunctionArgExpr, FunctionArguments,
    GroupByExpr, Join, JoinConstraint, JoinOperator, OrderByExpr, Select, SelectItem, SetExpr,
    Statement, TableFactor, UnaryOperator, Value as AstValue,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::cmp::Ordering;
use std::collections::HashMap;
use sqlhub_core::{EngineError, Result, Value};

/// A materialized per-connection fetch
#[derive(Debug, Clone)]
pub struct VirtualTable {
    /// Placeholder name the rewritten SQL binds this table to
    pub name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// Output of the merge engine
#[derive(Debug, Clone)]
pub struct MergedResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// One table bound into the join row layout
struct Binding {
    alias: String,
    columns: Vec<String>,
    offset: usize,
}

fn query_err(message: impl Into<String>) -> EngineError {
    EngineError::Query(message.into())
}

/// Evaluate the rewritten query over the materialized tables.
///
/// `row_cap` bounds the output after ORDER BY; the query's own LIMIT
/// applies first when tighter.
pub fn execute_merge(
    sql: &str,
    tables: &HashMap<String, VirtualTable>,
    row_cap: u64,
) -> Result<MergedResult> {
    let statements = Parser::parse_sql(&GenericDialect {}, sql)
        .map_err(|e| query_err(format!("federated query does not parse: {}", e)))?;
    if statements.len() != 1 {
        return Err(query_err("federated execution expects a single statement"));
    }
    let Statement::Query(query) = &statements[0] else {
        return Err(query_err("federated execution supports SELECT only"));
    };
    if query.with.is_some() {
        return Err(query_err("CTEs are not supported in federated queries"));
    }

    let SetExpr::Select(select) = query.body.as_ref() else {
        return Err(query_err(
            "set operations are not supported in federated queries",
        ));
    };

    // Materialize the joined row set.
    let (bindings, rows) = build_from(select, tables)?;
    let eval = Evaluator {
        bindings: &bindings,
    };

    // WHERE
    let mut kept: Vec<&Vec<Value>> = Vec::with_capacity(rows.len());
    for row in &rows {
        let keep = match &select.selection {
            Some(condition) => eval.eval(condition, row)?.as_bool().unwrap_or(false),
            None => true,
        };
        if keep {
            kept.push(row);
        }
    }

    let group_exprs = match &select.group_by {
        GroupByExpr::Expressions(exprs, _) => exprs.clone(),
        GroupByExpr::All(_) => {
            return Err(query_err("GROUP BY ALL is not supported in federated queries"));
        }
    };
    let aggregated = !group_exprs.is_empty()
        || select
            .projection
            .iter()
            .any(|item| select_item_has_aggregate(item));

    let (columns, mut output) = if aggregated {
        project_grouped(select, &group_exprs, &eval, &kept)?
    } else {
        project_plain(select, &eval, &kept)?
    };

    if matches!(select.distinct, Some(Distinct::Distinct)) {
        let mut seen = std::collections::HashSet::new();
        output.retain(|(_, values)| seen.insert(values.iter().map(row_key_part).collect::<Vec<_>>()));
    }

    // ORDER BY: projected aliases first, then source columns. Without an
    // ORDER BY, rows keep the first fetch's insertion order.
    if let Some(order_by) = &query.order_by
        && !order_by.exprs.is_empty()
    {
        sort_output(&order_by.exprs, &columns, &eval, &mut output, aggregated)?;
    }

    let mut values: Vec<Vec<Value>> = output.into_iter().map(|(_, v)| v).collect();

    // OFFSET then LIMIT, then the external cap.
    if let Some(offset) = &query.offset {
        let n = eval_const_u64(&offset.value)?;
        if (n as usize) < values.len() {
            values.drain(0..n as usize);
        } else {
            values.clear();
        }
    }
    if let Some(limit) = &query.limit {
        let n = eval_const_u64(limit)?;
        values.truncate(n as usize);
    }
    values.truncate(row_cap as usize);

    Ok(MergedResult {
        columns,
        rows: values,
    })
}

/// Sort key context: the source row (plain) or group row indices
/// (aggregated) paired with each output row.
type OutputRow = (SortContext, Vec<Value>);

enum SortContext {
    Row(Vec<Value>),
    Group(Vec<Vec<Value>>),
}

fn sort_output(
    order_exprs: &[OrderByExpr],
    columns: &[String],
    eval: &Evaluator<'_>,
    output: &mut [OutputRow],
    aggregated: bool,
) -> Result<()> {
    // Precompute keys to keep the comparator infallible.
    let mut keyed: Vec<(Vec<(Value, bool, bool)>, usize)> = Vec::with_capacity(output.len());
    for (index, (context, values)) in output.iter().enumerate() {
        let mut keys = Vec::with_capacity(order_exprs.len());
        for order in order_exprs {
            let asc = order.asc.unwrap_or(true);
            let nulls_first = order.nulls_first.unwrap_or(!asc);
            let key = eval_order_key(&order.expr, columns, values, context, eval, aggregated)?;
            keys.push((key, asc, nulls_first));
        }
        keyed.push((keys, index));
    }

    keyed.sort_by(|(a, _), (b, _)| {
        for ((av, asc, nulls_first), (bv, _, _)) in a.iter().zip(b.iter()) {
            let ordering = match (av.is_null(), bv.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => {
                    if *nulls_first {
                        Ordering::Less
                    } else {
                        Ordering::Greater
                    }
                }
                (false, true) => {
                    if *nulls_first {
                        Ordering::Greater
                    } else {
                        Ordering::Less
                    }
                }
                (false, false) => {
                    let natural = cmp_values(av, bv).unwrap_or(Ordering::Equal);
                    if *asc { natural } else { natural.reverse() }
                }
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });

    let order: Vec<usize> = keyed.into_iter().map(|(_, index)| index).collect();
    apply_permutation(output, &order);
    Ok(())
}

fn apply_permutation(output: &mut [OutputRow], order: &[usize]) {
    let mut rearranged: Vec<OutputRow> = Vec::with_capacity(output.len());
    // Take each element in its sorted position; contexts are moved, not
    // cloned, via a placeholder swap.
    let mut taken: Vec<Option<OutputRow>> = output
        .iter_mut()
        .map(|slot| {
            Some(std::mem::replace(
                slot,
                (SortContext::Row(Vec::new()), Vec::new()),
            ))
        })
        .collect();
    for &index in order {
        rearranged.push(taken[index].take().expect("permutation visits each index once"));
    }
    for (slot, value) in output.iter_mut().zip(rearranged) {
        *slot = value;
    }
}

fn eval_order_key(
    expr: &Expr,
    columns: &[String],
    values: &[Value],
    context: &SortContext,
    eval: &Evaluator<'_>,
    aggregated: bool,
) -> Result<Value> {
    // A bare identifier naming an output column sorts by that column.
    if let Expr::Identifier(ident) = expr
        && let Some(position) = columns.iter().position(|c| *c == ident.value)
    {
        return Ok(values[position].clone());
    }
    // A positional `ORDER BY 2`.
    if let Expr::Value(AstValue::Number(n, _)) = expr
        && let Ok(position) = n.parse::<usize>()
        && position >= 1
        && position <= columns.len()
    {
        return Ok(values[position - 1].clone());
    }

    match context {
        SortContext::Row(row) => eval.eval(expr, row),
        SortContext::Group(rows) => {
            if aggregated && rows.is_empty() {
                Ok(Value::Null)
            } else {
                eval.eval_grouped(expr, rows)
            }
        }
    }
}

// ---------- FROM / JOIN ----------

fn build_from(
    select: &Select,
    tables: &HashMap<String, VirtualTable>,
) -> Result<(Vec<Binding>, Vec<Vec<Value>>)> {
    if select.from.len() != 1 {
        return Err(query_err(
            "comma-separated FROM lists are not supported in federated queries; use JOIN",
        ));
    }
    let from = &select.from[0];

    let (alias, table) = resolve_table(&from.relation, tables)?;
    let mut bindings = vec![Binding {
        alias,
        columns: table.columns.clone(),
        offset: 0,
    }];
    let mut rows: Vec<Vec<Value>> = table.rows.clone();

    for join in &from.joins {
        let (alias, right) = resolve_table(&join.relation, tables)?;
        let offset = bindings.iter().map(|b| b.columns.len()).sum();
        bindings.push(Binding {
            alias,
            columns: right.columns.clone(),
            offset,
        });
        rows = apply_join(&bindings, rows, right, join)?;
    }

    Ok((bindings, rows))
}

fn resolve_table<'t>(
    factor: &TableFactor,
    tables: &'t HashMap<String, VirtualTable>,
) -> Result<(String, &'t VirtualTable)> {
    let TableFactor::Table { name, alias, .. } = factor else {
        return Err(query_err(
            "only plain table references are supported in federated queries",
        ));
    };
    let table_name = name
        .0
        .last()
        .map(|ident| ident.value.clone())
        .ok_or_else(|| query_err("empty table name"))?;
    let table = tables
        .get(&table_name)
        .ok_or_else(|| query_err(format!("unknown virtual table {}", table_name)))?;
    let alias = alias
        .as_ref()
        .map(|a| a.name.value.clone())
        .unwrap_or_else(|| table_name.clone());
    Ok((alias, table))
}

fn apply_join(
    bindings: &[Binding],
    left_rows: Vec<Vec<Value>>,
    right: &VirtualTable,
    join: &Join,
) -> Result<Vec<Vec<Value>>> {
    let eval = Evaluator { bindings };
    let right_width = right.columns.len();

    let constraint = match &join.join_operator {
        JoinOperator::Inner(constraint) => Some((constraint, false)),
        JoinOperator::LeftOuter(constraint) => Some((constraint, true)),
        JoinOperator::CrossJoin => None,
        other => {
            return Err(query_err(format!(
                "join type {:?} is not supported in federated queries",
                other
            )));
        }
    };

    let mut combined = Vec::new();
    for left in &left_rows {
        let mut matched = false;
        for right_row in &right.rows {
            let mut candidate = Vec::with_capacity(left.len() + right_width);
            candidate.extend(left.iter().cloned());
            candidate.extend(right_row.iter().cloned());

            let keep = match &constraint {
                None => true,
                Some((JoinConstraint::On(condition), _)) => {
                    eval.eval(condition, &candidate)?.as_bool().unwrap_or(false)
                }
                Some((JoinConstraint::None, _)) => true,
                Some((other, _)) => {
                    return Err(query_err(format!(
                        "join constraint {:?} is not supported in federated queries",
                        other
                    )));
                }
            };
            if keep {
                matched = true;
                combined.push(candidate);
            }
        }

        // LEFT JOIN keeps unmatched left rows padded with NULLs.
        if let Some((_, true)) = &constraint
            && !matched
        {
            let mut padded = Vec::with_capacity(left.len() + right_width);
            padded.extend(left.iter().cloned());
            padded.extend(std::iter::repeat_n(Value::Null, right_width));
            combined.push(padded);
        }
    }
    Ok(combined)
}

// ---------- Projection ----------

fn project_plain(
    select: &Select,
    eval: &Evaluator<'_>,
    rows: &[&Vec<Value>],
) -> Result<(Vec<String>, Vec<OutputRow>)> {
    let columns = projection_names(select, eval)?;
    let mut output = Vec::with_capacity(rows.len());
    for row in rows {
        let mut values = Vec::with_capacity(columns.len());
        for item in &select.projection {
            append_item_values(item, eval, row, &mut values)?;
        }
        output.push((SortContext::Row((*row).clone()), values));
    }
    Ok((columns, output))
}

fn project_grouped(
    select: &Select,
    group_exprs: &[Expr],
    eval: &Evaluator<'_>,
    rows: &[&Vec<Value>],
) -> Result<(Vec<String>, Vec<OutputRow>)> {
    let columns = projection_names(select, eval)?;

    // Group rows by their key rendering, preserving first-seen order.
    let mut group_index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<Vec<Vec<Value>>> = Vec::new();
    if group_exprs.is_empty() {
        // Aggregates without GROUP BY form one group over everything.
        groups.push(rows.iter().map(|r| (*r).clone()).collect());
    } else {
        for row in rows {
            let mut key = String::new();
            for expr in group_exprs {
                let value = eval.eval(expr, row)?;
                key.push_str(&row_key_part(&value));
                key.push('\u{1f}');
            }
            let slot = *group_index.entry(key).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[slot].push((*row).clone());
        }
    }

    let mut output = Vec::with_capacity(groups.len());
    for group in groups {
        let mut keep = true;
        if let Some(having) = &select.having {
            keep = eval
                .eval_grouped(having, &group)?
                .as_bool()
                .unwrap_or(false);
        }
        if !keep {
            continue;
        }

        let mut values = Vec::with_capacity(columns.len());
        for item in &select.projection {
            match item {
                SelectItem::UnnamedExpr(expr) => values.push(eval.eval_grouped(expr, &group)?),
                SelectItem::ExprWithAlias { expr, .. } => {
                    values.push(eval.eval_grouped(expr, &group)?)
                }
                _ => {
                    return Err(query_err(
                        "wildcard projections cannot be combined with aggregates",
                    ));
                }
            }
        }
        output.push((SortContext::Group(group), values));
    }
    Ok((columns, output))
}

fn projection_names(select: &Select, eval: &Evaluator<'_>) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for item in &select.projection {
        match item {
            SelectItem::Wildcard(_) => {
                for binding in eval.bindings {
                    names.extend(binding.columns.iter().cloned());
                }
            }
            SelectItem::QualifiedWildcard(qualifier, _) => {
                let alias = qualifier
                    .0
                    .last()
                    .map(|ident| ident.value.clone())
                    .unwrap_or_default();
                let binding = eval
                    .bindings
                    .iter()
                    .find(|b| b.alias == alias)
                    .ok_or_else(|| query_err(format!("unknown table qualifier {}", alias)))?;
                names.extend(binding.columns.iter().cloned());
            }
            SelectItem::UnnamedExpr(expr) => names.push(default_name(expr)),
            SelectItem::ExprWithAlias { alias, .. } => names.push(alias.value.clone()),
        }
    }
    Ok(names)
}

fn default_name(expr: &Expr) -> String {
    match expr {
        Expr::Identifier(ident) => ident.value.clone(),
        Expr::CompoundIdentifier(parts) => parts
            .last()
            .map(|ident| ident.value.clone())
            .unwrap_or_else(|| expr.to_string()),
        Expr::Function(function) => function
            .name
            .0
            .last()
            .map(|ident| ident.value.to_lowercase())
            .unwrap_or_else(|| expr.to_string()),
        other => other.to_string(),
    }
}

fn append_item_values(
    item: &SelectItem,
    eval: &Evaluator<'_>,
    row: &[Value],
    out: &mut Vec<Value>,
) -> Result<()> {
    match item {
        SelectItem::Wildcard(_) => {
            out.extend(row.iter().cloned());
        }
        SelectItem::QualifiedWildcard(qualifier, _) => {
            let alias = qualifier
                .0
                .last()
                .map(|ident| ident.value.clone())
                .unwrap_or_default();
            let binding = eval
                .bindings
                .iter()
                .find(|b| b.alias == alias)
                .ok_or_else(|| query_err(format!("unknown table qualifier {}", alias)))?;
            out.extend(
                row[binding.offset..binding.offset + binding.columns.len()]
                    .iter()
                    .cloned(),
            );
        }
        SelectItem::UnnamedExpr(expr) => out.push(eval.eval(expr, row)?),
        SelectItem::ExprWithAlias { expr, .. } => out.push(eval.eval(expr, row)?),
    }
    Ok(())
}

/// Canonical rendering for grouping/distinct keys; the kind tag keeps
/// `1` and `'1'` in different groups.
fn row_key_part(value: &Value) -> String {
    format!("{:?}:{}", value.kind(), value)
}

// ---------- Expression evaluation ----------

struct Evaluator<'a> {
    bindings: &'a [Binding],
}

impl Evaluator<'_> {
    fn resolve(&self, qualifier: Option<&str>, name: &str) -> Result<usize> {
        match qualifier {
            Some(qualifier) => {
                let binding = self
                    .bindings
                    .iter()
                    .find(|b| b.alias == qualifier)
                    .ok_or_else(|| query_err(format!("unknown table qualifier {}", qualifier)))?;
                let position = binding
                    .columns
                    .iter()
                    .position(|c| c == name)
                    .ok_or_else(|| {
                        query_err(format!("column {}.{} does not exist", qualifier, name))
                    })?;
                Ok(binding.offset + position)
            }
            None => {
                let mut found = None;
                for binding in self.bindings {
                    if let Some(position) = binding.columns.iter().position(|c| c == name) {
                        if found.is_some() {
                            return Err(query_err(format!("column {} is ambiguous", name)));
                        }
                        found = Some(binding.offset + position);
                    }
                }
                found.ok_or_else(|| query_err(format!("column {} does not exist", name)))
            }
        }
    }

    fn eval(&self, expr: &Expr, row: &[Value]) -> Result<Value> {
        match expr {
            Expr::Identifier(ident) => Ok(row[self.resolve(None, &ident.value)?].clone()),
            Expr::CompoundIdentifier(parts) => {
                if parts.len() != 2 {
                    return Err(query_err(format!(
                        "unsupported compound identifier {:?}",
                        parts
                    )));
                }
                Ok(row[self.resolve(Some(&parts[0].value), &parts[1].value)?].clone())
            }
            Expr::Value(value) => literal(value),
            Expr::Nested(inner) => self.eval(inner, row),
            Expr::IsNull(inner) => Ok(Value::Bool(self.eval(inner, row)?.is_null())),
            Expr::IsNotNull(inner) => Ok(Value::Bool(!self.eval(inner, row)?.is_null())),
            Expr::UnaryOp { op, expr } => {
                let value = self.eval(expr, row)?;
                unary_op(op, value)
            }
            Expr::BinaryOp { left, op, right } => {
                let lhs = self.eval(left, row)?;
                let rhs = self.eval(right, row)?;
                binary_op(op, lhs, rhs)
            }
            Expr::Between {
                expr,
                negated,
                low,
                high,
            } => {
                let value = self.eval(expr, row)?;
                let low = self.eval(low, row)?;
                let high = self.eval(high, row)?;
                let inside = matches!(cmp_values(&value, &low), Some(Ordering::Greater | Ordering::Equal))
                    && matches!(cmp_values(&value, &high), Some(Ordering::Less | Ordering::Equal));
                Ok(Value::Bool(inside != *negated))
            }
            Expr::InList {
                expr,
                list,
                negated,
            } => {
                let value = self.eval(expr, row)?;
                let mut found = false;
                for candidate in list {
                    let candidate = self.eval(candidate, row)?;
                    if cmp_values(&value, &candidate) == Some(Ordering::Equal) {
                        found = true;
                        break;
                    }
                }
                Ok(Value::Bool(found != *negated))
            }
            Expr::Like {
                negated,
                expr,
                pattern,
                ..
            } => {
                let value = self.eval(expr, row)?;
                let pattern = self.eval(pattern, row)?;
                match (value, pattern) {
                    (Value::Null, _) | (_, Value::Null) => Ok(Value::Bool(false)),
                    (value, pattern) => {
                        let matched = like_match(&value.to_string(), &pattern.to_string());
                        Ok(Value::Bool(matched != *negated))
                    }
                }
            }
            Expr::Function(function) => self.scalar_function(function, row),
            other => Err(query_err(format!(
                "expression {} is not supported in federated queries",
                other
            ))),
        }
    }

    /// Evaluate in aggregate context: aggregates compute over the group,
    /// everything else evaluates against the group's first row.
    fn eval_grouped(&self, expr: &Expr, group: &[Vec<Value>]) -> Result<Value> {
        match expr {
            Expr::Function(function) if is_aggregate(function) => {
                self.aggregate_function(function, group)
            }
            Expr::BinaryOp { left, op, right } => {
                let lhs = self.eval_grouped(left, group)?;
                let rhs = self.eval_grouped(right, group)?;
                binary_op(op, lhs, rhs)
            }
            Expr::UnaryOp { op, expr } => {
                let value = self.eval_grouped(expr, group)?;
                unary_op(op, value)
            }
            Expr::Nested(inner) => self.eval_grouped(inner, group),
            Expr::IsNull(inner) => Ok(Value::Bool(self.eval_grouped(inner, group)?.is_null())),
            Expr::IsNotNull(inner) => Ok(Value::Bool(!self.eval_grouped(inner, group)?.is_null())),
            other => {
                let first = group
                    .first()
                    .ok_or_else(|| query_err("aggregate group is empty"))?;
                self.eval(other, first)
            }
        }
    }

    fn scalar_function(&self, function: &Function, row: &[Value]) -> Result<Value> {
        if is_aggregate(function) {
            return Err(query_err(format!(
                "aggregate {} needs a GROUP BY context",
                function.name
            )));
        }
        let name = function_name(function);
        let args = function_args(function)?;

        let mut values = Vec::with_capacity(args.len());
        for arg in &args {
            match arg {
                FunctionArgExpr::Expr(expr) => values.push(self.eval(expr, row)?),
                _ => return Err(query_err(format!("unsupported argument for {}", name))),
            }
        }

        match name.as_str() {
            "lower" => single_text(&name, &values).map(|s| Value::Text(s.to_lowercase())),
            "upper" => single_text(&name, &values).map(|s| Value::Text(s.to_uppercase())),
            "length" => single_text(&name, &values).map(|s| Value::Int(s.chars().count() as i64)),
            "coalesce" => Ok(values
                .into_iter()
                .find(|v| !v.is_null())
                .unwrap_or(Value::Null)),
            other => Err(query_err(format!(
                "function {} is not supported in federated queries",
                other
            ))),
        }
    }

    fn aggregate_function(&self, function: &Function, group: &[Vec<Value>]) -> Result<Value> {
        let name = function_name(function);
        let args = function_args(function)?;

        // count(*) counts rows.
        if name == "count"
            && matches!(args.first(), Some(FunctionArgExpr::Wildcard) | None)
        {
            return Ok(Value::Int(group.len() as i64));
        }

        let Some(FunctionArgExpr::Expr(arg)) = args.first() else {
            return Err(query_err(format!("unsupported argument for {}", name)));
        };

        let mut values = Vec::with_capacity(group.len());
        for row in group {
            let value = self.eval(arg, row)?;
            if !value.is_null() {
                values.push(value);
            }
        }

        match name.as_str() {
            "count" => Ok(Value::Int(values.len() as i64)),
            "sum" | "avg" => {
                if values.is_empty() {
                    return Ok(Value::Null);
                }
                let all_ints = values.iter().all(|v| matches!(v, Value::Int(_)));
                let total: f64 = values
                    .iter()
                    .map(|v| v.as_f64().unwrap_or(0.0))
                    .sum();
                if name == "avg" {
                    Ok(Value::Float(total / values.len() as f64))
                } else if all_ints {
                    Ok(Value::Int(total as i64))
                } else {
                    Ok(Value::Float(total))
                }
            }
            "min" | "max" => {
                let mut best: Option<Value> = None;
                for value in values {
                    best = match best {
                        None => Some(value),
                        Some(current) => {
                            let replace = match cmp_values(&value, &current) {
                                Some(Ordering::Less) => name == "min",
                                Some(Ordering::Greater) => name == "max",
                                _ => false,
                            };
                            Some(if replace { value } else { current })
                        }
                    };
                }
                Ok(best.unwrap_or(Value::Null))
            }
            other => Err(query_err(format!("aggregate {} is not supported", other))),
        }
    }
}

fn function_name(function: &Function) -> String {
    function
        .name
        .0
        .last()
        .map(|ident| ident.value.to_lowercase())
        .unwrap_or_default()
}

fn function_args(function: &Function) -> Result<Vec<FunctionArgExpr>> {
    match &function.args {
        FunctionArguments::None => Ok(Vec::new()),
        FunctionArguments::List(list) => list
            .args
            .iter()
            .map(|arg| match arg {
                FunctionArg::Unnamed(expr) => Ok(expr.clone()),
                _ => Err(query_err("named function arguments are not supported")),
            })
            .collect(),
        FunctionArguments::Subquery(_) => {
            Err(query_err("subquery arguments are not supported"))
        }
    }
}

fn single_text(name: &str, values: &[Value]) -> Result<String> {
    match values {
        [Value::Text(text)] => Ok(text.clone()),
        [Value::Null] => Ok(String::new()),
        [_] => Err(query_err(format!("{} expects a text argument", name))),
        _ => Err(query_err(format!("{} expects exactly one argument", name))),
    }
}

fn is_aggregate(function: &Function) -> bool {
    matches!(
        function_name(function).as_str(),
        "count" | "sum" | "avg" | "min" | "max"
    )
}

fn select_item_has_aggregate(item: &SelectItem) -> bool {
    match item {
        SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
            expr_has_aggregate(expr)
        }
        _ => false,
    }
}

fn expr_has_aggregate(expr: &Expr) -> bool {
    match expr {
        Expr::Function(function) => is_aggregate(function),
        Expr::BinaryOp { left, right, .. } => {
            expr_has_aggregate(left) || expr_has_aggregate(right)
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) => expr_has_aggregate(expr),
        Expr::IsNull(expr) | Expr::IsNotNull(expr) => expr_has_aggregate(expr),
        _ => false,
    }
}

fn literal(value: &AstValue) -> Result<Value> {
    match value {
        AstValue::Number(text, _) => {
            if let Ok(n) = text.parse::<i64>() {
                Ok(Value::Int(n))
            } else {
                text.parse::<f64>()
                    .map(Value::Float)
                    .map_err(|_| query_err(format!("bad numeric literal {}", text)))
            }
        }
        AstValue::SingleQuotedString(text) | AstValue::DoubleQuotedString(text) => {
            Ok(Value::Text(text.clone()))
        }
        AstValue::Boolean(b) => Ok(Value::Bool(*b)),
        AstValue::Null => Ok(Value::Null),
        other => Err(query_err(format!("unsupported literal {:?}", other))),
    }
}

fn unary_op(op: &UnaryOperator, value: Value) -> Result<Value> {
    match op {
        UnaryOperator::Not => Ok(Value::Bool(!value.as_bool().unwrap_or(false))),
        UnaryOperator::Minus => match value {
            Value::Int(n) => Ok(Value::Int(-n)),
            Value::Float(f) => Ok(Value::Float(-f)),
            other => Err(query_err(format!("cannot negate {}", other))),
        },
        UnaryOperator::Plus => Ok(value),
        other => Err(query_err(format!("unsupported unary operator {:?}", other))),
    }
}

fn binary_op(op: &BinaryOperator, lhs: Value, rhs: Value) -> Result<Value> {
    match op {
        BinaryOperator::And => Ok(Value::Bool(
            lhs.as_bool().unwrap_or(false) && rhs.as_bool().unwrap_or(false),
        )),
        BinaryOperator::Or => Ok(Value::Bool(
            lhs.as_bool().unwrap_or(false) || rhs.as_bool().unwrap_or(false),
        )),
        BinaryOperator::Eq => Ok(Value::Bool(cmp_values(&lhs, &rhs) == Some(Ordering::Equal))),
        BinaryOperator::NotEq => match cmp_values(&lhs, &rhs) {
            None => Ok(Value::Bool(false)),
            Some(ordering) => Ok(Value::Bool(ordering != Ordering::Equal)),
        },
        BinaryOperator::Lt => Ok(Value::Bool(cmp_values(&lhs, &rhs) == Some(Ordering::Less))),
        BinaryOperator::LtEq => Ok(Value::Bool(matches!(
            cmp_values(&lhs, &rhs),
            Some(Ordering::Less | Ordering::Equal)
        ))),
        BinaryOperator::Gt => Ok(Value::Bool(
            cmp_values(&lhs, &rhs) == Some(Ordering::Greater),
        )),
        BinaryOperator::GtEq => Ok(Value::Bool(matches!(
            cmp_values(&lhs, &rhs),
            Some(Ordering::Greater | Ordering::Equal)
        ))),
        BinaryOperator::Plus
        | BinaryOperator::Minus
        | BinaryOperator::Multiply
        | BinaryOperator::Divide
        | BinaryOperator::Modulo => arithmetic(op, lhs, rhs),
        BinaryOperator::StringConcat => Ok(Value::Text(format!("{}{}", lhs, rhs))),
        other => Err(query_err(format!("unsupported operator {:?}", other))),
    }
}

fn arithmetic(op: &BinaryOperator, lhs: Value, rhs: Value) -> Result<Value> {
    if lhs.is_null() || rhs.is_null() {
        return Ok(Value::Null);
    }
    if let (Value::Int(a), Value::Int(b)) = (&lhs, &rhs) {
        return match op {
            BinaryOperator::Plus => Ok(Value::Int(a + b)),
            BinaryOperator::Minus => Ok(Value::Int(a - b)),
            BinaryOperator::Multiply => Ok(Value::Int(a * b)),
            BinaryOperator::Divide => {
                if *b == 0 {
                    Err(query_err("division by zero"))
                } else {
                    Ok(Value::Int(a / b))
                }
            }
            BinaryOperator::Modulo => {
                if *b == 0 {
                    Err(query_err("division by zero"))
                } else {
                    Ok(Value::Int(a % b))
                }
            }
            _ => unreachable!(),
        };
    }

    let (a, b) = match (lhs.as_f64(), rhs.as_f64()) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(query_err(format!(
                "arithmetic needs numeric operands, got {} and {}",
                lhs, rhs
            )));
        }
    };
    match op {
        BinaryOperator::Plus => Ok(Value::Float(a + b)),
        BinaryOperator::Minus => Ok(Value::Float(a - b)),
        BinaryOperator::Multiply => Ok(Value::Float(a * b)),
        BinaryOperator::Divide => {
            if b == 0.0 {
                Err(query_err("division by zero"))
            } else {
                Ok(Value::Float(a / b))
            }
        }
        BinaryOperator::Modulo => Ok(Value::Float(a % b)),
        _ => unreachable!(),
    }
}

/// Compare two values; None when either is NULL or the kinds are
/// incomparable.
pub(crate) fn cmp_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
        (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
        (Value::Time(a), Value::Time(b)) => Some(a.cmp(b)),
        (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
        (Value::Uuid(a), Value::Uuid(b)) => Some(a.cmp(b)),
        (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        },
    }
}

fn eval_const_u64(expr: &Expr) -> Result<u64> {
    match expr {
        Expr::Value(AstValue::Number(text, _)) => text
            .parse::<u64>()
            .map_err(|_| query_err(format!("bad LIMIT/OFFSET literal {}", text))),
        other => Err(query_err(format!(
            "LIMIT/OFFSET must be a literal, got {}",
            other
        ))),
    }
}

/// SQL LIKE with `%` and `_`, case-sensitive
fn like_match(text: &str, pattern: &str) -> bool {
    fn inner(text: &[char], pattern: &[char]) -> bool {
        match pattern.first() {
            None => text.is_empty(),
            Some('%') => {
                (0..=text.len()).any(|skip| inner(&text[skip..], &pattern[1..]))
            }
            Some('_') => !text.is_empty() && inner(&text[1..], &pattern[1..]),
            Some(c) => text.first() == Some(c) && inner(&text[1..], &pattern[1..]),
        }
    }
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    inner(&text, &pattern)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn users() -> VirtualTable {
        VirtualTable {
            name: "__sqlhub_ref_0".into(),
            columns: vec!["id".into(), "name".into()],
            rows: vec![
                vec![Value::Int(1), Value::Text("ada".into())],
                vec![Value::Int(2), Value::Text("grace".into())],
                vec![Value::Int(3), Value::Text("mary".into())],
            ],
        }
    }

    fn events() -> VirtualTable {
        VirtualTable {
            name: "__sqlhub_ref_1".into(),
            columns: vec!["user_id".into(), "kind".into()],
            rows: vec![
                vec![Value::Int(1), Value::Text("login".into())],
                vec![Value::Int(1), Value::Text("click".into())],
                vec![Value::Int(2), Value::Text("login".into())],
            ],
        }
    }

    fn tables() -> HashMap<String, VirtualTable> {
        let mut map = HashMap::new();
        map.insert("__sqlhub_ref_0".to_string(), users());
        map.insert("__sqlhub_ref_1".to_string(), events());
        map
    }

    #[test]
    fn test_projection_and_where() {
        let result = execute_merge(
            "SELECT name FROM __sqlhub_ref_0 AS users WHERE id > 1 ORDER BY name",
            &tables(),
            1_000,
        )
        .unwrap();
        assert_eq!(result.columns, vec!["name"]);
        assert_eq!(
            result.rows,
            vec![
                vec![Value::Text("grace".into())],
                vec![Value::Text("mary".into())],
            ]
        );
    }

    #[test]
    fn test_inner_join_group_by_count() {
        let sql = "SELECT u.name, count(*) AS events FROM __sqlhub_ref_0 u \
                   JOIN __sqlhub_ref_1 e ON e.user_id = u.id \
                   GROUP BY u.name ORDER BY u.name";
        let result = execute_merge(sql, &tables(), 1_000).unwrap();
        assert_eq!(result.columns, vec!["name", "events"]);
        assert_eq!(
            result.rows,
            vec![
                vec![Value::Text("ada".into()), Value::Int(2)],
                vec![Value::Text("grace".into()), Value::Int(1)],
            ]
        );
    }

    #[test]
    fn test_left_join_pads_nulls() {
        let sql = "SELECT u.name, e.kind FROM __sqlhub_ref_0 u \
                   LEFT JOIN __sqlhub_ref_1 e ON e.user_id = u.id \
                   ORDER BY u.name, e.kind";
        let result = execute_merge(sql, &tables(), 1_000).unwrap();
        assert_eq!(result.rows.len(), 4);
        let mary = result.rows.last().unwrap();
        assert_eq!(mary[0], Value::Text("mary".into()));
        assert_eq!(mary[1], Value::Null);
    }

    #[test]
    fn test_order_by_desc_and_limit() {
        let result = execute_merge(
            "SELECT id FROM __sqlhub_ref_0 AS users ORDER BY id DESC LIMIT 2",
            &tables(),
            1_000,
        )
        .unwrap();
        assert_eq!(
            result.rows,
            vec![vec![Value::Int(3)], vec![Value::Int(2)]]
        );
    }

    #[test]
    fn test_external_cap_applies() {
        let result = execute_merge(
            "SELECT id FROM __sqlhub_ref_0 AS users ORDER BY id",
            &tables(),
            2,
        )
        .unwrap();
        assert_eq!(result.rows.len(), 2);
    }

    #[test]
    fn test_aggregates_without_group_by() {
        let result = execute_merge(
            "SELECT count(*), min(id), max(id), avg(id) FROM __sqlhub_ref_0 AS users",
            &tables(),
            1_000,
        )
        .unwrap();
        assert_eq!(
            result.rows,
            vec![vec![
                Value::Int(3),
                Value::Int(1),
                Value::Int(3),
                Value::Float(2.0),
            ]]
        );
    }

    #[test]
    fn test_having_filters_groups() {
        let sql = "SELECT u.name, count(*) AS n FROM __sqlhub_ref_0 u \
                   JOIN __sqlhub_ref_1 e ON e.user_id = u.id \
                   GROUP BY u.name HAVING count(*) > 1";
        let result = execute_merge(sql, &tables(), 1_000).unwrap();
        assert_eq!(result.rows, vec![vec![Value::Text("ada".into()), Value::Int(2)]]);
    }

    #[test]
    fn test_insertion_order_without_order_by() {
        let result = execute_merge(
            "SELECT id FROM __sqlhub_ref_0 AS users",
            &tables(),
            1_000,
        )
        .unwrap();
        assert_eq!(
            result.rows,
            vec![vec![Value::Int(1)], vec![Value::Int(2)], vec![Value::Int(3)]]
        );
    }

    #[test]
    fn test_like_and_in_list() {
        let result = execute_merge(
            "SELECT name FROM __sqlhub_ref_0 AS users \
             WHERE name LIKE '%a%' AND id IN (1, 3) ORDER BY name",
            &tables(),
            1_000,
        )
        .unwrap();
        assert_eq!(
            result.rows,
            vec![vec![Value::Text("ada".into())], vec![Value::Text("mary".into())]]
        );
    }

    #[test]
    fn test_unknown_column_errors() {
        let err = execute_merge(
            "SELECT ghost FROM __sqlhub_ref_0 AS users",
            &tables(),
            1_000,
        )
        .unwrap_err();
        assert_eq!(err.kind(), sqlhub_core::ErrorKind::QueryError);
    }

    #[test]
    fn test_like_match_rules() {
        assert!(like_match("hello", "h%"));
        assert!(like_match("hello", "%llo"));
        assert!(like_match("hello", "h_llo"));
        assert!(!like_match("hello", "h_lo"));
        assert!(like_match("hello", "%"));
    }
}
