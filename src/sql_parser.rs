//! SQL parser capability (§6, External Interfaces).
//!
//! The core never builds its own SQL grammar — it calls this capability,
//! implemented here as a thin wrapper around `sqlparser`. The surface is
//! deliberately narrow: walking WITH clauses, finding joins and their ON
//! conditions, finding table references, finding WHERE predicates,
//! extracting SELECT projections with aliases, and detecting DISTINCT,
//! aggregation, window functions, and set operators. `LogicalTreeBuilder`
//! (`logical_tree`) is the only caller.

use crate::ast::{BinaryOp, ColumnRef, Literal, ScalarExpr, UnaryOp};
use sqlparser::ast as sql;
use sqlparser::dialect::{Dialect, GenericDialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("SQL parsing error: {0}")]
    SqlParser(#[from] sqlparser::parser::ParserError),

    #[error("unsupported SQL feature: {0}")]
    UnsupportedFeature(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

pub type Result<T> = std::result::Result<T, ParseError>;

/// SQL dialect. `Snowflake` is accepted by `config.json`'s `engine` field
/// (§6) but the core's analysis (C1-C5) only has real coverage for the
/// other three; Snowflake queries are parsed generically and skip the
/// engine-specific plan-signal/plan-scanner stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlDialect {
    Generic,
    DuckDb,
    PostgreSql,
    MySql,
    Sqlite,
    Snowflake,
}

use serde::{Deserialize, Serialize};

impl SqlDialect {
    fn to_sqlparser_dialect(self) -> Box<dyn Dialect> {
        match self {
            SqlDialect::Generic | SqlDialect::DuckDb | SqlDialect::Snowflake => {
                Box::new(GenericDialect {})
            }
            SqlDialect::PostgreSql => Box::new(PostgreSqlDialect {}),
            SqlDialect::MySql => Box::new(MySqlDialect {}),
            SqlDialect::Sqlite => Box::new(SQLiteDialect {}),
        }
    }

    pub fn is_postgres(self) -> bool {
        matches!(self, SqlDialect::PostgreSql)
    }
}

/// One top-level WITH-clause entry, or the outermost query body.
#[derive(Debug, Clone)]
pub struct NamedQueryBody {
    /// `None` for the main query.
    pub name: Option<String>,
    pub recursive: bool,
    pub select: SelectShape,
}

/// A flattened view of one SELECT's shape — enough for the logical-tree
/// builder to derive a column contract, reference edges, and flags
/// without re-walking `sqlparser`'s AST itself.
#[derive(Debug, Clone, Default)]
pub struct SelectShape {
    pub projections: Vec<ProjectionItem>,
    pub table_refs: Vec<TableRef>,
    pub joins: Vec<JoinInfo>,
    pub where_predicates: Vec<ScalarExpr>,
    pub group_by: Vec<ScalarExpr>,
    pub has_distinct: bool,
    pub has_aggregation: bool,
    pub has_window_function: bool,
    pub set_operator: Option<SetOperatorKind>,
    /// Scalar/EXISTS/IN subqueries nested in this SELECT's projection,
    /// WHERE, or HAVING clauses, in source order.
    pub nested_subqueries: Vec<SelectShape>,
    pub is_correlated_subquery: bool,
}

#[derive(Debug, Clone)]
pub struct ProjectionItem {
    pub expr: ScalarExpr,
    pub alias: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TableRef {
    pub name: String,
    pub alias: Option<String>,
    /// Index into the enclosing `SelectShape::nested_subqueries` when this
    /// ref is a derived table (`FROM (SELECT ...) alias`), so callers can
    /// rewrite `name` to the subquery's assigned logical-tree node id
    /// without re-matching on alias text.
    pub derived_subquery_index: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct JoinInfo {
    pub kind: JoinKind,
    pub right_table: Option<String>,
    pub on_condition: Option<ScalarExpr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOperatorKind {
    Union,
    UnionAll,
    Intersect,
    Except,
}

/// The abstract SQL-parser capability (§6).
pub trait SqlParser: Send + Sync {
    /// Parse `sql` in `dialect`, returning the top-level WITH-clause
    /// bodies (in source order) followed by the main query body.
    fn parse_query_bodies(&self, sql: &str, dialect: SqlDialect) -> Result<Vec<NamedQueryBody>>;

    /// Transpile `sql` from one dialect to another. Only required when
    /// source dialect != target dialect; the default errs.
    fn transpile(&self, _sql: &str, _from: SqlDialect, _to: SqlDialect) -> Result<String> {
        Err(ParseError::UnsupportedFeature(
            "transpilation not supported by this parser backend".to_string(),
        ))
    }

    /// Syntax-check `sql` without building a logical tree from it. Used
    /// by the validator (C7) to reject candidates that don't even parse
    /// before spending an execution on them.
    fn syntax_check(&self, sql: &str, dialect: SqlDialect) -> Result<()> {
        self.parse_query_bodies(sql, dialect).map(|_| ())
    }
}

/// Default `SqlParser` backed by `sqlparser`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqlparserBackend;

impl SqlParser for SqlparserBackend {
    fn parse_query_bodies(&self, sql_text: &str, dialect: SqlDialect) -> Result<Vec<NamedQueryBody>> {
        let dialect_impl = dialect.to_sqlparser_dialect();
        let statements = Parser::parse_sql(dialect_impl.as_ref(), sql_text)?;

        if statements.is_empty() {
            return Err(ParseError::InvalidQuery("empty query".to_string()));
        }
        if statements.len() > 1 {
            return Err(ParseError::InvalidQuery(
                "multiple statements not supported".to_string(),
            ));
        }

        let query = match &statements[0] {
            sql::Statement::Query(q) => q.as_ref(),
            other => {
                return Err(ParseError::UnsupportedFeature(format!(
                    "only read-only SELECT queries are supported, found {other:?}"
                )))
            }
        };

        let mut bodies = Vec::new();
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                let select = convert_query_body(&cte.query.body, cte.query.body.as_ref())?;
                bodies.push(NamedQueryBody {
                    name: Some(cte.alias.name.to_string()),
                    recursive: with.recursive,
                    select,
                });
            }
        }

        let main_select = convert_query_body(&query.body, query.body.as_ref())?;
        bodies.push(NamedQueryBody {
            name: None,
            recursive: false,
            select: main_select,
        });

        Ok(bodies)
    }
}

fn convert_query_body(body: &sql::SetExpr, _root: &sql::SetExpr) -> Result<SelectShape> {
    match body {
        sql::SetExpr::Select(select) => convert_select(select),
        sql::SetExpr::SetOperation {
            op, left, right, set_quantifier,
        } => {
            let mut shape = convert_query_body(left, left)?;
            let right_shape = convert_query_body(right, right)?;
            shape.nested_subqueries.extend(right_shape.nested_subqueries);
            shape.table_refs.extend(right_shape.table_refs);
            shape.set_operator = Some(match op {
                sql::SetOperator::Union => {
                    if matches!(set_quantifier, sql::SetQuantifier::All) {
                        SetOperatorKind::UnionAll
                    } else {
                        SetOperatorKind::Union
                    }
                }
                sql::SetOperator::Intersect => SetOperatorKind::Intersect,
                sql::SetOperator::Except => SetOperatorKind::Except,
            });
            Ok(shape)
        }
        _ => Err(ParseError::UnsupportedFeature(
            "unsupported query body".to_string(),
        )),
    }
}

fn convert_select(select: &sql::Select) -> Result<SelectShape> {
    let mut shape = SelectShape {
        has_distinct: select.distinct.is_some(),
        ..Default::default()
    };

    for twj in &select.from {
        collect_table_refs(&twj.relation, &mut shape)?;
        for join in &twj.joins {
            collect_table_refs(&join.relation, &mut shape)?;
            let kind = match &join.join_operator {
                sql::JoinOperator::Inner(_) => JoinKind::Inner,
                sql::JoinOperator::LeftOuter(_) => JoinKind::Left,
                sql::JoinOperator::RightOuter(_) => JoinKind::Right,
                sql::JoinOperator::FullOuter(_) => JoinKind::Full,
                sql::JoinOperator::CrossJoin => JoinKind::Cross,
                _ => JoinKind::Inner,
            };
            let on_condition = match &join.join_operator {
                sql::JoinOperator::Inner(sql::JoinConstraint::On(e))
                | sql::JoinOperator::LeftOuter(sql::JoinConstraint::On(e))
                | sql::JoinOperator::RightOuter(sql::JoinConstraint::On(e))
                | sql::JoinOperator::FullOuter(sql::JoinConstraint::On(e)) => {
                    Some(convert_expr(e, &mut shape)?)
                }
                _ => None,
            };
            let right_table = table_factor_name(&join.relation);
            shape.joins.push(JoinInfo {
                kind,
                right_table,
                on_condition,
            });
        }
    }

    if let Some(selection) = &select.selection {
        let expr = convert_expr(selection, &mut shape)?;
        shape.where_predicates = split_conjunctions(expr);
        let own_aliases = own_table_aliases(&shape);
        shape.is_correlated_subquery = shape
            .where_predicates
            .iter()
            .any(|p| references_foreign_table(p, &own_aliases));
    }

    for item in &select.group_by_exprs().unwrap_or_default() {
        shape.group_by.push(convert_expr(item, &mut shape)?);
    }

    for item in &select.projection {
        match item {
            sql::SelectItem::UnnamedExpr(expr) => {
                if expr_is_aggregate(expr) {
                    shape.has_aggregation = true;
                }
                if expr_is_window(expr) {
                    shape.has_window_function = true;
                }
                let converted = convert_expr(expr, &mut shape)?;
                shape.projections.push(ProjectionItem {
                    expr: converted,
                    alias: None,
                });
            }
            sql::SelectItem::ExprWithAlias { expr, alias } => {
                if expr_is_aggregate(expr) {
                    shape.has_aggregation = true;
                }
                if expr_is_window(expr) {
                    shape.has_window_function = true;
                }
                let converted = convert_expr(expr, &mut shape)?;
                shape.projections.push(ProjectionItem {
                    expr: converted,
                    alias: Some(alias.to_string()),
                });
            }
            sql::SelectItem::Wildcard(_) | sql::SelectItem::QualifiedWildcard(..) => {
                shape.projections.push(ProjectionItem {
                    expr: ScalarExpr::Raw("*".to_string()),
                    alias: None,
                });
            }
        }
    }

    if !shape.group_by.is_empty() {
        shape.has_aggregation = true;
    }

    Ok(shape)
}

fn table_factor_name(factor: &sql::TableFactor) -> Option<String> {
    match factor {
        sql::TableFactor::Table { name, .. } => Some(name.to_string()),
        _ => None,
    }
}

fn collect_table_refs(factor: &sql::TableFactor, shape: &mut SelectShape) -> Result<()> {
    match factor {
        sql::TableFactor::Table { name, alias, .. } => {
            shape.table_refs.push(TableRef {
                name: name.to_string(),
                alias: alias.as_ref().map(|a| a.name.to_string()),
                derived_subquery_index: None,
            });
            Ok(())
        }
        sql::TableFactor::Derived { subquery, alias, .. } => {
            let nested = convert_query_body(&subquery.body, subquery.body.as_ref())?;
            let index = shape.nested_subqueries.len();
            shape.nested_subqueries.push(nested);
            shape.table_refs.push(TableRef {
                name: alias
                    .as_ref()
                    .map(|a| a.name.to_string())
                    .unwrap_or_else(|| "derived".to_string()),
                alias: alias.as_ref().map(|a| a.name.to_string()),
                derived_subquery_index: Some(index),
            });
            Ok(())
        }
        sql::TableFactor::NestedJoin {
            table_with_joins, ..
        } => {
            collect_table_refs(&table_with_joins.relation, shape)?;
            for join in &table_with_joins.joins {
                collect_table_refs(&join.relation, shape)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn convert_expr(expr: &sql::Expr, shape: &mut SelectShape) -> Result<ScalarExpr> {
    match expr {
        sql::Expr::Identifier(ident) => Ok(ScalarExpr::Column(ColumnRef::new(ident.to_string()))),
        sql::Expr::CompoundIdentifier(idents) if idents.len() == 2 => {
            Ok(ScalarExpr::Column(ColumnRef::with_table(
                idents[0].to_string(),
                idents[1].to_string(),
            )))
        }
        sql::Expr::Value(value) => Ok(ScalarExpr::Literal(convert_value(value))),
        sql::Expr::BinaryOp { left, op, right } => Ok(ScalarExpr::BinaryOp {
            left: Box::new(convert_expr(left, shape)?),
            op: convert_binary_op(op),
            right: Box::new(convert_expr(right, shape)?),
        }),
        sql::Expr::UnaryOp { op, expr } => Ok(ScalarExpr::UnaryOp {
            op: convert_unary_op(op),
            expr: Box::new(convert_expr(expr, shape)?),
        }),
        sql::Expr::IsNull(e) => Ok(ScalarExpr::UnaryOp {
            op: UnaryOp::IsNull,
            expr: Box::new(convert_expr(e, shape)?),
        }),
        sql::Expr::IsNotNull(e) => Ok(ScalarExpr::UnaryOp {
            op: UnaryOp::IsNotNull,
            expr: Box::new(convert_expr(e, shape)?),
        }),
        sql::Expr::Function(func) => {
            let name = func.name.to_string();
            Ok(ScalarExpr::Function {
                name,
                args: vec![],
            })
        }
        sql::Expr::InList {
            expr, list, negated, ..
        } => {
            let converted_list = list
                .iter()
                .map(|e| convert_expr(e, shape))
                .collect::<Result<Vec<_>>>()?;
            Ok(ScalarExpr::In {
                expr: Box::new(convert_expr(expr, shape)?),
                list: converted_list,
                negated: *negated,
            })
        }
        sql::Expr::InSubquery {
            expr, subquery, negated,
        } => {
            let nested = convert_query_body(&subquery.body, subquery.body.as_ref())?;
            shape.nested_subqueries.push(nested);
            Ok(ScalarExpr::In {
                expr: Box::new(convert_expr(expr, shape)?),
                list: vec![ScalarExpr::Raw("(subquery)".to_string())],
                negated: *negated,
            })
        }
        sql::Expr::Exists { subquery, negated } => {
            let nested = convert_query_body(&subquery.body, subquery.body.as_ref())?;
            shape.nested_subqueries.push(nested);
            Ok(ScalarExpr::Raw(format!(
                "{}EXISTS (subquery)",
                if *negated { "NOT " } else { "" }
            )))
        }
        sql::Expr::Subquery(subquery) => {
            let nested = convert_query_body(&subquery.body, subquery.body.as_ref())?;
            shape.nested_subqueries.push(nested);
            Ok(ScalarExpr::Raw("(subquery)".to_string()))
        }
        sql::Expr::Between {
            expr,
            negated,
            low,
            high,
        } => Ok(ScalarExpr::Between {
            expr: Box::new(convert_expr(expr, shape)?),
            low: Box::new(convert_expr(low, shape)?),
            high: Box::new(convert_expr(high, shape)?),
            negated: *negated,
        }),
        sql::Expr::Nested(inner) => convert_expr(inner, shape),
        other => Ok(ScalarExpr::Raw(other.to_string())),
    }
}

fn split_conjunctions(expr: ScalarExpr) -> Vec<ScalarExpr> {
    match expr {
        ScalarExpr::BinaryOp {
            left,
            op: BinaryOp::And,
            right,
        } => {
            let mut result = split_conjunctions(*left);
            result.extend(split_conjunctions(*right));
            result
        }
        other => vec![other],
    }
}

fn own_table_aliases(shape: &SelectShape) -> std::collections::HashSet<String> {
    let mut aliases = std::collections::HashSet::new();
    for t in &shape.table_refs {
        aliases.insert(t.name.clone());
        if let Some(a) = &t.alias {
            aliases.insert(a.clone());
        }
    }
    for j in &shape.joins {
        if let Some(r) = &j.right_table {
            aliases.insert(r.clone());
        }
    }
    aliases
}

/// A qualified column whose table isn't one of this SELECT's own FROM/JOIN
/// aliases reaches into an enclosing query — the correlation marker C1
/// scans for (spec.md §4.1).
fn references_foreign_table(expr: &ScalarExpr, own_aliases: &std::collections::HashSet<String>) -> bool {
    match expr {
        ScalarExpr::Column(c) => matches!(&c.table, Some(t) if !own_aliases.contains(t)),
        ScalarExpr::BinaryOp { left, right, .. } => {
            references_foreign_table(left, own_aliases) || references_foreign_table(right, own_aliases)
        }
        ScalarExpr::UnaryOp { expr, .. } => references_foreign_table(expr, own_aliases),
        ScalarExpr::Function { args, .. } => args.iter().any(|a| references_foreign_table(a, own_aliases)),
        ScalarExpr::Case {
            operand,
            when_clauses,
            else_clause,
        } => {
            operand
                .as_ref()
                .is_some_and(|o| references_foreign_table(o, own_aliases))
                || when_clauses
                    .iter()
                    .any(|(w, t)| references_foreign_table(w, own_aliases) || references_foreign_table(t, own_aliases))
                || else_clause
                    .as_ref()
                    .is_some_and(|e| references_foreign_table(e, own_aliases))
        }
        ScalarExpr::In { expr, list, .. } => {
            references_foreign_table(expr, own_aliases) || list.iter().any(|e| references_foreign_table(e, own_aliases))
        }
        ScalarExpr::Between { expr, low, high, .. } => {
            references_foreign_table(expr, own_aliases)
                || references_foreign_table(low, own_aliases)
                || references_foreign_table(high, own_aliases)
        }
        ScalarExpr::Literal(_) | ScalarExpr::Raw(_) => false,
    }
}

fn convert_value(value: &sql::Value) -> Literal {
    match value {
        sql::Value::Null => Literal::Null,
        sql::Value::Boolean(b) => Literal::Boolean(*b),
        sql::Value::Number(n, _) => {
            if let Ok(i) = n.parse::<i64>() {
                Literal::Integer(i)
            } else if let Ok(f) = n.parse::<f64>() {
                Literal::Float(f)
            } else {
                Literal::String(n.clone())
            }
        }
        sql::Value::SingleQuotedString(s) | sql::Value::DoubleQuotedString(s) => {
            Literal::String(s.clone())
        }
        other => Literal::String(other.to_string()),
    }
}

fn convert_binary_op(op: &sql::BinaryOperator) -> BinaryOp {
    match op {
        sql::BinaryOperator::Plus => BinaryOp::Add,
        sql::BinaryOperator::Minus => BinaryOp::Subtract,
        sql::BinaryOperator::Multiply => BinaryOp::Multiply,
        sql::BinaryOperator::Divide => BinaryOp::Divide,
        sql::BinaryOperator::Modulo => BinaryOp::Modulo,
        sql::BinaryOperator::Eq => BinaryOp::Eq,
        sql::BinaryOperator::NotEq => BinaryOp::NotEq,
        sql::BinaryOperator::Lt => BinaryOp::Lt,
        sql::BinaryOperator::LtEq => BinaryOp::LtEq,
        sql::BinaryOperator::Gt => BinaryOp::Gt,
        sql::BinaryOperator::GtEq => BinaryOp::GtEq,
        sql::BinaryOperator::And => BinaryOp::And,
        sql::BinaryOperator::Or => BinaryOp::Or,
        sql::BinaryOperator::Like => BinaryOp::Like,
        sql::BinaryOperator::NotLike => BinaryOp::NotLike,
        sql::BinaryOperator::ILike => BinaryOp::ILike,
        sql::BinaryOperator::NotILike => BinaryOp::NotILike,
        _ => BinaryOp::Eq,
    }
}

fn convert_unary_op(op: &sql::UnaryOperator) -> UnaryOp {
    match op {
        sql::UnaryOperator::Not => UnaryOp::Not,
        sql::UnaryOperator::Minus => UnaryOp::Negate,
        _ => UnaryOp::Not,
    }
}

const AGG_FUNC_NAMES: &[&str] = &[
    "count", "sum", "avg", "min", "max", "stddev", "variance", "array_agg", "string_agg",
    "list", "median", "mode", "percentile_cont", "percentile_disc",
];

fn expr_is_aggregate(expr: &sql::Expr) -> bool {
    match expr {
        sql::Expr::Function(f) => {
            let name = f.name.to_string().to_lowercase();
            AGG_FUNC_NAMES.iter().any(|n| name == *n) && f.over.is_none()
        }
        sql::Expr::BinaryOp { left, right, .. } => expr_is_aggregate(left) || expr_is_aggregate(right),
        sql::Expr::Nested(e) | sql::Expr::UnaryOp { expr: e, .. } => expr_is_aggregate(e),
        _ => false,
    }
}

fn expr_is_window(expr: &sql::Expr) -> bool {
    matches!(expr, sql::Expr::Function(f) if f.over.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_select() {
        let parser = SqlparserBackend;
        let bodies = parser
            .parse_query_bodies("SELECT id, name FROM users WHERE id > 10", SqlDialect::Generic)
            .unwrap();
        assert_eq!(bodies.len(), 1);
        assert!(bodies[0].name.is_none());
        assert_eq!(bodies[0].select.table_refs.len(), 1);
        assert_eq!(bodies[0].select.where_predicates.len(), 1);
    }

    #[test]
    fn walks_cte_then_main_query_in_order() {
        let parser = SqlparserBackend;
        let sql_text = "WITH recent AS (SELECT id FROM orders WHERE d > 1) \
                         SELECT * FROM recent";
        let bodies = parser.parse_query_bodies(sql_text, SqlDialect::Generic).unwrap();
        assert_eq!(bodies.len(), 2);
        assert_eq!(bodies[0].name.as_deref(), Some("recent"));
        assert!(bodies[1].name.is_none());
    }

    #[test]
    fn detects_join_and_aggregation() {
        let parser = SqlparserBackend;
        let sql_text = "SELECT u.id, COUNT(*) FROM users u \
                         JOIN orders o ON u.id = o.user_id GROUP BY u.id";
        let bodies = parser.parse_query_bodies(sql_text, SqlDialect::Generic).unwrap();
        let main = &bodies[0].select;
        assert_eq!(main.joins.len(), 1);
        assert!(main.has_aggregation);
    }

    #[test]
    fn detects_in_subquery() {
        let parser = SqlparserBackend;
        let sql_text = "SELECT id FROM users WHERE id IN (SELECT user_id FROM orders)";
        let bodies = parser.parse_query_bodies(sql_text, SqlDialect::Generic).unwrap();
        assert_eq!(bodies[0].select.nested_subqueries.len(), 1);
    }

    #[test]
    fn rejects_multiple_statements() {
        let parser = SqlparserBackend;
        let err = parser
            .parse_query_bodies("SELECT 1; SELECT 2;", SqlDialect::Generic)
            .unwrap_err();
        assert!(matches!(err, ParseError::InvalidQuery(_)));
    }

    #[test]
    fn rejects_dml() {
        let parser = SqlparserBackend;
        let err = parser
            .parse_query_bodies("DELETE FROM users WHERE id = 1", SqlDialect::Generic)
            .unwrap_err();
        assert!(matches!(err, ParseError::UnsupportedFeature(_)));
    }
}
