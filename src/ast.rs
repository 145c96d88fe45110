//! Shared scalar-expression and schema types.
//!
//! These are the dialect-independent building blocks the logical-tree
//! builder (`logical_tree`) and plan-signal extractor (`plan_signals`)
//! use to describe column contracts, filter predicates, and join keys
//! without depending on `sqlparser`'s own AST types directly.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for logical-tree / scalar-expression nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

/// Column reference, optionally qualified by table/CTE name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnRef {
    pub table: Option<String>,
    pub name: String,
}

impl ColumnRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            table: None,
            name: name.into(),
        }
    }

    pub fn with_table(table: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            table: Some(table.into()),
            name: name.into(),
        }
    }
}

/// Literal scalar value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Literal {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Date(String),
    Timestamp(String),
    Interval(String),
}

/// Scalar expression: column refs, literals, and operator trees.
///
/// Used for predicate capture (`Scan.filter_expr`, `Filter.predicates`)
/// and join-key capture — not a full relational-algebra IR, since the
/// logical tree itself (not this type) is the DAG structure the rest of
/// the system reasons about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScalarExpr {
    Column(ColumnRef),
    Literal(Literal),
    BinaryOp {
        left: Box<ScalarExpr>,
        op: BinaryOp,
        right: Box<ScalarExpr>,
    },
    UnaryOp {
        op: UnaryOp,
        expr: Box<ScalarExpr>,
    },
    Function {
        name: String,
        args: Vec<ScalarExpr>,
    },
    Case {
        operand: Option<Box<ScalarExpr>>,
        when_clauses: Vec<(ScalarExpr, ScalarExpr)>,
        else_clause: Option<Box<ScalarExpr>>,
    },
    In {
        expr: Box<ScalarExpr>,
        list: Vec<ScalarExpr>,
        negated: bool,
    },
    Between {
        expr: Box<ScalarExpr>,
        low: Box<ScalarExpr>,
        high: Box<ScalarExpr>,
        negated: bool,
    },
    /// Raw SQL fragment retained verbatim when we don't need to reason
    /// about an expression's structure, only render it for a prompt.
    Raw(String),
}

impl ScalarExpr {
    /// Render back to an approximate SQL fragment (prompt/debug use only,
    /// never re-parsed).
    pub fn to_sql_fragment(&self) -> String {
        match self {
            ScalarExpr::Column(c) => match &c.table {
                Some(t) => format!("{t}.{}", c.name),
                None => c.name.clone(),
            },
            ScalarExpr::Literal(l) => match l {
                Literal::Null => "NULL".to_string(),
                Literal::Boolean(b) => b.to_string(),
                Literal::Integer(i) => i.to_string(),
                Literal::Float(f) => f.to_string(),
                Literal::String(s) => format!("'{s}'"),
                Literal::Date(s) | Literal::Timestamp(s) | Literal::Interval(s) => s.clone(),
            },
            ScalarExpr::BinaryOp { left, op, right } => format!(
                "{} {} {}",
                left.to_sql_fragment(),
                op.as_sql(),
                right.to_sql_fragment()
            ),
            ScalarExpr::UnaryOp { op, expr } => {
                format!("{} {}", op.as_sql(), expr.to_sql_fragment())
            }
            ScalarExpr::Function { name, args } => format!(
                "{name}({})",
                args.iter()
                    .map(ScalarExpr::to_sql_fragment)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            ScalarExpr::Case { .. } => "CASE ...".to_string(),
            ScalarExpr::In { expr, negated, .. } => {
                format!(
                    "{} {}IN (...)",
                    expr.to_sql_fragment(),
                    if *negated { "NOT " } else { "" }
                )
            }
            ScalarExpr::Between {
                expr,
                low,
                high,
                negated,
            } => format!(
                "{} {}BETWEEN {} AND {}",
                expr.to_sql_fragment(),
                if *negated { "NOT " } else { "" },
                low.to_sql_fragment(),
                high.to_sql_fragment()
            ),
            ScalarExpr::Raw(s) => s.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Like,
    NotLike,
    ILike,
    NotILike,
}

impl BinaryOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Like => "LIKE",
            BinaryOp::NotLike => "NOT LIKE",
            BinaryOp::ILike => "ILIKE",
            BinaryOp::NotILike => "NOT ILIKE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Negate,
    IsNull,
    IsNotNull,
}

impl UnaryOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            UnaryOp::Not => "NOT",
            UnaryOp::Negate => "-",
            UnaryOp::IsNull => "IS NULL",
            UnaryOp::IsNotNull => "IS NOT NULL",
        }
    }
}

/// Output column contract for a logical-tree node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    pub columns: Vec<ColumnDef>,
}

impl Schema {
    pub fn new(columns: Vec<ColumnDef>) -> Self {
        Self { columns }
    }

    pub fn empty() -> Self {
        Self { columns: vec![] }
    }

    pub fn find_column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Integer,
    BigInt,
    Float,
    Double,
    Varchar(Option<u32>),
    Text,
    Date,
    Timestamp,
    Json,
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_generation_is_unique() {
        let a = NodeId::new();
        let b = NodeId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn column_ref_qualification() {
        let unqualified = ColumnRef::new("id");
        assert_eq!(unqualified.table, None);

        let qualified = ColumnRef::with_table("users", "id");
        assert_eq!(qualified.table, Some("users".to_string()));
    }

    #[test]
    fn schema_lookup() {
        let schema = Schema::new(vec![
            ColumnDef::new("id", DataType::BigInt).not_null(),
            ColumnDef::new("name", DataType::Varchar(Some(255))),
        ]);
        assert!(schema.find_column("id").is_some());
        assert!(schema.find_column("missing").is_none());
    }

    #[test]
    fn scalar_expr_renders_sql_fragment() {
        let expr = ScalarExpr::BinaryOp {
            left: Box::new(ScalarExpr::Column(ColumnRef::new("amt"))),
            op: BinaryOp::Gt,
            right: Box::new(ScalarExpr::Literal(Literal::Integer(100))),
        };
        assert_eq!(expr.to_sql_fragment(), "amt > 100");
    }
}
