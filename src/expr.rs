use crate::statement::Select;
use crate::value::Value;

/// A column qualified by the table name or alias it is read from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    pub qualifier: String,
    pub column: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl BinaryOp {
    pub fn as_sql(self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
        }
    }
}

/// Predicate and scalar expression tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(ColumnRef),
    Value(Value),
    Lower(Box<Expr>),
    Tuple(Vec<Expr>),
    BinaryOp {
        lhs: Box<Expr>,
        op: BinaryOp,
        rhs: Box<Expr>,
    },
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        negated: bool,
    },
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    InSubquery {
        expr: Box<Expr>,
        subquery: Box<Select>,
    },
    And(Vec<Expr>),
    Exists(Box<Select>),
}

impl Expr {
    pub fn column(qualifier: impl Into<String>, column: impl Into<String>) -> Self {
        Expr::Column(ColumnRef {
            qualifier: qualifier.into(),
            column: column.into(),
        })
    }

    pub fn value(value: impl Into<Value>) -> Self {
        Expr::Value(value.into())
    }

    pub fn lower(self) -> Self {
        Expr::Lower(Box::new(self))
    }

    pub fn binary(lhs: Expr, op: BinaryOp, rhs: Expr) -> Self {
        Expr::BinaryOp {
            lhs: Box::new(lhs),
            op,
            rhs: Box::new(rhs),
        }
    }

    pub fn eq(lhs: Expr, rhs: Expr) -> Self {
        Self::binary(lhs, BinaryOp::Eq, rhs)
    }

    pub fn is_null(self) -> Self {
        Expr::IsNull {
            expr: Box::new(self),
            negated: false,
        }
    }

    pub fn is_not_null(self) -> Self {
        Expr::IsNull {
            expr: Box::new(self),
            negated: true,
        }
    }

    pub fn like(self, pattern: Expr, negated: bool) -> Self {
        Expr::Like {
            expr: Box::new(self),
            pattern: Box::new(pattern),
            negated,
        }
    }

    pub fn in_list(self, list: Vec<Expr>, negated: bool) -> Self {
        Expr::InList {
            expr: Box::new(self),
            list,
            negated,
        }
    }

    pub fn in_subquery(self, subquery: Select) -> Self {
        Expr::InSubquery {
            expr: Box::new(self),
            subquery: Box::new(subquery),
        }
    }

    /// Conjunction of `exprs`, collapsing the single-element case.
    pub fn and(mut exprs: Vec<Expr>) -> Self {
        if exprs.len() == 1 {
            exprs.remove(0)
        } else {
            Expr::And(exprs)
        }
    }

    pub fn exists(select: Select) -> Self {
        Expr::Exists(Box::new(select))
    }

    /// Equality that renders `IS NULL` when compared against null.
    pub(crate) fn eq_or_is_null(lhs: Expr, value: Value) -> Self {
        if value.is_null() {
            lhs.is_null()
        } else {
            Self::eq(lhs, Expr::Value(value))
        }
    }

    /// Inequality that renders `IS NOT NULL` when compared against null.
    pub(crate) fn ne_or_is_not_null(lhs: Expr, value: Value) -> Self {
        if value.is_null() {
            lhs.is_not_null()
        } else {
            Self::binary(lhs, BinaryOp::Ne, Expr::Value(value))
        }
    }
}
