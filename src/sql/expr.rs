//! Expression AST for the SQL the engine emits.
//!
//! Strongly typed where the engine builds structure (comparisons,
//! aggregates, coalesces); `Raw` carries declared datasource formulas
//! and dialect conversion expressions verbatim.

use super::dialect::Dialect;
use super::token::{Token, TokenStream};

/// A SQL expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Column reference: optional_table.column
    Column {
        table: Option<String>,
        column: String,
    },

    Literal(Literal),

    BinaryOp {
        left: Box<Expr>,
        op: BinaryOperator,
        right: Box<Expr>,
    },

    /// NOT expr
    Not(Box<Expr>),

    /// Function call: name(args...), optionally DISTINCT.
    Function {
        name: String,
        args: Vec<Expr>,
        distinct: bool,
    },

    In {
        expr: Box<Expr>,
        values: Vec<Expr>,
        negated: bool,
    },

    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
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

    Paren(Box<Expr>),

    /// Raw SQL emitted verbatim. Only trusted, declared fragments.
    Raw(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    String(String),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Eq,
    Ne,
    Lt,
    Gt,
    Lte,
    Gte,
    And,
    Or,
    Plus,
    Minus,
    Mul,
    Div,
    /// NULL-safe equality (`IS` in SQLite).
    Is,
}

impl BinaryOperator {
    fn token(&self) -> Token {
        match self {
            BinaryOperator::Eq => Token::Eq,
            BinaryOperator::Ne => Token::Ne,
            BinaryOperator::Lt => Token::Lt,
            BinaryOperator::Gt => Token::Gt,
            BinaryOperator::Lte => Token::Lte,
            BinaryOperator::Gte => Token::Gte,
            BinaryOperator::And => Token::And,
            BinaryOperator::Or => Token::Or,
            BinaryOperator::Plus => Token::Plus,
            BinaryOperator::Minus => Token::Minus,
            BinaryOperator::Mul => Token::Mul,
            BinaryOperator::Div => Token::Div,
            BinaryOperator::Is => Token::Is,
        }
    }
}

impl Expr {
    pub fn to_tokens(&self) -> TokenStream {
        let mut ts = TokenStream::new();
        self.write(&mut ts);
        ts
    }

    pub fn to_sql(&self, dialect: Dialect) -> String {
        self.to_tokens().to_sql(dialect)
    }

    fn write(&self, ts: &mut TokenStream) {
        match self {
            Expr::Column { table, column } => {
                ts.push(Token::QualifiedIdent {
                    schema: table.clone(),
                    name: column.clone(),
                });
            }
            Expr::Literal(lit) => {
                ts.push(match lit {
                    Literal::Int(i) => Token::LitInt(*i),
                    Literal::Float(f) => Token::LitFloat(*f),
                    Literal::String(s) => Token::LitString(s.clone()),
                    Literal::Bool(b) => Token::LitBool(*b),
                    Literal::Null => Token::LitNull,
                });
            }
            Expr::BinaryOp { left, op, right } => {
                left.write(ts);
                ts.space().push(op.token()).space();
                right.write(ts);
            }
            Expr::Not(inner) => {
                ts.push(Token::Not).space();
                inner.write(ts);
            }
            Expr::Function {
                name,
                args,
                distinct,
            } => {
                ts.push(Token::FunctionName(name.clone())).push(Token::LParen);
                if *distinct {
                    ts.push(Token::Distinct).space();
                }
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        ts.push(Token::Comma).space();
                    }
                    arg.write(ts);
                }
                ts.push(Token::RParen);
            }
            Expr::In {
                expr,
                values,
                negated,
            } => {
                expr.write(ts);
                ts.space();
                if *negated {
                    ts.push(Token::Not).space();
                }
                ts.push(Token::In).space().push(Token::LParen);
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        ts.push(Token::Comma).space();
                    }
                    value.write(ts);
                }
                ts.push(Token::RParen);
            }
            Expr::Between {
                expr,
                low,
                high,
                negated,
            } => {
                expr.write(ts);
                ts.space();
                if *negated {
                    ts.push(Token::Not).space();
                }
                ts.push(Token::Between).space();
                low.write(ts);
                ts.space().push(Token::And).space();
                high.write(ts);
            }
            Expr::IsNull { expr, negated } => {
                expr.write(ts);
                ts.space().push(if *negated {
                    Token::IsNotNull
                } else {
                    Token::IsNull
                });
            }
            Expr::Like {
                expr,
                pattern,
                negated,
            } => {
                expr.write(ts);
                ts.space();
                if *negated {
                    ts.push(Token::Not).space();
                }
                ts.push(Token::Like).space();
                pattern.write(ts);
            }
            Expr::Paren(inner) => {
                ts.push(Token::LParen);
                inner.write(ts);
                ts.push(Token::RParen);
            }
            Expr::Raw(raw) => {
                ts.push(Token::Raw(raw.clone()));
            }
        }
    }
}

// =============================================================================
// Constructors
// =============================================================================

pub fn col(name: &str) -> Expr {
    Expr::Column {
        table: None,
        column: name.into(),
    }
}

pub fn table_col(table: &str, name: &str) -> Expr {
    Expr::Column {
        table: Some(table.into()),
        column: name.into(),
    }
}

pub fn lit_int(v: i64) -> Expr {
    Expr::Literal(Literal::Int(v))
}

pub fn lit_float(v: f64) -> Expr {
    Expr::Literal(Literal::Float(v))
}

pub fn lit_str(v: &str) -> Expr {
    Expr::Literal(Literal::String(v.into()))
}

pub fn lit_bool(v: bool) -> Expr {
    Expr::Literal(Literal::Bool(v))
}

pub fn lit_null() -> Expr {
    Expr::Literal(Literal::Null)
}

pub fn raw(sql: impl Into<String>) -> Expr {
    Expr::Raw(sql.into())
}

pub fn func(name: &str, args: Vec<Expr>) -> Expr {
    Expr::Function {
        name: name.into(),
        args,
        distinct: false,
    }
}

pub fn sum(arg: Expr) -> Expr {
    func("SUM", vec![arg])
}

pub fn avg(arg: Expr) -> Expr {
    func("AVG", vec![arg])
}

pub fn min(arg: Expr) -> Expr {
    func("MIN", vec![arg])
}

pub fn max(arg: Expr) -> Expr {
    func("MAX", vec![arg])
}

pub fn count(arg: Expr) -> Expr {
    func("COUNT", vec![arg])
}

pub fn count_distinct(arg: Expr) -> Expr {
    Expr::Function {
        name: "COUNT".into(),
        args: vec![arg],
        distinct: true,
    }
}

pub fn coalesce(args: Vec<Expr>) -> Expr {
    func("COALESCE", args)
}

pub fn ifnull(arg: Expr, default: Expr) -> Expr {
    func("IFNULL", vec![arg, default])
}

pub fn nullif(arg: Expr, value: Expr) -> Expr {
    func("NULLIF", vec![arg, value])
}

/// Fluent comparison/combination helpers on expressions.
pub trait ExprExt: Sized {
    fn binop(self, op: BinaryOperator, right: Expr) -> Expr;

    fn eq(self, right: Expr) -> Expr {
        self.binop(BinaryOperator::Eq, right)
    }
    fn ne(self, right: Expr) -> Expr {
        self.binop(BinaryOperator::Ne, right)
    }
    fn gt(self, right: Expr) -> Expr {
        self.binop(BinaryOperator::Gt, right)
    }
    fn gte(self, right: Expr) -> Expr {
        self.binop(BinaryOperator::Gte, right)
    }
    fn lt(self, right: Expr) -> Expr {
        self.binop(BinaryOperator::Lt, right)
    }
    fn lte(self, right: Expr) -> Expr {
        self.binop(BinaryOperator::Lte, right)
    }
    fn and(self, right: Expr) -> Expr {
        self.binop(BinaryOperator::And, right)
    }
    fn or(self, right: Expr) -> Expr {
        self.binop(BinaryOperator::Or, right)
    }
    fn mul(self, right: Expr) -> Expr {
        self.binop(BinaryOperator::Mul, right)
    }
    fn div(self, right: Expr) -> Expr {
        self.binop(BinaryOperator::Div, right)
    }
    /// NULL-safe equality.
    fn is_not_distinct_from(self, right: Expr) -> Expr {
        self.binop(BinaryOperator::Is, right)
    }

    fn in_list(self, values: Vec<Expr>) -> Expr;
    fn not_in_list(self, values: Vec<Expr>) -> Expr;
    fn between(self, low: Expr, high: Expr) -> Expr;
    fn not_between(self, low: Expr, high: Expr) -> Expr;
    fn like(self, pattern: Expr) -> Expr;
    fn not_like(self, pattern: Expr) -> Expr;
    fn is_null(self) -> Expr;
    fn is_not_null(self) -> Expr;
    fn paren(self) -> Expr;
}

impl ExprExt for Expr {
    fn binop(self, op: BinaryOperator, right: Expr) -> Expr {
        Expr::BinaryOp {
            left: Box::new(self),
            op,
            right: Box::new(right),
        }
    }

    fn in_list(self, values: Vec<Expr>) -> Expr {
        Expr::In {
            expr: Box::new(self),
            values,
            negated: false,
        }
    }

    fn not_in_list(self, values: Vec<Expr>) -> Expr {
        Expr::In {
            expr: Box::new(self),
            values,
            negated: true,
        }
    }

    fn between(self, low: Expr, high: Expr) -> Expr {
        Expr::Between {
            expr: Box::new(self),
            low: Box::new(low),
            high: Box::new(high),
            negated: false,
        }
    }

    fn not_between(self, low: Expr, high: Expr) -> Expr {
        Expr::Between {
            expr: Box::new(self),
            low: Box::new(low),
            high: Box::new(high),
            negated: true,
        }
    }

    fn like(self, pattern: Expr) -> Expr {
        Expr::Like {
            expr: Box::new(self),
            pattern: Box::new(pattern),
            negated: false,
        }
    }

    fn not_like(self, pattern: Expr) -> Expr {
        Expr::Like {
            expr: Box::new(self),
            pattern: Box::new(pattern),
            negated: true,
        }
    }

    fn is_null(self) -> Expr {
        Expr::IsNull {
            expr: Box::new(self),
            negated: false,
        }
    }

    fn is_not_null(self) -> Expr {
        Expr::IsNull {
            expr: Box::new(self),
            negated: true,
        }
    }

    fn paren(self) -> Expr {
        Expr::Paren(Box::new(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comparison_sql() {
        let e = col("age").gte(lit_int(18)).and(col("active").eq(lit_bool(true)));
        assert_eq!(
            e.to_sql(Dialect::Sqlite),
            "\"age\" >= 18 AND \"active\" = 1"
        );
    }

    #[test]
    fn test_count_distinct() {
        let e = count_distinct(table_col("sales", "id"));
        assert_eq!(
            e.to_sql(Dialect::Postgres),
            "COUNT(DISTINCT \"sales\".\"id\")"
        );
    }

    #[test]
    fn test_in_and_between() {
        let e = col("partner_name").in_list(vec![lit_str("A"), lit_str("B")]);
        assert_eq!(e.to_sql(Dialect::Sqlite), "\"partner_name\" IN ('A', 'B')");

        let e = col("revenue").not_between(lit_int(1), lit_int(10));
        assert_eq!(e.to_sql(Dialect::Sqlite), "\"revenue\" NOT BETWEEN 1 AND 10");
    }

    #[test]
    fn test_is_null_and_like() {
        assert_eq!(
            col("x").is_not_null().to_sql(Dialect::Sqlite),
            "\"x\" IS NOT NULL"
        );
        assert_eq!(
            col("name").not_like(lit_str("%inc%")).to_sql(Dialect::Sqlite),
            "\"name\" NOT LIKE '%inc%'"
        );
    }

    #[test]
    fn test_weighted_sum_shape() {
        let e = sum(raw("1.0").mul(col("sale_size")).mul(col("quantity")));
        assert_eq!(
            e.to_sql(Dialect::Sqlite),
            "SUM(1.0 * \"sale_size\" * \"quantity\")"
        );
    }
}
