//! SQL building: tokens, expressions, the query builder and dialects.

pub mod dialect;
pub mod expr;
pub mod query;
pub mod token;

pub use dialect::{Dialect, SqlDialect, TimePart};
pub use expr::{
    avg, coalesce, col, count, count_distinct, func, ifnull, lit_bool, lit_float, lit_int,
    lit_null, lit_str, max, min, nullif, raw, sum, table_col, BinaryOperator, Expr, ExprExt,
    Literal,
};
pub use query::{Join, JoinType, OrderByExpr, Query, SelectExpr, SortDir, TableRef};
pub use token::{Token, TokenStream};
