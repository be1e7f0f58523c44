//! Query builder - construct SELECT statements with a fluent API.

use super::dialect::Dialect;
use super::expr::Expr;
use super::token::{Token, TokenStream};

/// A SELECT list item: expression with optional alias.
#[derive(Debug, Clone, PartialEq)]
#[must_use = "builders have no effect until used"]
pub struct SelectExpr {
    pub expr: Expr,
    pub alias: Option<String>,
}

impl SelectExpr {
    pub fn new(expr: Expr) -> Self {
        Self { expr, alias: None }
    }

    pub fn with_alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.into());
        self
    }

    fn to_tokens(&self) -> TokenStream {
        let mut ts = self.expr.to_tokens();
        if let Some(alias) = &self.alias {
            ts.space()
                .push(Token::As)
                .space()
                .push(Token::Ident(alias.clone()));
        }
        ts
    }
}

impl From<Expr> for SelectExpr {
    fn from(expr: Expr) -> Self {
        SelectExpr::new(expr)
    }
}

/// A table reference with optional schema and alias.
#[derive(Debug, Clone, PartialEq)]
#[must_use = "builders have no effect until used"]
pub struct TableRef {
    pub schema: Option<String>,
    pub table: String,
    pub alias: Option<String>,
}

impl TableRef {
    pub fn new(table: &str) -> Self {
        Self {
            schema: None,
            table: table.into(),
            alias: None,
        }
    }

    /// Split a fully qualified `schema.table` name.
    pub fn from_fqn(fqn: &str) -> Self {
        match fqn.split_once('.') {
            Some((schema, table)) => Self {
                schema: Some(schema.into()),
                table: table.into(),
                alias: None,
            },
            None => Self::new(fqn),
        }
    }

    pub fn with_alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.into());
        self
    }

    fn to_tokens(&self) -> TokenStream {
        let mut ts = TokenStream::new();
        ts.push(Token::QualifiedIdent {
            schema: self.schema.clone(),
            name: self.table.clone(),
        });
        if let Some(alias) = &self.alias {
            ts.space()
                .push(Token::As)
                .space()
                .push(Token::Ident(alias.clone()));
        }
        ts
    }
}

/// Type of join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
    FullOuter,
}

/// A JOIN clause.
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub join_type: JoinType,
    pub table: TableRef,
    pub on: Option<Expr>,
}

impl Join {
    pub fn inner(table: TableRef, on: Expr) -> Self {
        Self {
            join_type: JoinType::Inner,
            table,
            on: Some(on),
        }
    }

    pub fn left(table: TableRef, on: Expr) -> Self {
        Self {
            join_type: JoinType::Left,
            table,
            on: Some(on),
        }
    }

    fn to_tokens(&self) -> TokenStream {
        let mut ts = TokenStream::new();
        match self.join_type {
            JoinType::Inner => {
                ts.push(Token::Inner);
            }
            JoinType::Left => {
                ts.push(Token::Left).space().push(Token::Outer);
            }
            JoinType::FullOuter => {
                ts.push(Token::Full).space().push(Token::Outer);
            }
        }
        ts.space().push(Token::Join).space();
        ts.append(&self.table.to_tokens());
        if let Some(on) = &self.on {
            ts.space().push(Token::On).space();
            ts.append(&on.to_tokens());
        }
        ts
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDir {
    #[default]
    Asc,
    Desc,
}

/// An ORDER BY expression.
#[derive(Debug, Clone, PartialEq)]
#[must_use = "builders have no effect until used"]
pub struct OrderByExpr {
    pub expr: Expr,
    pub dir: SortDir,
}

impl OrderByExpr {
    pub fn asc(expr: Expr) -> Self {
        Self {
            expr,
            dir: SortDir::Asc,
        }
    }

    pub fn desc(expr: Expr) -> Self {
        Self {
            expr,
            dir: SortDir::Desc,
        }
    }

    fn to_tokens(&self) -> TokenStream {
        let mut ts = self.expr.to_tokens();
        ts.space().push(match self.dir {
            SortDir::Asc => Token::Asc,
            SortDir::Desc => Token::Desc,
        });
        ts
    }
}

/// A SELECT query.
#[derive(Debug, Clone, Default, PartialEq)]
#[must_use = "builders have no effect until used"]
pub struct Query {
    pub select: Vec<SelectExpr>,
    pub from: Option<TableRef>,
    /// Subquery FROM source rendered verbatim with an alias.
    pub from_subquery: Option<(Box<Query>, String)>,
    pub joins: Vec<Join>,
    pub filters: Vec<Expr>,
    pub group_by: Vec<Expr>,
    pub order_by: Vec<OrderByExpr>,
    pub limit: Option<u64>,
    /// Dialect hint emitted verbatim ahead of the statement.
    pub prefix_with: Option<String>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(mut self, items: Vec<SelectExpr>) -> Self {
        self.select = items;
        self
    }

    pub fn select_expr(mut self, item: impl Into<SelectExpr>) -> Self {
        self.select.push(item.into());
        self
    }

    pub fn from(mut self, table: TableRef) -> Self {
        self.from = Some(table);
        self
    }

    pub fn from_subquery(mut self, query: Query, alias: &str) -> Self {
        self.from_subquery = Some((Box::new(query), alias.into()));
        self
    }

    pub fn join(mut self, join: Join) -> Self {
        self.joins.push(join);
        self
    }

    /// Add a WHERE predicate; predicates combine with AND.
    pub fn filter(mut self, expr: Expr) -> Self {
        self.filters.push(expr);
        self
    }

    pub fn group_by(mut self, exprs: Vec<Expr>) -> Self {
        self.group_by = exprs;
        self
    }

    pub fn order_by(mut self, exprs: Vec<OrderByExpr>) -> Self {
        self.order_by = exprs;
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn prefix_with(mut self, prefix: &str) -> Self {
        self.prefix_with = Some(prefix.into());
        self
    }

    pub fn to_tokens(&self) -> TokenStream {
        let mut ts = TokenStream::new();

        if let Some(prefix) = &self.prefix_with {
            ts.push(Token::Raw(prefix.clone())).space();
        }

        ts.push(Token::Select).space();
        let select_parts: Vec<TokenStream> =
            self.select.iter().map(|s| s.to_tokens()).collect();
        ts.append(&TokenStream::comma_separated(select_parts.iter()));

        if let Some((subquery, alias)) = &self.from_subquery {
            ts.space().push(Token::From).space().push(Token::LParen);
            ts.append(&subquery.to_tokens());
            ts.push(Token::RParen)
                .space()
                .push(Token::As)
                .space()
                .push(Token::Ident(alias.clone()));
        } else if let Some(from) = &self.from {
            ts.space().push(Token::From).space();
            ts.append(&from.to_tokens());
        }

        for join in &self.joins {
            ts.space();
            ts.append(&join.to_tokens());
        }

        if !self.filters.is_empty() {
            ts.space().push(Token::Where).space();
            for (i, filter) in self.filters.iter().enumerate() {
                if i > 0 {
                    ts.space().push(Token::And).space();
                }
                ts.push(Token::LParen);
                ts.append(&filter.to_tokens());
                ts.push(Token::RParen);
            }
        }

        if !self.group_by.is_empty() {
            ts.space().push(Token::GroupBy).space();
            let parts: Vec<TokenStream> = self.group_by.iter().map(|e| e.to_tokens()).collect();
            ts.append(&TokenStream::comma_separated(parts.iter()));
        }

        if !self.order_by.is_empty() {
            ts.space().push(Token::OrderBy).space();
            let parts: Vec<TokenStream> = self.order_by.iter().map(|o| o.to_tokens()).collect();
            ts.append(&TokenStream::comma_separated(parts.iter()));
        }

        if let Some(limit) = self.limit {
            ts.space().push(Token::Limit).space().push(Token::LitInt(limit as i64));
        }

        ts
    }

    pub fn to_sql(&self, dialect: Dialect) -> String {
        self.to_tokens().to_sql(dialect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::expr::{col, count_distinct, lit_str, sum, table_col, ExprExt};

    #[test]
    fn test_grouped_select() {
        let q = Query::new()
            .select(vec![
                SelectExpr::new(table_col("partners", "name")).with_alias("partner_name"),
                SelectExpr::new(sum(table_col("sales", "revenue"))).with_alias("revenue"),
            ])
            .from(TableRef::from_fqn("main.sales"))
            .filter(table_col("partners", "name").eq(lit_str("Partner A")))
            .group_by(vec![table_col("partners", "name")]);

        assert_eq!(
            q.to_sql(Dialect::Sqlite),
            "SELECT \"partners\".\"name\" AS \"partner_name\", \
             SUM(\"sales\".\"revenue\") AS \"revenue\" \
             FROM \"main\".\"sales\" \
             WHERE (\"partners\".\"name\" = 'Partner A') \
             GROUP BY \"partners\".\"name\""
        );
    }

    #[test]
    fn test_joins_and_order() {
        let q = Query::new()
            .select(vec![SelectExpr::new(count_distinct(table_col("leads", "id")))])
            .from(TableRef::from_fqn("main.leads"))
            .join(Join::inner(
                TableRef::from_fqn("main.campaigns"),
                table_col("leads", "campaign_id").eq(table_col("campaigns", "id")),
            ))
            .order_by(vec![OrderByExpr::asc(col("campaign_name"))])
            .limit(10);

        let sql = q.to_sql(Dialect::Sqlite);
        assert!(sql.contains("INNER JOIN \"main\".\"campaigns\" ON"));
        assert!(sql.ends_with("ORDER BY \"campaign_name\" ASC LIMIT 10"));
    }

    #[test]
    fn test_subquery_from() {
        let inner = Query::new()
            .select(vec![SelectExpr::new(col("a"))])
            .from(TableRef::new("t"));
        let outer = Query::new()
            .select(vec![SelectExpr::new(col("a"))])
            .from_subquery(inner, "base");
        assert_eq!(
            outer.to_sql(Dialect::Sqlite),
            "SELECT \"a\" FROM (SELECT \"a\" FROM \"t\") AS \"base\""
        );
    }

    #[test]
    fn test_prefix_with() {
        let q = Query::new()
            .select(vec![SelectExpr::new(col("x"))])
            .from(TableRef::new("t"))
            .prefix_with("/*+ NO_INDEX */");
        assert!(q.to_sql(Dialect::MySql).starts_with("/*+ NO_INDEX */ SELECT"));
    }
}
