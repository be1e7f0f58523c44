//! SQL tokens - the atomic units of SQL output.
//!
//! Tokens are dialect-agnostic; rendering resolves quoting and literal
//! formatting through the dialect.

use super::dialect::{Dialect, SqlDialect};

/// A single element of a SQL statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Keywords
    Select,
    From,
    Where,
    And,
    Or,
    Not,
    As,
    On,
    Join,
    Inner,
    Left,
    Full,
    Outer,
    GroupBy,
    Having,
    OrderBy,
    Asc,
    Desc,
    Limit,
    In,
    Between,
    Like,
    Is,
    IsNull,
    IsNotNull,
    Distinct,
    Union,
    All,

    // Punctuation
    Comma,
    LParen,
    RParen,

    // Operators
    Eq,
    Ne,
    Lt,
    Gt,
    Lte,
    Gte,
    Plus,
    Minus,
    Mul,
    Div,

    // Formatting
    Space,

    // Dynamic content
    /// Identifier, quoted per dialect.
    Ident(String),
    /// `schema.name` (or bare name), each part quoted per dialect.
    QualifiedIdent {
        schema: Option<String>,
        name: String,
    },
    LitInt(i64),
    LitFloat(f64),
    LitString(String),
    LitBool(bool),
    LitNull,
    /// Function name, rendered as-is.
    FunctionName(String),
    /// Raw SQL emitted verbatim. Only for trusted fragments (declared
    /// ds_formulas, dialect conversion expressions); never user values.
    Raw(String),
}

impl Token {
    fn render(&self, dialect: Dialect) -> String {
        match self {
            Token::Select => "SELECT".into(),
            Token::From => "FROM".into(),
            Token::Where => "WHERE".into(),
            Token::And => "AND".into(),
            Token::Or => "OR".into(),
            Token::Not => "NOT".into(),
            Token::As => "AS".into(),
            Token::On => "ON".into(),
            Token::Join => "JOIN".into(),
            Token::Inner => "INNER".into(),
            Token::Left => "LEFT".into(),
            Token::Full => "FULL".into(),
            Token::Outer => "OUTER".into(),
            Token::GroupBy => "GROUP BY".into(),
            Token::Having => "HAVING".into(),
            Token::OrderBy => "ORDER BY".into(),
            Token::Asc => "ASC".into(),
            Token::Desc => "DESC".into(),
            Token::Limit => "LIMIT".into(),
            Token::In => "IN".into(),
            Token::Between => "BETWEEN".into(),
            Token::Like => "LIKE".into(),
            Token::Is => "IS".into(),
            Token::IsNull => "IS NULL".into(),
            Token::IsNotNull => "IS NOT NULL".into(),
            Token::Distinct => "DISTINCT".into(),
            Token::Union => "UNION".into(),
            Token::All => "ALL".into(),
            Token::Comma => ",".into(),
            Token::LParen => "(".into(),
            Token::RParen => ")".into(),
            Token::Eq => "=".into(),
            Token::Ne => "!=".into(),
            Token::Lt => "<".into(),
            Token::Gt => ">".into(),
            Token::Lte => "<=".into(),
            Token::Gte => ">=".into(),
            Token::Plus => "+".into(),
            Token::Minus => "-".into(),
            Token::Mul => "*".into(),
            Token::Div => "/".into(),
            Token::Space => " ".into(),
            Token::Ident(name) => dialect.quote_identifier(name),
            Token::QualifiedIdent { schema, name } => match schema {
                Some(schema) => format!(
                    "{}.{}",
                    dialect.quote_identifier(schema),
                    dialect.quote_identifier(name)
                ),
                None => dialect.quote_identifier(name),
            },
            Token::LitInt(i) => i.to_string(),
            Token::LitFloat(f) => f.to_string(),
            Token::LitString(s) => dialect.quote_string(s),
            Token::LitBool(b) => dialect.format_bool(*b).to_string(),
            Token::LitNull => "NULL".into(),
            Token::FunctionName(name) => name.clone(),
            Token::Raw(raw) => raw.clone(),
        }
    }
}

/// An append-only sequence of tokens with a fluent builder surface.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenStream {
    tokens: Vec<Token>,
}

impl TokenStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, token: Token) -> &mut Self {
        self.tokens.push(token);
        self
    }

    pub fn space(&mut self) -> &mut Self {
        self.push(Token::Space)
    }

    pub fn append(&mut self, other: &TokenStream) -> &mut Self {
        self.tokens.extend_from_slice(&other.tokens);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Render to a SQL string for the given dialect.
    pub fn to_sql(&self, dialect: Dialect) -> String {
        let mut out = String::new();
        for token in &self.tokens {
            out.push_str(&token.render(dialect));
        }
        out
    }

    /// Join a list of streams with `, `.
    pub fn comma_separated<'a>(parts: impl IntoIterator<Item = &'a TokenStream>) -> TokenStream {
        let mut ts = TokenStream::new();
        for (i, part) in parts.into_iter().enumerate() {
            if i > 0 {
                ts.push(Token::Comma).space();
            }
            ts.append(part);
        }
        ts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_select() {
        let mut ts = TokenStream::new();
        ts.push(Token::Select)
            .space()
            .push(Token::Ident("name".into()))
            .space()
            .push(Token::From)
            .space()
            .push(Token::QualifiedIdent {
                schema: Some("main".into()),
                name: "partners".into(),
            });
        assert_eq!(
            ts.to_sql(Dialect::Sqlite),
            "SELECT \"name\" FROM \"main\".\"partners\""
        );
        assert_eq!(
            ts.to_sql(Dialect::MySql),
            "SELECT `name` FROM `main`.`partners`"
        );
    }

    #[test]
    fn test_string_literal_escaping() {
        let mut ts = TokenStream::new();
        ts.push(Token::LitString("O'Neil".into()));
        assert_eq!(ts.to_sql(Dialect::Sqlite), "'O''Neil'");
    }

    #[test]
    fn test_comma_separated() {
        let mut a = TokenStream::new();
        a.push(Token::Ident("a".into()));
        let mut b = TokenStream::new();
        b.push(Token::Ident("b".into()));
        let joined = TokenStream::comma_separated([&a, &b]);
        assert_eq!(joined.to_sql(Dialect::Sqlite), "\"a\", \"b\"");
    }
}
