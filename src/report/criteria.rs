//! Report criteria: `(field, operator, value)` triples.
//!
//! Criteria filter at the datasource layer, so their fields join the
//! report grain. The subreport operators (`in report` / `not in
//! report`) are resolved at report construction into plain `in` /
//! `not in` lists.

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::sql::{lit_bool, lit_float, lit_int, lit_null, lit_str, Expr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriteriaOperator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Between,
    NotBetween,
    Like,
    NotLike,
    IsNull,
    IsNotNull,
    InReport,
    NotInReport,
}

impl CriteriaOperator {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "=" | "==" => Some(CriteriaOperator::Eq),
            "!=" => Some(CriteriaOperator::Ne),
            ">" => Some(CriteriaOperator::Gt),
            ">=" => Some(CriteriaOperator::Gte),
            "<" => Some(CriteriaOperator::Lt),
            "<=" => Some(CriteriaOperator::Lte),
            "in" => Some(CriteriaOperator::In),
            "not in" => Some(CriteriaOperator::NotIn),
            "between" => Some(CriteriaOperator::Between),
            "not between" => Some(CriteriaOperator::NotBetween),
            "like" => Some(CriteriaOperator::Like),
            "not like" => Some(CriteriaOperator::NotLike),
            "is null" => Some(CriteriaOperator::IsNull),
            "is not null" => Some(CriteriaOperator::IsNotNull),
            "in report" => Some(CriteriaOperator::InReport),
            "not in report" => Some(CriteriaOperator::NotInReport),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CriteriaOperator::Eq => "=",
            CriteriaOperator::Ne => "!=",
            CriteriaOperator::Gt => ">",
            CriteriaOperator::Gte => ">=",
            CriteriaOperator::Lt => "<",
            CriteriaOperator::Lte => "<=",
            CriteriaOperator::In => "in",
            CriteriaOperator::NotIn => "not in",
            CriteriaOperator::Between => "between",
            CriteriaOperator::NotBetween => "not between",
            CriteriaOperator::Like => "like",
            CriteriaOperator::NotLike => "not like",
            CriteriaOperator::IsNull => "is null",
            CriteriaOperator::IsNotNull => "is not null",
            CriteriaOperator::InReport => "in report",
            CriteriaOperator::NotInReport => "not in report",
        }
    }

    pub fn is_subreport(&self) -> bool {
        matches!(
            self,
            CriteriaOperator::InReport | CriteriaOperator::NotInReport
        )
    }
}

/// One criterion. Serialized as the `[field, op, value]` triple form
/// used in report params.
#[derive(Debug, Clone, PartialEq)]
pub struct Criterion {
    pub field: String,
    pub op: CriteriaOperator,
    pub value: serde_json::Value,
}

impl Criterion {
    pub fn new(field: impl Into<String>, op: &str, value: serde_json::Value) -> Result<Self> {
        let op = CriteriaOperator::parse(op)
            .ok_or_else(|| Error::UnsupportedOperation(format!("criteria operator '{}'", op)))?;
        Ok(Self {
            field: field.into(),
            op,
            value,
        })
    }

    /// Build the WHERE predicate for this criterion against a left-hand
    /// column expression.
    pub fn to_predicate(&self, lhs: Expr) -> Result<Expr> {
        use crate::sql::ExprExt;
        let value = &self.value;
        let scalar = || json_scalar(value);
        let pair = || -> Result<(Expr, Expr)> {
            let items = value.as_array().ok_or_else(|| {
                Error::UnsupportedOperation(format!(
                    "'{}' requires a two-element list value",
                    self.op.as_str()
                ))
            })?;
            if items.len() != 2 {
                return Err(Error::UnsupportedOperation(format!(
                    "'{}' requires exactly two values",
                    self.op.as_str()
                )));
            }
            Ok((json_scalar(&items[0])?, json_scalar(&items[1])?))
        };
        let list = || -> Result<Vec<Expr>> {
            value
                .as_array()
                .ok_or_else(|| {
                    Error::UnsupportedOperation(format!(
                        "'{}' requires a list value",
                        self.op.as_str()
                    ))
                })?
                .iter()
                .map(json_scalar)
                .collect()
        };

        Ok(match self.op {
            CriteriaOperator::Eq => lhs.eq(scalar()?),
            CriteriaOperator::Ne => lhs.ne(scalar()?),
            CriteriaOperator::Gt => lhs.gt(scalar()?),
            CriteriaOperator::Gte => lhs.gte(scalar()?),
            CriteriaOperator::Lt => lhs.lt(scalar()?),
            CriteriaOperator::Lte => lhs.lte(scalar()?),
            CriteriaOperator::In => lhs.in_list(list()?),
            CriteriaOperator::NotIn => lhs.not_in_list(list()?),
            CriteriaOperator::Between => {
                let (low, high) = pair()?;
                lhs.between(low, high)
            }
            CriteriaOperator::NotBetween => {
                let (low, high) = pair()?;
                lhs.not_between(low, high)
            }
            CriteriaOperator::Like => lhs.like(scalar()?),
            CriteriaOperator::NotLike => lhs.not_like(scalar()?),
            CriteriaOperator::IsNull => lhs.is_null(),
            CriteriaOperator::IsNotNull => lhs.is_not_null(),
            CriteriaOperator::InReport | CriteriaOperator::NotInReport => {
                return Err(Error::UnsupportedOperation(
                    "subreport criteria must be resolved before compilation".into(),
                ));
            }
        })
    }

    /// Render the criterion value as SQL literal text for
    /// `ds_criteria_conversions` templates.
    pub fn value_sql_text(&self) -> String {
        match &self.value {
            serde_json::Value::String(s) => format!("'{}'", s.replace('\'', "''")),
            other => other.to_string(),
        }
    }
}

/// Convert a JSON scalar to a SQL literal expression.
pub fn json_scalar(value: &serde_json::Value) -> Result<Expr> {
    match value {
        serde_json::Value::Null => Ok(lit_null()),
        serde_json::Value::Bool(b) => Ok(lit_bool(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(lit_int(i))
            } else {
                Ok(lit_float(n.as_f64().unwrap_or(f64::NAN)))
            }
        }
        serde_json::Value::String(s) => Ok(lit_str(s)),
        _ => Err(Error::UnsupportedOperation(
            "criteria values must be scalars or lists of scalars".into(),
        )),
    }
}

impl Serialize for Criterion {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        (
            &self.field,
            self.op.as_str(),
            &self.value,
        )
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Criterion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let (field, op, value): (String, String, serde_json::Value) =
            Deserialize::deserialize(deserializer)?;
        let op = CriteriaOperator::parse(&op)
            .ok_or_else(|| D::Error::custom(format!("unknown criteria operator '{}'", op)))?;
        Ok(Criterion { field, op, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sql::{col, Dialect};
    use serde_json::json;

    #[test]
    fn test_operator_round_trip() {
        for op in [
            "=", "!=", ">", ">=", "<", "<=", "in", "not in", "between", "not between", "like",
            "not like", "is null", "is not null", "in report", "not in report",
        ] {
            let parsed = CriteriaOperator::parse(op).unwrap();
            assert_eq!(parsed.as_str(), op);
        }
        assert!(CriteriaOperator::parse("~=").is_none());
    }

    #[test]
    fn test_predicates() {
        let c = Criterion::new("partner_name", "=", json!("Partner A")).unwrap();
        assert_eq!(
            c.to_predicate(col("name")).unwrap().to_sql(Dialect::Sqlite),
            "\"name\" = 'Partner A'"
        );

        let c = Criterion::new("revenue", "between", json!([10, 20])).unwrap();
        assert_eq!(
            c.to_predicate(col("revenue")).unwrap().to_sql(Dialect::Sqlite),
            "\"revenue\" BETWEEN 10 AND 20"
        );

        let c = Criterion::new("partner_name", "not in", json!(["A", "B"])).unwrap();
        assert_eq!(
            c.to_predicate(col("name")).unwrap().to_sql(Dialect::Sqlite),
            "\"name\" NOT IN ('A', 'B')"
        );
    }

    #[test]
    fn test_bad_shapes_rejected() {
        let c = Criterion::new("x", "between", json!([1])).unwrap();
        assert!(c.to_predicate(col("x")).is_err());
        let c = Criterion::new("x", "in", json!(5)).unwrap();
        assert!(c.to_predicate(col("x")).is_err());
    }

    #[test]
    fn test_serde_triple_form() {
        let c: Criterion = serde_json::from_str(r#"["partner_name", "=", "Partner A"]"#).unwrap();
        assert_eq!(c.field, "partner_name");
        assert_eq!(c.op, CriteriaOperator::Eq);
        let text = serde_json::to_string(&c).unwrap();
        assert_eq!(text, r#"["partner_name","=","Partner A"]"#);
    }

    #[test]
    fn test_value_sql_text_escapes() {
        let c = Criterion::new("n", "=", json!("O'Neil")).unwrap();
        assert_eq!(c.value_sql_text(), "'O''Neil'");
    }
}
