//! Formula reference parsing and expansion.
//!
//! A formula is a SQL-like expression whose field references are written
//! `{name}`. The body is emitted verbatim into the SQL of the combined
//! layer; only the reference tokens are interpreted. Expansion replaces
//! formula-field references with their own bodies until only non-formula
//! leaves remain, bounded by [`MAX_FORMULA_DEPTH`].

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, Result};
use crate::model::field::Field;

/// Chained formula metrics are allowed up to this expansion depth.
pub const MAX_FORMULA_DEPTH: usize = 8;

static FORMULA_REF: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{(\w+)\}").unwrap());

// Statement-level keywords that may not appear in a formula or
// ds_formula body.
static DISALLOWED_SQL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(;|\b(insert|update|delete|drop|create|alter|truncate|grant|revoke|attach|detach)\b)")
        .unwrap()
});

/// Resolve a field name within some scope stack.
///
/// The warehouse implements this across its global registry, each
/// datasource's overlay and the report's ad-hoc fields.
pub trait FieldResolver {
    fn resolve_field(&self, name: &str) -> Option<&Field>;
}

/// Extract the reference names from a formula body, in order of first
/// appearance.
pub fn parse_refs(formula: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for cap in FORMULA_REF.captures_iter(formula) {
        let name = cap[1].to_string();
        if seen.insert(name.clone()) {
            out.push(name);
        }
    }
    out
}

/// Reject formulas containing statement-level SQL.
pub fn check_allowed_sql(formula: &str) -> Result<()> {
    if DISALLOWED_SQL.is_match(formula) {
        return Err(Error::DisallowedSql(formula.to_string()));
    }
    Ok(())
}

/// Replace each `{name}` reference via `subst`.
pub fn substitute(formula: &str, mut subst: impl FnMut(&str) -> String) -> String {
    FORMULA_REF
        .replace_all(formula, |caps: &regex::Captures<'_>| subst(&caps[1]))
        .to_string()
}

/// The fully-expanded body and non-formula leaf set of a formula field.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpandedFormula {
    /// Formula body with only leaf references left as `{name}` tokens.
    pub body: String,
    /// Non-formula fields the formula transitively depends on.
    pub leaves: BTreeSet<String>,
}

/// Expand a formula to its leaves, resolving references through
/// `resolver`. Fails on unknown references, on expansion deeper than
/// [`MAX_FORMULA_DEPTH`] and (transitively) on cycles, which exhaust the
/// depth bound.
pub fn expand_formula(
    owner: &str,
    formula: &str,
    resolver: &dyn FieldResolver,
) -> Result<ExpandedFormula> {
    let mut leaves = BTreeSet::new();
    let body = expand_inner(owner, formula, resolver, 0, &mut leaves)?;
    Ok(ExpandedFormula { body, leaves })
}

fn expand_inner(
    owner: &str,
    formula: &str,
    resolver: &dyn FieldResolver,
    depth: usize,
    leaves: &mut BTreeSet<String>,
) -> Result<String> {
    if depth > MAX_FORMULA_DEPTH {
        return Err(Error::MaxFormulaDepth(owner.to_string()));
    }

    let mut failed: Option<Error> = None;
    let expanded = substitute(formula, |name| {
        if failed.is_some() {
            return String::new();
        }
        match resolver.resolve_field(name) {
            None => {
                failed = Some(Error::field_config(
                    owner,
                    format!("formula references unknown field '{}'", name),
                ));
                String::new()
            }
            Some(field) => match field.formula() {
                Some(sub) => {
                    match expand_inner(owner, sub, resolver, depth + 1, leaves) {
                        Ok(body) => format!("({})", body),
                        Err(e) => {
                            failed = Some(e);
                            String::new()
                        }
                    }
                }
                None => {
                    leaves.insert(name.to_string());
                    format!("{{{}}}", name)
                }
            },
        }
    });

    match failed {
        Some(e) => Err(e),
        None => Ok(expanded),
    }
}

/// Detect reference cycles among a set of formula fields. Returns the
/// first cycle found as a name path.
pub fn check_cycles<'a>(
    fields: impl Iterator<Item = &'a Field>,
    resolver: &dyn FieldResolver,
) -> Result<()> {
    for field in fields {
        if let Some(formula) = field.formula() {
            let mut path = vec![field.name().to_string()];
            walk(field.name(), formula, resolver, &mut path)?;
        }
    }
    Ok(())
}

fn walk(
    root: &str,
    formula: &str,
    resolver: &dyn FieldResolver,
    path: &mut Vec<String>,
) -> Result<()> {
    for name in parse_refs(formula) {
        if name == root || path.contains(&name) {
            path.push(name);
            return Err(Error::CyclicDependency(std::mem::take(path)));
        }
        if let Some(sub) = resolver.resolve_field(&name).and_then(|f| f.formula()) {
            path.push(name.clone());
            walk(root, sub, resolver, path)?;
            path.pop();
        }
    }
    Ok(())
}
