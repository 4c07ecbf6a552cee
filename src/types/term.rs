//! Opaque term values carried as command and result payloads
//!
//! The client never interprets the server's expression language. `Term` is a
//! comparable, serializable stand-in for it with just enough structure to
//! build commands and to read the few reply shapes the client must decode
//! (property lists, binding pairs).

use serde::{Deserialize, Serialize};
use std::fmt;

/// A query variable such as `?X`. Stored without the leading `?`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Variable(String);

impl Variable {
    pub fn new(name: impl AsRef<str>) -> Self {
        let name = name.as_ref();
        Self(name.strip_prefix('?').unwrap_or(name).to_string())
    }

    /// Name without the `?` prefix
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "?{}", self.0)
    }
}

impl From<&str> for Variable {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Lisp-like term value
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum Term {
    Nil,
    Bool(bool),
    Int(i64),
    Str(String),
    /// Symbols and constants. Keywords are symbols starting with `:`.
    Symbol(String),
    Variable(Variable),
    List(Vec<Term>),
    /// Improper list: `(a b . tail)`
    Dotted(Vec<Term>, Box<Term>),
}

impl Term {
    pub fn symbol(name: impl Into<String>) -> Self {
        Self::Symbol(name.into())
    }

    pub fn keyword(name: &str) -> Self {
        Self::Symbol(format!(":{}", name.trim_start_matches(':')))
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self::Str(value.into())
    }

    pub fn var(name: &str) -> Self {
        Self::Variable(Variable::new(name))
    }

    pub fn list(items: impl IntoIterator<Item = Term>) -> Self {
        Self::List(items.into_iter().collect())
    }

    /// `(quote <term>)`
    pub fn quoted(self) -> Self {
        Self::List(vec![Self::symbol("quote"), self])
    }

    pub fn is_nil(&self) -> bool {
        match self {
            Self::Nil => true,
            Self::List(items) => items.is_empty(),
            _ => false,
        }
    }

    /// Elements of a proper list. `Nil` is the empty list.
    pub fn as_list(&self) -> Option<&[Term]> {
        match self {
            Self::Nil => Some(&[]),
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Self::Symbol(name) => Some(name),
            _ => None,
        }
    }

    /// Keyword name without the leading `:`
    pub fn as_keyword(&self) -> Option<&str> {
        self.as_symbol().and_then(|s| s.strip_prefix(':'))
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_variable(&self) -> Option<&Variable> {
        match self {
            Self::Variable(v) => Some(v),
            _ => None,
        }
    }

    /// Truthiness in the server's sense: everything but `NIL` and false.
    pub fn is_true(&self) -> bool {
        !matches!(self, Self::Bool(false)) && !self.is_nil()
    }

    /// Look up `key` in a property list `(:k1 v1 :k2 v2 ...)`
    pub fn plist_get(&self, key: &str) -> Option<&Term> {
        let items = self.as_list()?;
        items
            .chunks(2)
            .find(|pair| pair.len() == 2 && pair[0].as_keyword() == Some(key))
            .map(|pair| &pair[1])
    }

    /// Distinct variables in first-occurrence order
    pub fn variables(&self) -> Vec<Variable> {
        let mut found = Vec::new();
        self.collect_variables(&mut found);
        found
    }

    fn collect_variables(&self, found: &mut Vec<Variable>) {
        match self {
            Self::Variable(v) => {
                if !found.contains(v) {
                    found.push(v.clone());
                }
            }
            Self::List(items) => items.iter().for_each(|t| t.collect_variables(found)),
            Self::Dotted(items, tail) => {
                items.iter().for_each(|t| t.collect_variables(found));
                tail.collect_variables(found);
            }
            _ => {}
        }
    }
}

impl From<i64> for Term {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<bool> for Term {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Variable> for Term {
    fn from(v: Variable) -> Self {
        Self::Variable(v)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => write!(f, "NIL"),
            Self::Bool(true) => write!(f, "T"),
            Self::Bool(false) => write!(f, "NIL"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Str(s) => write!(f, "\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
            Self::Symbol(s) => write!(f, "{s}"),
            Self::Variable(v) => write!(f, "{v}"),
            Self::List(items) => {
                write!(f, "(")?;
                write_spaced(f, items)?;
                write!(f, ")")
            }
            Self::Dotted(items, tail) => {
                write!(f, "(")?;
                write_spaced(f, items)?;
                write!(f, " . {tail})")
            }
        }
    }
}

fn write_spaced(f: &mut fmt::Formatter<'_>, items: &[Term]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, " ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn isa_emu() -> Term {
        Term::list([Term::symbol("isa"), Term::var("?X"), Term::symbol("Emu")])
    }

    #[test]
    fn test_display_matches_lisp_syntax() {
        assert_eq!(isa_emu().to_string(), "(isa ?X Emu)");

        let dotted = Term::Dotted(vec![Term::var("X")], Box::new(Term::symbol("Emu-1")));
        assert_eq!(dotted.to_string(), "(?X . Emu-1)");

        assert_eq!(Term::string("say \"hi\"").to_string(), "\"say \\\"hi\\\"\"");
    }

    #[test]
    fn test_variables_are_distinct_and_ordered() {
        let sentence = Term::list([
            Term::symbol("and"),
            Term::list([Term::symbol("isa"), Term::var("?X"), Term::var("?Y")]),
            Term::list([Term::symbol("genls"), Term::var("?Y"), Term::var("?X")]),
        ]);
        assert_eq!(sentence.variables(), vec![Variable::new("X"), Variable::new("?Y")]);

        let closed = Term::list([Term::symbol("isa"), Term::symbol("Emu-1"), Term::symbol("Emu")]);
        assert!(closed.variables().is_empty());
    }

    #[test]
    fn test_plist_lookup() {
        let plist = Term::list([
            Term::keyword("status"),
            Term::keyword("suspended"),
            Term::keyword("answer-start"),
            Term::Int(3),
        ]);
        assert_eq!(plist.plist_get("status").and_then(Term::as_keyword), Some("suspended"));
        assert_eq!(plist.plist_get("answer-start").and_then(Term::as_int), Some(3));
        assert!(plist.plist_get("missing").is_none());
        assert!(Term::Nil.plist_get("status").is_none());
    }

    #[test]
    fn test_nil_and_empty_list_are_both_nil() {
        assert!(Term::Nil.is_nil());
        assert!(Term::List(vec![]).is_nil());
        assert!(!Term::Nil.is_true());
        assert!(Term::Bool(true).is_true());
        assert!(Term::symbol("Emu").is_true());
    }
}
