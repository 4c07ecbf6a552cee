//! Translated answers

use std::fmt;

use crate::types::{ClientError, InferenceId, Result, Term, Variable};

/// Stable identity of one answer: its inference and its index within it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AnswerId {
    pub inference: Option<InferenceId>,
    pub index: usize,
}

impl fmt::Display for AnswerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inference {
            Some(inference) => write!(f, "{}#{}", inference, self.index),
            None => write!(f, "#{}", self.index),
        }
    }
}

/// Variable bindings for one solution, in server order
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BindingSet(Vec<(Variable, Term)>);

impl BindingSet {
    /// Decode `((?X . value) (?Y value) ...)`. Both dotted and two-element
    /// pairs are accepted. `NIL` is the empty set of a proven boolean query.
    pub fn from_raw(raw: &Term) -> Result<Self> {
        let pairs = raw
            .as_list()
            .ok_or_else(|| ClientError::Protocol(format!("answer is not a binding list: {raw}")))?;

        pairs
            .iter()
            .map(|pair| match pair {
                Term::Dotted(head, value) => match head.as_slice() {
                    [Term::Variable(var)] => Ok((var.clone(), (**value).clone())),
                    _ => Err(bad_binding(pair)),
                },
                Term::List(items) => match items.as_slice() {
                    [Term::Variable(var), value] => Ok((var.clone(), value.clone())),
                    _ => Err(bad_binding(pair)),
                },
                _ => Err(bad_binding(pair)),
            })
            .collect::<Result<Vec<_>>>()
            .map(Self)
    }

    pub fn get(&self, variable: &Variable) -> Option<&Term> {
        self.0.iter().find(|(v, _)| v == variable).map(|(_, t)| t)
    }

    /// Look up by name, with or without the leading `?`
    pub fn get_by_name(&self, name: &str) -> Option<&Term> {
        self.get(&Variable::new(name))
    }

    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.0.iter().map(|(v, _)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Variable, &Term)> {
        self.0.iter().map(|(v, t)| (v, t))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn bad_binding(pair: &Term) -> ClientError {
    ClientError::Protocol(format!("malformed binding: {pair}"))
}

/// One solution of a query. Never changes once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceAnswer {
    id: AnswerId,
    bindings: BindingSet,
}

impl InferenceAnswer {
    pub(crate) fn new(id: AnswerId, bindings: BindingSet) -> Self {
        Self { id, bindings }
    }

    pub fn id(&self) -> AnswerId {
        self.id
    }

    pub fn index(&self) -> usize {
        self.id.index
    }

    pub fn bindings(&self) -> &BindingSet {
        &self.bindings
    }

    pub fn binding(&self, variable: &Variable) -> Option<&Term> {
        self.bindings.get(variable)
    }

    pub fn binding_by_name(&self, name: &str) -> Option<&Term> {
        self.bindings.get_by_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_pair_shapes_decode() {
        let raw = Term::list([
            Term::Dotted(vec![Term::var("X")], Box::new(Term::symbol("Emu-1"))),
            Term::list([Term::var("Y"), Term::Int(3)]),
        ]);
        let bindings = BindingSet::from_raw(&raw).unwrap();

        assert_eq!(bindings.get_by_name("?X"), Some(&Term::symbol("Emu-1")));
        assert_eq!(bindings.get_by_name("Y"), Some(&Term::Int(3)));
        assert_eq!(bindings.get_by_name("Z"), None);
        assert_eq!(bindings.len(), 2);
    }

    #[test]
    fn test_nil_is_an_empty_binding_set() {
        assert!(BindingSet::from_raw(&Term::Nil).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_bindings_are_protocol_errors() {
        let raw = Term::list([Term::list([Term::symbol("X"), Term::Int(1)])]);
        assert!(matches!(
            BindingSet::from_raw(&raw),
            Err(ClientError::Protocol(_))
        ));
    }

    #[test]
    fn test_answer_id_display() {
        let id = AnswerId {
            inference: Some(InferenceId::new(2, 9)),
            index: 4,
        };
        assert_eq!(id.to_string(), "2/9#4");
    }
}
