//! Identifiers shared across the client

use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::{ClientError, Result};
use super::term::Term;

/// Which server a client is bound to. Immutable for the life of a client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub host: String,
    pub base_port: u16,
}

impl SessionIdentity {
    pub fn new(host: impl Into<String>, base_port: u16) -> Self {
        Self {
            host: host.into(),
            base_port,
        }
    }

    /// WebSocket URL of the server's API endpoint
    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.base_port)
    }
}

impl fmt::Display for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.base_port)
    }
}

/// Identifies the server process/image state a session landed on
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageFingerprint(String);

impl ImageFingerprint {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Read the fingerprint out of an image-id reply
    pub fn from_term(term: &Term) -> Result<Self> {
        match term {
            Term::Str(s) | Term::Symbol(s) if !s.is_empty() => Ok(Self(s.clone())),
            Term::Int(n) => Ok(Self(n.to_string())),
            other => Err(ClientError::Protocol(format!(
                "unexpected image id reply: {other}"
            ))),
        }
    }
}

impl fmt::Display for ImageFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client-assigned correlation id for one submitted worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Server-assigned task identity, known once the worker has started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub i64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Server-side inference context: (problem store, inference) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InferenceId {
    pub problem_store: i64,
    pub inference: i64,
}

impl InferenceId {
    pub fn new(problem_store: i64, inference: i64) -> Self {
        Self {
            problem_store,
            inference,
        }
    }

    /// Decode `(<store> <inference>)`
    pub fn from_term(term: &Term) -> Result<Self> {
        match term.as_list() {
            Some([store, inference]) => match (store.as_int(), inference.as_int()) {
                (Some(s), Some(i)) => Ok(Self::new(s, i)),
                _ => Err(ClientError::Protocol(format!("bad inference id: {term}"))),
            },
            _ => Err(ClientError::Protocol(format!("bad inference id: {term}"))),
        }
    }

    pub fn to_term(self) -> Term {
        Term::list([Term::Int(self.problem_store), Term::Int(self.inference)])
    }
}

impl fmt::Display for InferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.problem_store, self.inference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inference_id_round_trips_through_term() {
        let id = InferenceId::new(7, 3);
        assert_eq!(InferenceId::from_term(&id.to_term()).unwrap(), id);
        assert!(InferenceId::from_term(&Term::Int(7)).is_err());
    }

    #[test]
    fn test_fingerprint_rejects_nil() {
        assert!(ImageFingerprint::from_term(&Term::Nil).is_err());
        assert_eq!(
            ImageFingerprint::from_term(&Term::string("img-42")).unwrap().as_str(),
            "img-42"
        );
    }

    #[test]
    fn test_session_identity_url() {
        let identity = SessionIdentity::new("reasoner.local", 3600);
        assert_eq!(identity.url(), "ws://reasoner.local:3600");
        assert_eq!(identity.to_string(), "reasoner.local:3600");
    }
}
