//! Server commands issued by the client itself
//!
//! Everything else the caller sends is an opaque `Term` built elsewhere.

use uuid::Uuid;

use crate::types::{InferenceId, Term};

/// `(server-image-id)` - fingerprint of the running server image
pub fn image_id() -> Term {
    Term::list([Term::symbol("server-image-id")])
}

/// `(acquire-api-lease <ms> "<client-id>")` - replies with the granted milliseconds
pub fn acquire_lease(duration_ms: u64, client_id: Uuid) -> Term {
    Term::list([
        Term::symbol("acquire-api-lease"),
        Term::Int(duration_ms as i64),
        Term::string(client_id.to_string()),
    ])
}

/// `(run-query '<sentence> '<context> '<properties>)` - synchronous, replies
/// with the complete inference update
pub fn run_query(sentence: &Term, context: &Term, properties: Term) -> Term {
    Term::list([
        Term::symbol("run-query"),
        sentence.clone().quoted(),
        context.clone().quoted(),
        properties.quoted(),
    ])
}

/// `(start-inference '<sentence> '<context> '<properties>)` - asynchronous,
/// streams inference updates
pub fn start_inference(sentence: &Term, context: &Term, properties: Term) -> Term {
    Term::list([
        Term::symbol("start-inference"),
        sentence.clone().quoted(),
        context.clone().quoted(),
        properties.quoted(),
    ])
}

/// `(continue-inference <store> <inference> '<budget>)`
pub fn continue_inference(id: InferenceId, budget: Term) -> Term {
    Term::list([
        Term::symbol("continue-inference"),
        Term::Int(id.problem_store),
        Term::Int(id.inference),
        budget.quoted(),
    ])
}

/// `(destroy-inference <store> <inference>)`
pub fn release_inference(id: InferenceId) -> Term {
    Term::list([
        Term::symbol("destroy-inference"),
        Term::Int(id.problem_store),
        Term::Int(id.inference),
    ])
}
