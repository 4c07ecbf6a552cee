//! Cursor over a query's answers
//!
//! The cursor reads the query's shared, append-only answer list, so any
//! number of cursors over one query agree on every row they have seen.
//! Moving past the last known row drives the query forward (starting or
//! continuing it) unless it is done or suspended at a resource ceiling.

use std::sync::Arc;

use super::{InferenceAnswer, Query};
use crate::types::{ClientError, Result, Term, Variable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    BeforeFirst,
    Row(usize),
    AfterLast,
}

#[derive(Debug)]
pub struct ResultSet {
    query: Query,
    position: Position,
}

impl ResultSet {
    pub(crate) fn new(query: Query) -> Self {
        Self {
            query,
            position: Position::BeforeFirst,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Advance one row. Waits for or requests more answers at the frontier.
    pub async fn next(&mut self) -> Result<bool> {
        let target = match self.position {
            Position::BeforeFirst => 0,
            Position::Row(row) => row.saturating_add(1),
            Position::AfterLast => return Ok(false),
        };
        self.absolute(target).await
    }

    /// Step back one row; never touches the server
    pub fn previous(&mut self) -> bool {
        match self.position {
            Position::BeforeFirst | Position::Row(0) => {
                self.position = Position::BeforeFirst;
                false
            }
            Position::Row(row) => {
                self.position = Position::Row(row - 1);
                true
            }
            Position::AfterLast => match self.len() {
                0 => {
                    self.position = Position::BeforeFirst;
                    false
                }
                n => {
                    self.position = Position::Row(n - 1);
                    true
                }
            },
        }
    }

    /// Jump to a zero-based row, producing answers up to it if needed
    pub async fn absolute(&mut self, row: usize) -> Result<bool> {
        let Some(wanted) = row.checked_add(1) else {
            self.position = Position::AfterLast;
            return Ok(false);
        };
        if self.query.ensure_answers(wanted).await? {
            self.position = Position::Row(row);
            Ok(true)
        } else {
            self.position = Position::AfterLast;
            Ok(false)
        }
    }

    pub fn before_first(&mut self) {
        self.position = Position::BeforeFirst;
    }

    pub fn is_after_last(&self) -> bool {
        self.position == Position::AfterLast
    }

    /// Zero-based current row
    pub fn row(&self) -> Option<usize> {
        match self.position {
            Position::Row(row) => Some(row),
            _ => None,
        }
    }

    pub fn current(&self) -> Option<Arc<InferenceAnswer>> {
        self.row().and_then(|row| self.query.answer_at(row))
    }

    /// Value bound to `variable` in the current row; `Ok(None)` if unbound
    pub fn binding(&self, variable: &Variable) -> Result<Option<Term>> {
        Ok(self.require_row()?.binding(variable).cloned())
    }

    pub fn binding_by_name(&self, name: &str) -> Result<Option<Term>> {
        Ok(self.require_row()?.binding_by_name(name).cloned())
    }

    /// Truth value of a variable-free query
    pub async fn truth_value(&self) -> Result<bool> {
        self.query.is_true().await
    }

    /// Rows known so far
    pub fn len(&self) -> usize {
        self.query.answers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn require_row(&self) -> Result<Arc<InferenceAnswer>> {
        self.current()
            .ok_or_else(|| ClientError::InvalidState("cursor is not on a row".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionManager;
    use crate::inference::{InferenceStatus, QueryProperties};
    use crate::transport::fixture::FixtureServer;
    use crate::transport::{ServerEvent, TerminationStatus};
    use crate::types::{RequestId, WorkerId};

    fn binding(value: &str) -> Term {
        Term::list([Term::Dotted(
            vec![Term::var("X")],
            Box::new(Term::symbol(value)),
        )])
    }

    fn finished(
        id: RequestId,
        status: &str,
        reason: Option<&str>,
        answers: Vec<Term>,
    ) -> Vec<ServerEvent> {
        let mut plist = vec![
            Term::keyword("inference-id"),
            Term::list([Term::Int(2), Term::Int(8)]),
            Term::keyword("status"),
            Term::keyword(status),
            Term::keyword("answers"),
            Term::List(answers),
        ];
        if let Some(reason) = reason {
            plist.push(Term::keyword("suspend-reason"));
            plist.push(Term::keyword(reason));
        }
        vec![
            ServerEvent::Started {
                request_id: id,
                worker_id: WorkerId(5),
            },
            ServerEvent::Terminated {
                request_id: id,
                status: TerminationStatus::Completed,
                payload: Some(Term::List(plist)),
                error: None,
            },
        ]
    }

    fn is_start(command: &Term) -> bool {
        command.to_string().starts_with("(start-inference")
    }

    fn bird_query(connection: Arc<ConnectionManager>) -> Query {
        Query::new(
            connection,
            Term::list([Term::symbol("isa"), Term::var("X"), Term::symbol("Bird")]),
            Term::symbol("BiologyMt"),
            QueryProperties::default().continuable(true),
        )
    }

    #[tokio::test]
    async fn test_cursor_continues_at_the_frontier() {
        let server = FixtureServer::new();
        server.on_submit(|id, command| {
            if is_start(command) {
                finished(id, "suspended", Some("exhaust"), vec![binding("Emu-1"), binding("Kiwi-1")])
            } else {
                finished(id, "done", None, vec![binding("Moa-1")])
            }
        });
        let connection = server.connect().await;
        let query = bird_query(connection);
        let mut rows = query.result_set();

        let mut seen = Vec::new();
        while rows.next().await.unwrap() {
            seen.push(rows.binding_by_name("X").unwrap().unwrap().to_string());
        }

        assert_eq!(seen, ["Emu-1", "Kiwi-1", "Moa-1"]);
        assert_eq!(server.count("continue-inference"), 1);
        assert_eq!(query.status(), InferenceStatus::Done);
        assert!(rows.is_after_last());
        query.close().await;
    }

    #[tokio::test]
    async fn test_cursor_stops_at_a_ceiling() {
        let server = FixtureServer::new();
        server.on_submit(|id, _| {
            finished(id, "suspended", Some("max-number"), vec![binding("Emu-1"), binding("Kiwi-1")])
        });
        let connection = server.connect().await;
        let query = bird_query(connection);
        let mut rows = query.result_set();

        assert!(rows.next().await.unwrap());
        assert!(rows.next().await.unwrap());
        assert!(!rows.next().await.unwrap());
        assert_eq!(server.count("continue-inference"), 0);
        assert_eq!(query.status(), InferenceStatus::Suspended);

        // Walking back does not talk to the server
        assert!(rows.previous());
        assert_eq!(rows.row(), Some(1));
        assert_eq!(
            rows.current().unwrap().binding_by_name("X"),
            Some(&Term::symbol("Kiwi-1"))
        );
        query.close().await;
    }

    #[tokio::test]
    async fn test_two_cursors_agree() {
        let server = FixtureServer::new();
        server.on_submit(|id, _| finished(id, "done", None, vec![binding("Emu-1"), binding("Kiwi-1")]));
        let connection = server.connect().await;
        let query = bird_query(connection);

        let mut a = query.result_set();
        let mut b = query.result_set();
        assert!(a.absolute(1).await.unwrap());
        assert!(b.next().await.unwrap());
        assert!(b.next().await.unwrap());

        assert!(Arc::ptr_eq(&a.current().unwrap(), &b.current().unwrap()));
        assert_eq!(server.count("start-inference"), 1);
        assert!(a.binding(&Variable::new("Y")).unwrap().is_none());

        a.before_first();
        assert!(a.binding_by_name("X").unwrap_err().is_programming_error());
        query.close().await;
    }

    #[tokio::test]
    async fn test_out_of_range_row_lands_after_last() {
        let server = FixtureServer::new();
        let connection = server.connect().await;
        let query = bird_query(connection);
        let mut rows = query.result_set();

        assert!(!rows.absolute(usize::MAX).await.unwrap());
        assert!(rows.is_after_last());
        assert_eq!(query.status(), InferenceStatus::NotStarted);
        assert_eq!(server.count("start-inference"), 0);
    }
}
