//! Query parameters
//!
//! Parameters are frozen once a query has started. The execution strategy
//! (one synchronous round trip vs. a streaming worker) is derived from them
//! in [`QueryProperties::requires_worker`] and nowhere else.

use std::time::Duration;

use crate::types::Term;
use crate::worker::Priority;

/// How hard the server may work to find answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InferenceMode {
    Minimal,
    #[default]
    Shallow,
    Extended,
    Maximal,
}

impl InferenceMode {
    fn keyword(self) -> &'static str {
        match self {
            Self::Minimal => "minimal",
            Self::Shallow => "shallow",
            Self::Extended => "extended",
            Self::Maximal => "maximal",
        }
    }
}

/// Server-side ordering of answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultSortOrder {
    Ascending,
    Descending,
}

impl ResultSortOrder {
    fn keyword(self) -> &'static str {
        match self {
            Self::Ascending => "ascending",
            Self::Descending => "descending",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryProperties {
    /// Suspend after this many answers
    pub max_answer_count: Option<u32>,
    /// Suspend after this much server time (sent in whole seconds, rounded up)
    pub max_time: Option<Duration>,
    pub max_steps: Option<u64>,
    pub inference_mode: InferenceMode,
    /// Keep the server inference alive on suspension so it can be continued
    pub continuable: bool,
    pub browsable: bool,
    pub result_sort_order: Option<ResultSortOrder>,
    pub compute_justifications: bool,
    /// Local deadline for each run on the worker path
    pub timeout: Option<Duration>,
    pub priority: Priority,
}

impl QueryProperties {
    /// Whether a run needs the streaming worker path. Every option that only
    /// the worker path can honour must be listed here.
    pub fn requires_worker(&self) -> bool {
        self.continuable
            || self.browsable
            || self.compute_justifications
            || self.result_sort_order.is_some()
    }

    pub fn with_max_answers(mut self, count: u32) -> Self {
        self.max_answer_count = Some(count);
        self
    }

    pub fn with_max_time(mut self, limit: Duration) -> Self {
        self.max_time = Some(limit);
        self
    }

    pub fn with_max_steps(mut self, steps: u64) -> Self {
        self.max_steps = Some(steps);
        self
    }

    pub fn with_inference_mode(mut self, mode: InferenceMode) -> Self {
        self.inference_mode = mode;
        self
    }

    pub fn continuable(mut self, continuable: bool) -> Self {
        self.continuable = continuable;
        self
    }

    pub fn browsable(mut self, browsable: bool) -> Self {
        self.browsable = browsable;
        self
    }

    pub fn with_sort_order(mut self, order: ResultSortOrder) -> Self {
        self.result_sort_order = Some(order);
        self
    }

    pub fn compute_justifications(mut self, compute: bool) -> Self {
        self.compute_justifications = compute;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Take the budget ceilings from `budget`, leaving everything else
    pub fn apply_budget(&mut self, budget: &QueryProperties) {
        self.max_answer_count = budget.max_answer_count;
        self.max_time = budget.max_time;
        self.max_steps = budget.max_steps;
    }

    /// Full property list for starting a query
    pub fn to_term(&self) -> Term {
        let mut plist = self.budget_items();
        plist.push(Term::keyword("inference-mode"));
        plist.push(Term::keyword(self.inference_mode.keyword()));

        let flags = [
            ("continuable?", self.continuable),
            ("browsable?", self.browsable),
            ("compute-answer-justifications?", self.compute_justifications),
        ];
        for (key, on) in flags {
            if on {
                plist.push(Term::keyword(key));
                plist.push(Term::Bool(true));
            }
        }
        if let Some(order) = self.result_sort_order {
            plist.push(Term::keyword("result-sort-order"));
            plist.push(Term::keyword(order.keyword()));
        }
        Term::List(plist)
    }

    /// Only the resource ceilings, for continuing a suspended inference
    pub fn budget_term(&self) -> Term {
        Term::List(self.budget_items())
    }

    fn budget_items(&self) -> Vec<Term> {
        let mut items = Vec::new();
        if let Some(n) = self.max_answer_count {
            items.push(Term::keyword("max-number"));
            items.push(Term::Int(i64::from(n)));
        }
        if let Some(limit) = self.max_time {
            let secs = limit.as_secs() + u64::from(limit.subsec_nanos() > 0);
            items.push(Term::keyword("max-time"));
            items.push(Term::Int(secs as i64));
        }
        if let Some(steps) = self.max_steps {
            items.push(Term::keyword("max-step"));
            items.push(Term::Int(steps as i64));
        }
        items
    }
}
