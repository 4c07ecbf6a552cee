use std::fmt;

use crate::types::{ClientError, Result, Term};

/// Inference lifecycle: `NotStarted → Working → Suspended ⇄ Working → Done`,
/// with `Error` reachable from any non-terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum InferenceStatus {
    #[default]
    NotStarted,
    Working,
    Suspended,
    Done,
    Error,
}

impl InferenceStatus {
    /// Decode a server status keyword (without the colon)
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "not-started" | "new" | "prepared" | "ready" => Some(Self::NotStarted),
            "working" | "running" => Some(Self::Working),
            "suspended" => Some(Self::Suspended),
            "done" | "dead" => Some(Self::Done),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for InferenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not-started",
            Self::Working => "working",
            Self::Suspended => "suspended",
            Self::Done => "done",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Why a run stopped short of exhausting the search
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SuspendReason {
    /// Hit the answer-count ceiling
    MaxNumber,
    MaxTime,
    MaxSteps,
    /// Stopped on request
    Interrupt,
    /// Nothing more to find under the current budget
    Exhaust,
    /// Nothing more to find at all
    ExhaustTotal,
    Abort,
    Error(String),
}

impl SuspendReason {
    pub fn from_term(term: &Term) -> Result<Self> {
        if let Some(keyword) = term.as_keyword() {
            return match keyword {
                "max-number" => Ok(Self::MaxNumber),
                "max-time" => Ok(Self::MaxTime),
                "max-step" | "max-steps" => Ok(Self::MaxSteps),
                "interrupt" => Ok(Self::Interrupt),
                "exhaust" => Ok(Self::Exhaust),
                "exhaust-total" => Ok(Self::ExhaustTotal),
                "abort" => Ok(Self::Abort),
                other => Err(ClientError::Protocol(format!(
                    "unknown suspend reason :{other}"
                ))),
            };
        }
        if let Some(message) = term.as_str() {
            return Ok(Self::Error(message.to_string()));
        }
        // (:error "message")
        match term.as_list() {
            Some([tag, message]) if tag.as_keyword() == Some("error") => {
                Ok(Self::Error(message.as_str().unwrap_or_default().to_string()))
            }
            _ => Err(ClientError::Protocol(format!("bad suspend reason: {term}"))),
        }
    }

    /// A resource ceiling the caller set; result sets do not continue past it
    /// on their own
    pub fn is_ceiling(&self) -> bool {
        matches!(self, Self::MaxNumber | Self::MaxTime | Self::MaxSteps)
    }

    pub fn permits_continuation(&self) -> bool {
        !matches!(self, Self::ExhaustTotal | Self::Abort | Self::Error(_))
    }
}

impl fmt::Display for SuspendReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxNumber => f.write_str("max-number"),
            Self::MaxTime => f.write_str("max-time"),
            Self::MaxSteps => f.write_str("max-steps"),
            Self::Interrupt => f.write_str("interrupt"),
            Self::Exhaust => f.write_str("exhaust"),
            Self::ExhaustTotal => f.write_str("exhaust-total"),
            Self::Abort => f.write_str("abort"),
            Self::Error(message) => write!(f, "error: {message}"),
        }
    }
}
