//! Inference progress reports
//!
//! The server reports progress as a property list:
//!
//! ```text
//! (:inference-id (3 17) :status :suspended :suspend-reason :max-number
//!  :answer-start 0 :answers (((?X . Emu-1))) :error "...")
//! ```
//!
//! Every key is optional. `:answer-start` is the index of the first answer in
//! `:answers`; batches may overlap answers already seen.

use super::status::{InferenceStatus, SuspendReason};
use crate::types::{ClientError, InferenceId, Result, Term};

#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct InferenceUpdate {
    pub inference_id: Option<InferenceId>,
    pub status: Option<InferenceStatus>,
    pub suspend_reason: Option<SuspendReason>,
    pub answer_start: Option<usize>,
    pub answers: Vec<Term>,
    pub error: Option<String>,
}

impl InferenceUpdate {
    pub fn from_term(term: &Term) -> Result<Self> {
        if term.as_list().is_none() {
            return Err(ClientError::Protocol(format!(
                "inference update is not a property list: {term}"
            )));
        }

        let inference_id = term
            .plist_get("inference-id")
            .filter(|t| !t.is_nil())
            .map(InferenceId::from_term)
            .transpose()?;

        let status = term
            .plist_get("status")
            .map(|t| {
                t.as_keyword()
                    .and_then(InferenceStatus::from_keyword)
                    .ok_or_else(|| ClientError::Protocol(format!("unknown inference status: {t}")))
            })
            .transpose()?;

        let suspend_reason = term
            .plist_get("suspend-reason")
            .filter(|t| !t.is_nil())
            .map(SuspendReason::from_term)
            .transpose()?;

        let answer_start = term
            .plist_get("answer-start")
            .map(|t| {
                t.as_int()
                    .and_then(|n| usize::try_from(n).ok())
                    .ok_or_else(|| ClientError::Protocol(format!("bad answer start: {t}")))
            })
            .transpose()?;

        let answers = match term.plist_get("answers") {
            Some(t) => t
                .as_list()
                .ok_or_else(|| ClientError::Protocol(format!("answers are not a list: {t}")))?
                .to_vec(),
            None => Vec::new(),
        };

        let error = term
            .plist_get("error")
            .and_then(|t| t.as_str().map(str::to_string));

        Ok(Self {
            inference_id,
            status,
            suspend_reason,
            answer_start,
            answers,
            error,
        })
    }
}
