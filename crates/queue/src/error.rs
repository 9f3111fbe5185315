use payrouter_core::validation::ValidationErrors;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no provider returned requisites for invoice {invoice_id} after {attempts} attempt(s)")]
    AllProvidersExhausted { invoice_id: u64, attempts: usize },
}

/// Why a single queue message did not end in an acknowledgement.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("malformed message: {0}")]
    MalformedMessage(#[source] serde_json::Error),
    #[error("invoice {invoice_id} failed validation: {errors}")]
    Invalid {
        invoice_id: u64,
        errors: ValidationErrors,
    },
    #[error("invoice {invoice_id} expired, created {age_secs}s ago")]
    TaskExpired { invoice_id: u64, age_secs: i64 },
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// What happens to a delivery once its task has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    /// Negative acknowledgement without requeue; the broker dead-letters it.
    Drop,
    Requeue,
}

impl TaskError {
    pub fn disposition(&self) -> Disposition {
        match self {
            TaskError::MalformedMessage(_)
            | TaskError::Invalid { .. }
            | TaskError::TaskExpired { .. } => Disposition::Drop,
            TaskError::Dispatch(DispatchError::AllProvidersExhausted { .. }) => {
                Disposition::Requeue
            }
        }
    }
}

pub fn disposition_of(result: &Result<(), TaskError>) -> Disposition {
    match result {
        Ok(()) => Disposition::Ack,
        Err(e) => e.disposition(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use payrouter_core::validation::ValidationError;

    #[test]
    fn terminal_failures_are_dropped_and_exhaustion_requeued() {
        let malformed = serde_json::from_str::<u64>("{").unwrap_err();
        assert_eq!(
            TaskError::MalformedMessage(malformed).disposition(),
            Disposition::Drop
        );
        assert_eq!(
            TaskError::Invalid {
                invoice_id: 1,
                errors: ValidationErrors(vec![ValidationError::NoExchangers]),
            }
            .disposition(),
            Disposition::Drop
        );
        assert_eq!(
            TaskError::TaskExpired {
                invoice_id: 1,
                age_secs: 400
            }
            .disposition(),
            Disposition::Drop
        );
        let exhausted: TaskError = DispatchError::AllProvidersExhausted {
            invoice_id: 1,
            attempts: 2,
        }
        .into();
        assert_eq!(exhausted.disposition(), Disposition::Requeue);
        assert_eq!(disposition_of(&Ok(())), Disposition::Ack);
    }
}
