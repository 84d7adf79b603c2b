use std::{collections::HashMap, sync::Arc};

use jiff::Timestamp;

use crate::{
    state::{
        ApplyStateContext, AwaitingState, ConfigurationError, DeletedState, EnqueuedState,
        FailedState, ScheduledState, State, SucceededState,
    },
    storage::{keys, WriteTransaction},
    BoxError,
};

/// Side effects of entering or leaving a named state.
///
/// `apply` runs inside the transaction that makes the job enter the state,
/// `unapply` inside the one that makes it leave. Both only buffer writes on
/// the transaction; an error aborts the whole state change.
pub trait StateHandler: Send + Sync {
    /// Name of the state this handler is attached to.
    fn state_name(&self) -> &str;

    /// Buffers the writes that go with entering the state.
    fn apply(
        &self,
        context: &ApplyStateContext<'_>,
        transaction: &mut dyn WriteTransaction,
    ) -> Result<(), BoxError>;

    /// Buffers the writes that go with leaving the state.
    fn unapply(
        &self,
        context: &ApplyStateContext<'_>,
        transaction: &mut dyn WriteTransaction,
    ) -> Result<(), BoxError>;
}

/// Handlers grouped by the state they're attached to.
///
/// State names are matched case-insensitively.
#[derive(Clone, Default)]
pub struct StateHandlerCollection {
    handlers: HashMap<String, Vec<Arc<dyn StateHandler>>>,
}

impl StateHandlerCollection {
    /// Creates a collection holding the built-in handlers.
    pub fn with_defaults() -> Self {
        let mut collection = Self::default();
        let defaults: [Arc<dyn StateHandler>; 6] = [
            Arc::new(EnqueuedStateHandler),
            Arc::new(ScheduledStateHandler),
            Arc::new(AwaitingStateHandler),
            Arc::new(FailedStateHandler),
            Arc::new(SucceededStateHandler),
            Arc::new(DeletedStateHandler),
        ];
        for handler in defaults {
            collection.insert(handler);
        }
        collection
    }

    /// Attaches a handler to the state it names.
    ///
    /// Handlers of one state run in the order they were added.
    pub fn add_handler(
        &mut self,
        handler: Arc<dyn StateHandler>,
    ) -> Result<&mut Self, ConfigurationError> {
        if handler.state_name().trim().is_empty() {
            return Err(ConfigurationError::EmptyStateName);
        }

        self.insert(handler);
        Ok(self)
    }

    /// The handlers attached to `state_name`; empty when there are none.
    pub fn get_handlers(&self, state_name: Option<&str>) -> &[Arc<dyn StateHandler>] {
        state_name
            .and_then(|name| self.handlers.get(&name.to_ascii_lowercase()))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn insert(&mut self, handler: Arc<dyn StateHandler>) {
        self.handlers
            .entry(handler.state_name().to_ascii_lowercase())
            .or_default()
            .push(handler);
    }
}

impl std::fmt::Debug for StateHandlerCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut counts = self
            .handlers
            .iter()
            .map(|(name, handlers)| (name.as_str(), handlers.len()))
            .collect::<Vec<_>>();
        counts.sort_unstable();
        f.debug_struct("StateHandlerCollection")
            .field("handlers", &counts)
            .finish()
    }
}

/// A built-in handler was given a state of another kind.
#[derive(Debug, thiserror::Error)]
#[error("Handler for `{expected}` was applied to a `{actual}` state")]
struct UnexpectedState {
    expected: &'static str,
    actual: String,
}

fn unexpected(expected: &'static str, actual: &State) -> BoxError {
    Box::new(UnexpectedState {
        expected,
        actual: actual.name().to_string(),
    })
}

fn score(timestamp: Timestamp) -> f64 {
    timestamp.as_second() as f64
}

struct EnqueuedStateHandler;

impl StateHandler for EnqueuedStateHandler {
    fn state_name(&self) -> &str {
        EnqueuedState::NAME
    }

    fn apply(
        &self,
        context: &ApplyStateContext<'_>,
        transaction: &mut dyn WriteTransaction,
    ) -> Result<(), BoxError> {
        let State::Enqueued(state) = context.new_state() else {
            return Err(unexpected(EnqueuedState::NAME, context.new_state()));
        };
        transaction.add_to_queue(state.queue(), context.job_id());
        Ok(())
    }

    fn unapply(
        &self,
        _context: &ApplyStateContext<'_>,
        _transaction: &mut dyn WriteTransaction,
    ) -> Result<(), BoxError> {
        // Leaving the queue is the fetcher's business.
        Ok(())
    }
}

struct ScheduledStateHandler;

impl StateHandler for ScheduledStateHandler {
    fn state_name(&self) -> &str {
        ScheduledState::NAME
    }

    fn apply(
        &self,
        context: &ApplyStateContext<'_>,
        transaction: &mut dyn WriteTransaction,
    ) -> Result<(), BoxError> {
        let State::Scheduled(state) = context.new_state() else {
            return Err(unexpected(ScheduledState::NAME, context.new_state()));
        };
        transaction.add_to_set(keys::SCHEDULE, context.job_id(), score(state.enqueue_at()));
        Ok(())
    }

    fn unapply(
        &self,
        context: &ApplyStateContext<'_>,
        transaction: &mut dyn WriteTransaction,
    ) -> Result<(), BoxError> {
        transaction.remove_from_set(keys::SCHEDULE, context.job_id());
        Ok(())
    }
}

struct AwaitingStateHandler;

impl StateHandler for AwaitingStateHandler {
    fn state_name(&self) -> &str {
        AwaitingState::NAME
    }

    fn apply(
        &self,
        context: &ApplyStateContext<'_>,
        transaction: &mut dyn WriteTransaction,
    ) -> Result<(), BoxError> {
        transaction.add_to_set(keys::AWAITING, context.job_id(), score(Timestamp::now()));
        Ok(())
    }

    fn unapply(
        &self,
        context: &ApplyStateContext<'_>,
        transaction: &mut dyn WriteTransaction,
    ) -> Result<(), BoxError> {
        transaction.remove_from_set(keys::AWAITING, context.job_id());
        Ok(())
    }
}

struct FailedStateHandler;

impl StateHandler for FailedStateHandler {
    fn state_name(&self) -> &str {
        FailedState::NAME
    }

    fn apply(
        &self,
        context: &ApplyStateContext<'_>,
        transaction: &mut dyn WriteTransaction,
    ) -> Result<(), BoxError> {
        let failed_at = match context.new_state() {
            State::Failed(state) => state.failed_at(),
            other => return Err(unexpected(FailedState::NAME, other)),
        };
        transaction.add_to_set(keys::FAILED, context.job_id(), score(failed_at));
        Ok(())
    }

    fn unapply(
        &self,
        context: &ApplyStateContext<'_>,
        transaction: &mut dyn WriteTransaction,
    ) -> Result<(), BoxError> {
        transaction.remove_from_set(keys::FAILED, context.job_id());
        Ok(())
    }
}

struct SucceededStateHandler;

impl StateHandler for SucceededStateHandler {
    fn state_name(&self) -> &str {
        SucceededState::NAME
    }

    fn apply(
        &self,
        _context: &ApplyStateContext<'_>,
        transaction: &mut dyn WriteTransaction,
    ) -> Result<(), BoxError> {
        transaction.increment_counter(keys::STATS_SUCCEEDED);
        Ok(())
    }

    fn unapply(
        &self,
        _context: &ApplyStateContext<'_>,
        transaction: &mut dyn WriteTransaction,
    ) -> Result<(), BoxError> {
        transaction.decrement_counter(keys::STATS_SUCCEEDED);
        Ok(())
    }
}

struct DeletedStateHandler;

impl StateHandler for DeletedStateHandler {
    fn state_name(&self) -> &str {
        DeletedState::NAME
    }

    fn apply(
        &self,
        _context: &ApplyStateContext<'_>,
        transaction: &mut dyn WriteTransaction,
    ) -> Result<(), BoxError> {
        transaction.increment_counter(keys::STATS_DELETED);
        Ok(())
    }

    fn unapply(
        &self,
        _context: &ApplyStateContext<'_>,
        transaction: &mut dyn WriteTransaction,
    ) -> Result<(), BoxError> {
        transaction.decrement_counter(keys::STATS_DELETED);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::{
        job::Job,
        state::{StateContext, SucceededState},
        testing::{RecordingConnection, RecordingTransaction},
        JobId,
    };

    struct Named(&'static str);

    impl StateHandler for Named {
        fn state_name(&self) -> &str {
            self.0
        }

        fn apply(
            &self,
            _context: &ApplyStateContext<'_>,
            transaction: &mut dyn WriteTransaction,
        ) -> Result<(), BoxError> {
            transaction.increment_counter(self.0);
            Ok(())
        }

        fn unapply(
            &self,
            _context: &ApplyStateContext<'_>,
            _transaction: &mut dyn WriteTransaction,
        ) -> Result<(), BoxError> {
            Ok(())
        }
    }

    fn apply_default(state: State) -> Result<Vec<String>, BoxError> {
        let connection = RecordingConnection::default();
        let job_id = JobId::try_from("42")?;
        let context = StateContext::new(job_id, Some(Job::new("send", json!([]))), &connection);
        let state_name = state.name().to_string();
        let apply = ApplyStateContext::new(&context, state, None, Duration::from_secs(60));

        let collection = StateHandlerCollection::with_defaults();
        let mut transaction = RecordingTransaction::detached();
        for handler in collection.get_handlers(Some(&state_name)) {
            handler.apply(&apply, &mut transaction)?;
        }
        Ok(transaction.ops().to_vec())
    }

    #[test]
    fn empty_state_names_are_rejected() {
        let mut collection = StateHandlerCollection::default();
        let err = collection.add_handler(Arc::new(Named(" "))).unwrap_err();
        assert_eq!(err, ConfigurationError::EmptyStateName);
    }

    #[test]
    fn unknown_states_have_no_handlers() {
        let collection = StateHandlerCollection::with_defaults();
        assert!(collection.get_handlers(Some("Archived")).is_empty());
        assert!(collection.get_handlers(None).is_empty());
    }

    #[test]
    fn handlers_keep_registration_order() -> Result<(), ConfigurationError> {
        let mut collection = StateHandlerCollection::default();
        collection
            .add_handler(Arc::new(Named("Archived")))?
            .add_handler(Arc::new(Named("archived")))?;

        let names = collection
            .get_handlers(Some("ARCHIVED"))
            .iter()
            .map(|h| h.state_name().to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, ["Archived", "archived"]);
        Ok(())
    }

    #[test]
    fn enqueued_adds_to_queue() -> Result<(), BoxError> {
        let ops = apply_default(EnqueuedState::new("critical")?.into())?;
        assert_eq!(ops, ["AddToQueue(critical)"]);
        Ok(())
    }

    #[test]
    fn scheduled_adds_to_schedule() -> Result<(), BoxError> {
        let ops = apply_default(ScheduledState::new(Timestamp::now()).into())?;
        assert_eq!(ops, ["AddToSet(schedule)"]);
        Ok(())
    }

    #[test]
    fn succeeded_increments_stats() -> Result<(), BoxError> {
        let ops = apply_default(SucceededState::new(None, 1, 2).into())?;
        assert_eq!(ops, ["IncrementCounter(stats:succeeded)"]);
        Ok(())
    }

    #[test]
    fn processing_has_no_default_handler() -> Result<(), BoxError> {
        let ops = apply_default(crate::state::ProcessingState::new("s", "w").into())?;
        assert!(ops.is_empty());
        Ok(())
    }
}
