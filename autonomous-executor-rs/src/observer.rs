//! Progress, completion and critical-error callbacks.
//!
//! Every notification runs on its own spawned task under a timeout, so a
//! slow or panicking observer never reaches the run loop.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::state::ExecutionState;

#[async_trait]
pub trait ExecutionObserver: Send + Sync {
    async fn on_progress(&self, _state: &ExecutionState) {}

    /// Called once per execution on a terminal status
    async fn on_completion(&self, _state: &ExecutionState) {}

    /// Called when the run pauses for a decision or fails
    async fn on_critical_error(&self, _state: &ExecutionState, _message: &str) {}
}

#[derive(Debug, Clone)]
pub(crate) enum ObserverEvent {
    Progress,
    Completion,
    CriticalError(String),
}

impl ObserverEvent {
    fn name(&self) -> &'static str {
        match self {
            ObserverEvent::Progress => "progress",
            ObserverEvent::Completion => "completion",
            ObserverEvent::CriticalError(_) => "critical_error",
        }
    }
}

#[derive(Default)]
pub(crate) struct ObserverRegistry {
    global: RwLock<Vec<Arc<dyn ExecutionObserver>>>,
    per_execution: RwLock<HashMap<String, Vec<Arc<dyn ExecutionObserver>>>>,
}

impl ObserverRegistry {
    pub(crate) fn register_global(&self, observer: Arc<dyn ExecutionObserver>) {
        self.global
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub(crate) fn register_for(&self, execution_id: &str, observer: Arc<dyn ExecutionObserver>) {
        self.per_execution
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(execution_id.to_string())
            .or_default()
            .push(observer);
    }

    pub(crate) fn unregister(&self, execution_id: &str) {
        self.per_execution
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(execution_id);
    }

    fn observers_for(&self, execution_id: &str) -> Vec<Arc<dyn ExecutionObserver>> {
        let mut observers = self
            .global
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(scoped) = self
            .per_execution
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(execution_id)
        {
            observers.extend(scoped.iter().cloned());
        }
        observers
    }

    /// Fires the event at every matching observer without waiting for them.
    pub(crate) fn notify(&self, state: &ExecutionState, event: ObserverEvent, timeout: Duration) {
        for observer in self.observers_for(&state.execution_id) {
            let state = state.clone();
            let event = event.clone();
            tokio::spawn(async move {
                let call = async {
                    match &event {
                        ObserverEvent::Progress => observer.on_progress(&state).await,
                        ObserverEvent::Completion => observer.on_completion(&state).await,
                        ObserverEvent::CriticalError(message) => {
                            observer.on_critical_error(&state, message).await
                        }
                    }
                };
                if tokio::time::timeout(timeout, call).await.is_err() {
                    warn!(
                        execution_id = %state.execution_id,
                        event = event.name(),
                        timeout_ms = timeout.as_millis() as u64,
                        "Observer timed out"
                    );
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionConfig;
    use tokio::sync::mpsc;

    struct Forward(mpsc::UnboundedSender<String>);

    #[async_trait]
    impl ExecutionObserver for Forward {
        async fn on_progress(&self, state: &ExecutionState) {
            let _ = self.0.send(format!("progress:{}", state.execution_id));
        }
    }

    struct Panics;

    #[async_trait]
    impl ExecutionObserver for Panics {
        async fn on_progress(&self, _state: &ExecutionState) {
            panic!("observer bug");
        }
    }

    fn state(id: &str) -> ExecutionState {
        ExecutionState::new(id.into(), "w".into(), "u".into(), "p".into(), ExecutionConfig::default())
    }

    #[tokio::test]
    async fn scoped_observers_only_see_their_execution() {
        let registry = ObserverRegistry::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register_global(Arc::new(Panics));
        registry.register_for("e1", Arc::new(Forward(tx)));

        registry.notify(&state("e2"), ObserverEvent::Progress, Duration::from_secs(1));
        registry.notify(&state("e1"), ObserverEvent::Progress, Duration::from_secs(1));

        assert_eq!(rx.recv().await.as_deref(), Some("progress:e1"));

        registry.unregister("e1");
        registry.notify(&state("e1"), ObserverEvent::Progress, Duration::from_secs(1));
        assert!(rx.recv().await.is_none());
    }
}
