//! Test doubles for the unit-of-work machinery

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::authz::binder::ClearOutcome;
use crate::authz::context::{AuthorizationContext, Direction, Principal, VisibilitySet};
use crate::authz::error::AuthzError;
use crate::authz::executor::ScopeBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Begin,
    Bind,
    Clear,
    Commit,
    Rollback,
    Abandon,
}

/// Stand-in for a pooled transaction
#[derive(Debug)]
pub struct MockSession {
    pub id: Uuid,
    bound: Option<Uuid>,
}

/// Records every backend call in order. Clones share the log.
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    log: Arc<Mutex<Vec<Event>>>,
    fail_bind: bool,
    aborted: bool,
}

impl MockBackend {
    pub fn fail_bind(mut self) -> Self {
        self.fail_bind = true;
        self
    }

    /// Behave as if every transaction hit an error the callback swallowed
    pub fn abort_transaction(mut self) -> Self {
        self.aborted = true;
        self
    }

    fn record(&self, event: Event) {
        if let Ok(mut log) = self.log.lock() {
            log.push(event);
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    pub fn count(&self, event: Event) -> usize {
        self.events().into_iter().filter(|e| *e == event).count()
    }

    /// Sessions begun but neither committed nor rolled back
    pub fn open_sessions(&self) -> usize {
        let events = self.events();
        let begun = events.iter().filter(|e| **e == Event::Begin).count();
        let closed = events
            .iter()
            .filter(|e| matches!(e, Event::Commit | Event::Rollback))
            .count();
        begun.saturating_sub(closed)
    }
}

#[async_trait]
impl ScopeBackend for MockBackend {
    type Session = MockSession;

    async fn begin(&self) -> Result<MockSession, AuthzError> {
        self.record(Event::Begin);
        Ok(MockSession {
            id: Uuid::new_v4(),
            bound: None,
        })
    }

    async fn bind(
        &self,
        session: &mut MockSession,
        principal: &Principal,
        direction: Direction,
    ) -> Result<AuthorizationContext, AuthzError> {
        self.record(Event::Bind);
        if let Some(token) = session.bound {
            return Err(AuthzError::ContextAlreadyBound(token));
        }
        if self.fail_bind {
            return Err(AuthzError::ContextBinding("injected failure".to_string()));
        }
        let context = AuthorizationContext::new(
            principal,
            direction,
            VisibilitySet::new(principal.organization_id, Vec::new()),
        );
        session.bound = Some(context.token);
        Ok(context)
    }

    async fn clear(&self, session: &mut MockSession) -> ClearOutcome {
        self.record(Event::Clear);
        if self.aborted {
            return ClearOutcome::PendingRollback;
        }
        session.bound = None;
        ClearOutcome::Cleared
    }

    async fn commit(&self, session: MockSession) -> Result<(), AuthzError> {
        self.record(Event::Commit);
        if session.bound.is_some() {
            return Err(AuthzError::ContextClear("committed with context bound".to_string()));
        }
        Ok(())
    }

    async fn rollback(&self, _session: MockSession) -> Result<(), AuthzError> {
        self.record(Event::Rollback);
        Ok(())
    }

    fn abandon(&self, _session: MockSession) {
        self.record(Event::Abandon);
        self.record(Event::Clear);
        self.record(Event::Rollback);
    }
}
