//! Deferrable finite-state machine
//!
//! Transitions are declared once, up front, as `(event, sources, target)`
//! rules and never change afterwards. Handling an event runs its action
//! synchronously; the action may ask for the transition to be *deferred*, in
//! which case the machine records a [`PendingTransition`] and keeps its current
//! state until [`StateMachine::finalize`] is called.
//!
//! INVARIANT: at most one transition is pending at any time. Every event
//! handled while a transition is pending is rejected, which serializes
//! transitions and keeps the history of state changes free of overlap.

use std::fmt;
use std::time::Instant;

/// One declared transition
#[derive(Clone, Debug)]
pub struct TransitionRule<S, E> {
    pub event: E,
    pub sources: Vec<S>,
    pub target: S,
}

impl<S: PartialEq, E> TransitionRule<S, E> {
    #[inline]
    pub fn allows(&self, state: &S) -> bool {
        self.sources.contains(state)
    }
}

/// Fixed set of transition rules, keyed by event
#[derive(Clone, Debug)]
pub struct TransitionTable<S, E> {
    rules: Vec<TransitionRule<S, E>>,
}

impl<S: Copy + Eq, E: Copy + Eq> TransitionTable<S, E> {
    pub fn new() -> Self {
        TransitionTable { rules: Vec::new() }
    }

    /// Declare `event: sources -> target`. Re-declaring an event replaces it.
    pub fn with(mut self, event: E, sources: &[S], target: S) -> Self {
        self.rules.retain(|rule| rule.event != event);
        self.rules.push(TransitionRule {
            event,
            sources: sources.to_vec(),
            target,
        });
        self
    }

    pub fn rule(&self, event: E) -> Option<&TransitionRule<S, E>> {
        self.rules.iter().find(|rule| rule.event == event)
    }

    pub fn events(&self) -> impl Iterator<Item = E> + '_ {
        self.rules.iter().map(|rule| rule.event)
    }
}

impl<S: Copy + Eq, E: Copy + Eq> Default for TransitionTable<S, E> {
    fn default() -> Self {
        Self::new()
    }
}

/// A completed transition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateChange<S> {
    pub from: S,
    pub to: S,
}

/// A transition whose action asked to be completed later
#[derive(Clone, Debug)]
pub struct PendingTransition<S, E> {
    pub event: E,
    pub from: S,
    pub target: S,
    pub started_at: Instant,
}

/// Result of a successfully admitted event
#[derive(Clone, Debug)]
pub enum Outcome<S, E> {
    Completed(StateChange<S>),
    Deferred(PendingTransition<S, E>),
}

/// Handle passed to transition actions
#[derive(Debug, Default)]
pub struct Deferral {
    deferred: bool,
}

impl Deferral {
    /// Keep the current state until `finalize` is called
    pub fn defer(&mut self) {
        self.deferred = true;
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred
    }
}

/// Why an event was not admitted
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransitionError<S, E> {
    /// No rule declared for this event
    UnknownEvent(E),
    /// Current state is not among the event's sources
    NotAllowed { event: E, state: S },
    /// Another transition is still in flight
    Pending { event: E, pending: E },
    /// `finalize` called with nothing pending
    NothingPending,
}

impl<S: fmt::Debug, E: fmt::Debug> fmt::Display for TransitionError<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionError::UnknownEvent(event) => write!(f, "unknown event {event:?}"),
            TransitionError::NotAllowed { event, state } => {
                write!(f, "event {event:?} not allowed in state {state:?}")
            }
            TransitionError::Pending { event, pending } => {
                write!(f, "event {event:?} rejected: transition {pending:?} is pending")
            }
            TransitionError::NothingPending => f.write_str("no pending transition to finalize"),
        }
    }
}

impl<S: fmt::Debug, E: fmt::Debug> std::error::Error for TransitionError<S, E> {}

/// Failure of [`StateMachine::handle_event`]
#[derive(Debug)]
pub enum HandleError<S, E, A> {
    /// The event was not admitted; the action did not run
    Rejected(TransitionError<S, E>),
    /// The action ran and failed; no state change, nothing pending
    Action(A),
}

impl<S: fmt::Debug, E: fmt::Debug, A: fmt::Display> fmt::Display for HandleError<S, E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleError::Rejected(err) => write!(f, "rejected: {err}"),
            HandleError::Action(err) => write!(f, "action failed: {err}"),
        }
    }
}

impl<S: fmt::Debug, E: fmt::Debug, A: fmt::Debug + fmt::Display> std::error::Error
    for HandleError<S, E, A>
{
}

/// State machine with single-pending-transition semantics
#[derive(Debug)]
pub struct StateMachine<S, E> {
    table: TransitionTable<S, E>,
    current: S,
    pending: Option<PendingTransition<S, E>>,
}

impl<S, E> StateMachine<S, E>
where
    S: Copy + Eq + fmt::Debug,
    E: Copy + Eq + fmt::Debug,
{
    pub fn new(table: TransitionTable<S, E>, initial: S) -> Self {
        StateMachine {
            table,
            current: initial,
            pending: None,
        }
    }

    #[inline]
    pub fn current(&self) -> S {
        self.current
    }

    #[inline]
    pub fn pending(&self) -> Option<&PendingTransition<S, E>> {
        self.pending.as_ref()
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn table(&self) -> &TransitionTable<S, E> {
        &self.table
    }

    /// Would `event` be admitted right now? Returns its target state.
    pub fn check(&self, event: E) -> Result<S, TransitionError<S, E>> {
        if let Some(pending) = &self.pending {
            return Err(TransitionError::Pending {
                event,
                pending: pending.event,
            });
        }

        let rule = self
            .table
            .rule(event)
            .ok_or(TransitionError::UnknownEvent(event))?;

        if !rule.allows(&self.current) {
            return Err(TransitionError::NotAllowed {
                event,
                state: self.current,
            });
        }

        Ok(rule.target)
    }

    /// Admit `event`, run its action, and complete or defer the transition.
    ///
    /// A rejected event leaves the machine untouched and never runs the action.
    pub fn handle_event<A, F>(
        &mut self,
        event: E,
        action: F,
    ) -> Result<Outcome<S, E>, HandleError<S, E, A>>
    where
        F: FnOnce(&mut Deferral) -> Result<(), A>,
    {
        let target = self.check(event).map_err(HandleError::Rejected)?;

        let mut deferral = Deferral::default();
        action(&mut deferral).map_err(HandleError::Action)?;

        if deferral.is_deferred() {
            let pending = PendingTransition {
                event,
                from: self.current,
                target,
                started_at: Instant::now(),
            };
            self.pending = Some(pending.clone());
            return Ok(Outcome::Deferred(pending));
        }

        let from = self.current;
        self.current = target;
        Ok(Outcome::Completed(StateChange { from, to: target }))
    }

    /// Complete the pending transition
    pub fn finalize(&mut self) -> Result<StateChange<S>, TransitionError<S, E>> {
        let pending = self.pending.take().ok_or(TransitionError::NothingPending)?;
        self.current = pending.target;
        Ok(StateChange {
            from: pending.from,
            to: pending.target,
        })
    }

    /// Drop the pending transition without changing state
    pub fn abandon(&mut self) -> Option<PendingTransition<S, E>> {
        self.pending.take()
    }
}
