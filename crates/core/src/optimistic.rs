//! Optimistic mutations with a deferred, cancellable commit.
//!
//! A mutation is applied locally first, then moves through
//! `Applied -> Committing -> Committed | RolledBack`. Undo is only possible
//! while the mutation is still `Applied`.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    Applied,
    Committing,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MutationError {
    #[error("mutation is {actual:?}, expected {expected:?}")]
    InvalidTransition {
        expected: MutationState,
        actual: MutationState,
    },
}

#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraceOutcome {
    Elapsed,
    Cancelled,
}

/// Races the grace window against cancellation.
pub async fn wait_grace(window: Duration, token: &CancellationToken) -> GraceOutcome {
    tokio::select! {
        () = token.cancelled() => GraceOutcome::Cancelled,
        () = tokio::time::sleep(window) => {
            if token.is_cancelled() {
                GraceOutcome::Cancelled
            } else {
                GraceOutcome::Elapsed
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BatchId(u64);

impl BatchId {
    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

/// One optimistic mutation: the ids it affects and the local state captured
/// before it was applied.
#[derive(Debug, Clone)]
pub struct PendingMutation<T> {
    batch: BatchId,
    ids: Vec<String>,
    snapshot: Vec<T>,
    state: MutationState,
    token: CancellationToken,
}

impl<T: Clone> PendingMutation<T> {
    #[must_use]
    pub fn apply(batch: BatchId, ids: Vec<String>, snapshot: Vec<T>) -> Self {
        Self {
            batch,
            ids,
            snapshot,
            state: MutationState::Applied,
            token: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn batch(&self) -> BatchId {
        self.batch
    }

    #[must_use]
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    #[must_use]
    pub fn snapshot(&self) -> &[T] {
        &self.snapshot
    }

    #[must_use]
    pub fn state(&self) -> MutationState {
        self.state
    }

    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    fn expect_state(&self, expected: MutationState) -> Result<(), MutationError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(MutationError::InvalidTransition {
                expected,
                actual: self.state,
            })
        }
    }

    pub fn begin_commit(&mut self) -> Result<(), MutationError> {
        self.expect_state(MutationState::Applied)?;
        self.state = MutationState::Committing;
        Ok(())
    }

    pub fn mark_committed(&mut self) -> Result<(), MutationError> {
        self.expect_state(MutationState::Committing)?;
        self.state = MutationState::Committed;
        Ok(())
    }

    /// User undo before the commit started. Cancels the timer and hands back
    /// the captured snapshot.
    pub fn undo(&mut self) -> Result<Vec<T>, MutationError> {
        self.expect_state(MutationState::Applied)?;
        self.state = MutationState::RolledBack;
        self.token.cancel();
        Ok(self.snapshot.clone())
    }

    /// The remote commit failed outright.
    pub fn roll_back(&mut self) -> Result<Vec<T>, MutationError> {
        self.expect_state(MutationState::Committing)?;
        self.state = MutationState::RolledBack;
        Ok(self.snapshot.clone())
    }
}

/// Holds at most one pending mutation for a resource class.
#[derive(Debug)]
pub struct MutationSlot<T> {
    next_batch: u64,
    current: Option<PendingMutation<T>>,
}

impl<T> Default for MutationSlot<T> {
    fn default() -> Self {
        Self {
            next_batch: 0,
            current: None,
        }
    }
}

impl<T: Clone> MutationSlot<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages a new mutation. An earlier one that has not started committing
    /// is cancelled and folded in: its ids join the new batch and its
    /// snapshot, taken before either mutation, is kept for undo.
    pub fn stage(&mut self, ids: Vec<String>, snapshot: Vec<T>) -> &PendingMutation<T> {
        self.next_batch += 1;
        let batch = BatchId(self.next_batch);

        let mutation = match self.current.take() {
            Some(previous) if previous.state == MutationState::Applied => {
                previous.token.cancel();
                let mut merged = previous.ids;
                for id in ids {
                    if !merged.contains(&id) {
                        merged.push(id);
                    }
                }
                PendingMutation::apply(batch, merged, previous.snapshot)
            }
            _ => PendingMutation::apply(batch, ids, snapshot),
        };
        self.current.insert(mutation)
    }

    #[must_use]
    pub fn current(&self) -> Option<&PendingMutation<T>> {
        self.current.as_ref()
    }

    #[must_use]
    pub fn has_undoable(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|pending| pending.state == MutationState::Applied)
    }

    /// Undo the pending mutation, if it is still undoable.
    pub fn undo(&mut self) -> Option<Vec<T>> {
        let pending = self.current.as_mut()?;
        let snapshot = pending.undo().ok()?;
        self.current = None;
        Some(snapshot)
    }

    /// Moves `batch` to `Committing` and returns its ids, unless it was undone
    /// or superseded in the meantime.
    pub fn begin_commit(&mut self, batch: BatchId) -> Option<Vec<String>> {
        let pending = self.current.as_mut().filter(|pending| pending.batch == batch)?;
        pending.begin_commit().ok()?;
        Some(pending.ids.clone())
    }

    /// Finishes a commit started with `begin_commit`. On failure the captured
    /// snapshot is returned for restoration.
    pub fn finish_commit(&mut self, batch: BatchId, succeeded: bool) -> Option<Vec<T>> {
        if !self
            .current
            .as_ref()
            .is_some_and(|pending| pending.batch == batch)
        {
            return None;
        }
        let mut pending = self.current.take()?;
        if succeeded {
            pending.mark_committed().ok()?;
            None
        } else {
            pending.roll_back().ok()
        }
    }

    /// Snapshot of the staged mutation while it can still be undone. Records
    /// an earlier commit hands back after this batch was staged belong in it.
    pub fn staged_snapshot_mut(&mut self) -> Option<&mut Vec<T>> {
        self.current
            .as_mut()
            .filter(|pending| pending.state == MutationState::Applied)
            .map(|pending| &mut pending.snapshot)
    }

    /// Snapshot of a batch that is still current, for partial reconciliation.
    #[must_use]
    pub fn snapshot_of(&self, batch: BatchId) -> Option<&[T]> {
        self.current
            .as_ref()
            .filter(|pending| pending.batch == batch)
            .map(PendingMutation::snapshot)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{
        wait_grace, CancellationToken, GraceOutcome, MutationError, MutationSlot, MutationState,
        PendingMutation,
    };

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| (*value).to_string()).collect()
    }

    #[test]
    fn state_machine_rejects_out_of_order_transitions() {
        let mut pending = PendingMutation::apply(super::BatchId(1), ids(&["a"]), vec![1, 2]);

        assert_eq!(
            pending.mark_committed(),
            Err(MutationError::InvalidTransition {
                expected: MutationState::Committing,
                actual: MutationState::Applied,
            })
        );
        pending.begin_commit().expect("applied mutation should start committing");
        assert!(pending.undo().is_err());
        pending.mark_committed().expect("commit should complete");
        assert_eq!(pending.state(), MutationState::Committed);
    }

    #[test]
    fn undo_cancels_token_and_returns_snapshot() {
        let mut slot = MutationSlot::new();
        let token = slot.stage(ids(&["a"]), vec!["a", "b"]).token();

        assert_eq!(slot.undo(), Some(vec!["a", "b"]));
        assert!(token.is_cancelled());
        assert!(slot.current().is_none());
        assert_eq!(slot.undo(), None);
    }

    #[test]
    fn new_batch_supersedes_unfired_one() {
        let mut slot = MutationSlot::new();
        let first = slot.stage(ids(&["a"]), vec!["a", "b", "c"]);
        let first_batch = first.batch();
        let first_token = first.token();

        let second = slot.stage(ids(&["b", "a"]), vec!["b", "c"]);
        let second_batch = second.batch();

        assert!(first_token.is_cancelled());
        assert_eq!(second.ids(), ["a".to_string(), "b".to_string()]);
        assert_eq!(second.snapshot(), ["a", "b", "c"]);
        assert_eq!(slot.begin_commit(first_batch), None);
        assert_eq!(slot.begin_commit(second_batch), Some(ids(&["a", "b"])));
    }

    #[test]
    fn committing_batch_is_not_folded_into_next() {
        let mut slot = MutationSlot::new();
        let first_batch = slot.stage(ids(&["a"]), vec![1, 2, 3]).batch();
        slot.begin_commit(first_batch);

        let second = slot.stage(ids(&["b"]), vec![2, 3]);
        assert_eq!(second.ids(), ["b".to_string()]);
        assert_eq!(second.snapshot(), [2, 3]);
    }

    #[test]
    fn failed_commit_returns_snapshot() {
        let mut slot = MutationSlot::new();
        let batch = slot.stage(ids(&["a"]), vec![1, 2]).batch();
        slot.begin_commit(batch);

        assert_eq!(slot.finish_commit(batch, false), Some(vec![1, 2]));
        assert!(slot.current().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn grace_window_elapses_without_cancel() {
        let token = CancellationToken::new();
        let outcome = wait_grace(Duration::from_secs(5), &token).await;
        assert_eq!(outcome, GraceOutcome::Elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_grace_window() {
        let token = CancellationToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { wait_grace(Duration::from_secs(5), &token).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();

        let outcome = waiter.await.expect("waiter should finish");
        assert_eq!(outcome, GraceOutcome::Cancelled);
    }

    #[tokio::test]
    async fn already_cancelled_token_resolves_immediately() {
        let token = CancellationToken::new();
        token.cancel();
        token.cancelled().await;
        assert_eq!(
            wait_grace(Duration::from_secs(60), &token).await,
            GraceOutcome::Cancelled
        );
    }
}
