// Reset barrier: holds every session at reset until the whole quorum has
// reported ready, then releases them together by bumping the epoch.
//
// Phases: Idle → AwaitingAll (first ready flag set) → Releasing (epoch bumped,
// release hook running) → Idle. Release happens under the barrier lock and
// waiters only ever compare the epoch, so no session can observe the new
// epoch before another one could.
//
// The quorum is every session that has not closed. What happens when one
// closes depends on `QuorumPolicy`:
// - Abort: the barrier can never complete again, so it moves to Aborted and
//   every current and future waiter fails with `SessionClosed` naming the
//   session that left.
// - Exclude: the session leaves the quorum; if everyone remaining is ready,
//   the barrier releases right away.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use fabric_protocol::{ResetEpoch, SessionIndex};
use tracing::{debug, info, warn};

use crate::config::QuorumPolicy;
use crate::error::{FabricError, FabricResult};
use crate::lock;

/// How often a cancellable wait re-checks its cancel condition.
const CANCEL_POLL: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarrierPhase {
    Idle,
    AwaitingAll,
    Releasing,
    /// A session closed under `QuorumPolicy::Abort`.
    Aborted(SessionIndex),
}

type ReleaseHook = Box<dyn Fn(ResetEpoch) + Send + Sync>;

struct BarrierState {
    epoch: ResetEpoch,
    ready: Vec<bool>,
    live: Vec<bool>,
    phase: BarrierPhase,
}

impl BarrierState {
    fn quorum_ready(&self) -> bool {
        let mut any_live = false;
        for (ready, live) in self.ready.iter().zip(&self.live) {
            if *live {
                any_live = true;
                if !ready {
                    return false;
                }
            }
        }
        any_live
    }
}

pub struct ResetBarrier {
    state: Mutex<BarrierState>,
    released: Condvar,
    policy: QuorumPolicy,
    on_release: Option<ReleaseHook>,
}

impl ResetBarrier {
    pub fn new(sessions: usize, policy: QuorumPolicy) -> Self {
        Self {
            state: Mutex::new(BarrierState {
                epoch: ResetEpoch::default(),
                ready: vec![false; sessions],
                live: vec![true; sessions],
                phase: BarrierPhase::Idle,
            }),
            released: Condvar::new(),
            policy,
            on_release: None,
        }
    }

    /// Run `hook` with the new epoch on every release, before any waiter
    /// wakes.
    pub fn with_release_hook(
        mut self,
        hook: impl Fn(ResetEpoch) + Send + Sync + 'static,
    ) -> Self {
        self.on_release = Some(Box::new(hook));
        self
    }

    pub fn epoch(&self) -> ResetEpoch {
        lock(&self.state).epoch
    }

    pub fn phase(&self) -> BarrierPhase {
        lock(&self.state).phase
    }

    /// Sessions ready in the current cycle.
    pub fn ready_count(&self) -> usize {
        lock(&self.state).ready.iter().filter(|r| **r).count()
    }

    /// Record that `index` is ready. Returns the epoch the session is
    /// waiting to see passed. Releases the barrier if `index` completes the
    /// quorum.
    pub fn mark_ready(&self, index: SessionIndex) -> FabricResult<ResetEpoch> {
        let mut state = lock(&self.state);
        if let BarrierPhase::Aborted(by) = state.phase {
            return Err(FabricError::SessionClosed(by));
        }
        let i = index.as_usize();
        if !state.live.get(i).copied().unwrap_or(false) {
            return Err(FabricError::SessionClosed(index));
        }
        let waiting_on = state.epoch;
        if !state.ready[i] {
            state.ready[i] = true;
            state.phase = BarrierPhase::AwaitingAll;
            debug!(%index, %waiting_on, "ready for reset");
        }
        if state.quorum_ready() {
            self.release(&mut state);
        }
        Ok(waiting_on)
    }

    /// `mark_ready` then wait for the release.
    pub fn arrive(&self, index: SessionIndex) -> FabricResult<ResetEpoch> {
        let after = self.mark_ready(index)?;
        self.wait(after, Some(index), &|| false)
    }

    /// Block until the epoch moves past `after`.
    pub fn wait_for_reset(&self, after: ResetEpoch) -> FabricResult<ResetEpoch> {
        self.wait(after, None, &|| false)
    }

    /// `wait_for_reset` that also gives up once `cancelled` returns true.
    pub fn wait_for_reset_or(
        &self,
        after: ResetEpoch,
        cancelled: &dyn Fn() -> bool,
    ) -> FabricResult<ResetEpoch> {
        self.wait(after, None, cancelled)
    }

    fn wait(
        &self,
        after: ResetEpoch,
        session: Option<SessionIndex>,
        cancelled: &dyn Fn() -> bool,
    ) -> FabricResult<ResetEpoch> {
        let mut state = lock(&self.state);
        loop {
            if state.epoch > after {
                return Ok(state.epoch);
            }
            if let BarrierPhase::Aborted(by) = state.phase {
                return Err(FabricError::SessionClosed(by));
            }
            if let Some(index) = session
                && !state.live[index.as_usize()]
            {
                return Err(FabricError::SessionClosed(index));
            }
            if cancelled() {
                return Err(FabricError::fatal("interrupted while waiting for reset"));
            }
            state = self
                .released
                .wait_timeout(state, CANCEL_POLL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Remove `index` from the quorum, applying the quorum policy.
    pub fn close_session(&self, index: SessionIndex) {
        let mut state = lock(&self.state);
        let i = index.as_usize();
        if !state.live.get(i).copied().unwrap_or(false) {
            return;
        }
        state.live[i] = false;
        state.ready[i] = false;
        if matches!(state.phase, BarrierPhase::Aborted(_)) {
            return;
        }

        let no_one_left = !state.live.iter().any(|l| *l);
        if self.policy == QuorumPolicy::Abort || no_one_left {
            if state.phase == BarrierPhase::AwaitingAll || state.epoch == ResetEpoch(0) {
                warn!(
                    %index,
                    epoch = %state.epoch,
                    "session left before reset release; barrier aborted"
                );
            } else {
                debug!(%index, epoch = %state.epoch, "session left; no further resets possible");
            }
            state.phase = BarrierPhase::Aborted(index);
            self.released.notify_all();
            return;
        }

        debug!(%index, "session excluded from the reset quorum");
        if state.phase == BarrierPhase::AwaitingAll && state.quorum_ready() {
            self.release(&mut state);
        } else {
            // Wake a waiter whose own session just left.
            self.released.notify_all();
        }
    }

    fn release(&self, state: &mut BarrierState) {
        state.phase = BarrierPhase::Releasing;
        state.epoch = state.epoch.next();
        state.ready.iter_mut().for_each(|r| *r = false);
        if let Some(hook) = &self.on_release {
            hook(state.epoch);
        }
        state.phase = BarrierPhase::Idle;
        info!(epoch = %state.epoch, "reset released");
        self.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::thread;

    fn spawn_arrivals(
        barrier: &Arc<ResetBarrier>,
        indices: &[u32],
    ) -> Vec<thread::JoinHandle<FabricResult<ResetEpoch>>> {
        indices
            .iter()
            .map(|&i| {
                let barrier = Arc::clone(barrier);
                thread::spawn(move || barrier.arrive(SessionIndex(i)))
            })
            .collect()
    }

    fn wait_until_ready(barrier: &ResetBarrier, n: usize) {
        for _ in 0..200 {
            if barrier.ready_count() == n {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("expected {n} ready sessions, have {}", barrier.ready_count());
    }

    #[test]
    fn releases_only_after_every_session_is_ready() {
        let barrier = Arc::new(ResetBarrier::new(4, QuorumPolicy::Abort));
        let early = spawn_arrivals(&barrier, &[0, 1, 2]);
        wait_until_ready(&barrier, 3);
        assert_eq!(barrier.epoch(), ResetEpoch(0));
        assert_eq!(barrier.phase(), BarrierPhase::AwaitingAll);

        assert_eq!(barrier.arrive(SessionIndex(3)).unwrap(), ResetEpoch(1));
        for handle in early {
            assert_eq!(handle.join().unwrap().unwrap(), ResetEpoch(1));
        }
        assert_eq!(barrier.phase(), BarrierPhase::Idle);
        assert_eq!(barrier.ready_count(), 0);
    }

    #[test]
    fn observer_wakes_on_release() {
        let barrier = Arc::new(ResetBarrier::new(2, QuorumPolicy::Abort));
        let observer = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || barrier.wait_for_reset(ResetEpoch(0)))
        };
        barrier.mark_ready(SessionIndex(0)).unwrap();
        barrier.mark_ready(SessionIndex(1)).unwrap();
        assert_eq!(observer.join().unwrap().unwrap(), ResetEpoch(1));
    }

    #[test]
    fn release_hook_runs_before_waiters_see_the_epoch() {
        let seen = Arc::new(AtomicU64::new(0));
        let barrier = {
            let seen = Arc::clone(&seen);
            ResetBarrier::new(1, QuorumPolicy::Abort)
                .with_release_hook(move |epoch| seen.store(epoch.0, Ordering::SeqCst))
        };
        let epoch = barrier.arrive(SessionIndex(0)).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), epoch.0);
    }

    #[test]
    fn abort_policy_fails_every_waiter() {
        let barrier = Arc::new(ResetBarrier::new(3, QuorumPolicy::Abort));
        let waiting = spawn_arrivals(&barrier, &[0, 1]);
        wait_until_ready(&barrier, 2);

        barrier.close_session(SessionIndex(2));
        for handle in waiting {
            assert!(matches!(
                handle.join().unwrap(),
                Err(FabricError::SessionClosed(SessionIndex(2)))
            ));
        }
        assert_eq!(barrier.phase(), BarrierPhase::Aborted(SessionIndex(2)));
        assert!(barrier.wait_for_reset(ResetEpoch(0)).is_err());
        assert_eq!(barrier.epoch(), ResetEpoch(0));
    }

    #[test]
    fn exclude_policy_releases_the_remaining_quorum() {
        let barrier = Arc::new(ResetBarrier::new(3, QuorumPolicy::Exclude));
        let waiting = spawn_arrivals(&barrier, &[0, 1]);
        wait_until_ready(&barrier, 2);

        barrier.close_session(SessionIndex(2));
        for handle in waiting {
            assert_eq!(handle.join().unwrap().unwrap(), ResetEpoch(1));
        }
        assert!(matches!(
            barrier.mark_ready(SessionIndex(2)),
            Err(FabricError::SessionClosed(SessionIndex(2)))
        ));
    }

    #[test]
    fn cancelled_wait_gives_up() {
        let barrier = ResetBarrier::new(2, QuorumPolicy::Abort);
        let err = barrier
            .wait_for_reset_or(ResetEpoch(0), &|| true)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::FatalRuntime);
    }

    #[test]
    fn epochs_advance_once_per_cycle() {
        let barrier = ResetBarrier::new(1, QuorumPolicy::Abort);
        for expected in 1..=3 {
            assert_eq!(barrier.arrive(SessionIndex(0)).unwrap(), ResetEpoch(expected));
        }
    }
}
