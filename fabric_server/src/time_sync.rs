// Conservative time synchronization across sessions.
//
// Each session owns a cursor: the last logical time it asked to advance to.
// The authorized time is the minimum cursor over live sessions, and never
// moves backwards. A request for `target` is granted once
// `target <= authorized + lookahead`; until then the caller's thread parks
// on a condvar. With zero lookahead this is strict lockstep: nobody passes T
// until everybody has asked for at least T.
//
// Closing a session removes its cursor from the minimum (so the others can
// move on) and fails its own pending request with `SessionClosed`.
//
// Grants carry a global sequence number. When one recomputation satisfies
// several requests, they are numbered in (target, session index) order.
//
// The bookkeeping lives in `TimeState`, which never blocks; `TimeSync` wraps
// it with the mutex/condvar pair.

use std::sync::{Condvar, Mutex, PoisonError};

use fabric_protocol::{LogicalTime, SessionIndex};
use tracing::debug;

use crate::error::{FabricError, FabricResult};
use crate::lock;

/// A granted advance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Grant {
    pub session: SessionIndex,
    pub time: LogicalTime,
    /// Authorized time when the grant was issued.
    pub authorized: LogicalTime,
    /// Position in the global grant order, starting at 0.
    pub sequence: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Pending {
    Waiting(LogicalTime),
    Granted(Grant),
}

#[derive(Clone, Debug)]
struct Cursor {
    requested: LogicalTime,
    granted: LogicalTime,
    pending: Option<Pending>,
    live: bool,
}

#[derive(Debug)]
struct TimeState {
    cursors: Vec<Cursor>,
    authorized: LogicalTime,
    next_sequence: u64,
    lookahead: u64,
}

impl TimeState {
    fn new(sessions: usize, lookahead: u64) -> Self {
        let cursor = Cursor {
            requested: LogicalTime(0),
            granted: LogicalTime(0),
            pending: None,
            live: true,
        };
        Self {
            cursors: vec![cursor; sessions],
            authorized: LogicalTime(0),
            next_sequence: 0,
            lookahead,
        }
    }

    fn cursor_mut(&mut self, index: SessionIndex) -> FabricResult<&mut Cursor> {
        match self.cursors.get_mut(index.as_usize()) {
            Some(cursor) if cursor.live => Ok(cursor),
            _ => Err(FabricError::SessionClosed(index)),
        }
    }

    /// Record a request without waiting for it.
    fn submit(&mut self, index: SessionIndex, target: LogicalTime) -> FabricResult<()> {
        let cursor = self.cursor_mut(index)?;
        if cursor.pending.is_some() {
            return Err(FabricError::AdvanceInFlight { session: index });
        }
        if target < cursor.granted {
            return Err(FabricError::OutOfOrderTime {
                session: index,
                requested: target,
                granted: cursor.granted,
            });
        }
        cursor.requested = target;
        cursor.pending = Some(Pending::Waiting(target));
        Ok(())
    }

    /// Move the authorized time up to the live minimum and grant whatever is
    /// now inside the window. Returns the number of new grants.
    fn recompute(&mut self) -> usize {
        let floor = self
            .cursors
            .iter()
            .filter(|c| c.live)
            .map(|c| c.requested)
            .min();
        if let Some(floor) = floor {
            self.authorized = self.authorized.max(floor);
        }
        let horizon = self.authorized.saturating_add(self.lookahead);

        let mut ready: Vec<(LogicalTime, usize)> = self
            .cursors
            .iter()
            .enumerate()
            .filter_map(|(i, c)| match c.pending {
                Some(Pending::Waiting(target)) if c.live && target <= horizon => Some((target, i)),
                _ => None,
            })
            .collect();
        ready.sort_unstable();

        for &(target, i) in &ready {
            let grant = Grant {
                session: SessionIndex(i as u32),
                time: target,
                authorized: self.authorized,
                sequence: self.next_sequence,
            };
            self.next_sequence += 1;
            let cursor = &mut self.cursors[i];
            cursor.granted = target;
            cursor.pending = Some(Pending::Granted(grant));
        }
        ready.len()
    }

    /// Collect a finished grant for `index`, if there is one.
    fn take_grant(&mut self, index: SessionIndex) -> Option<Grant> {
        let cursor = self.cursors.get_mut(index.as_usize())?;
        match cursor.pending {
            Some(Pending::Granted(grant)) => {
                cursor.pending = None;
                Some(grant)
            }
            _ => None,
        }
    }

    fn close(&mut self, index: SessionIndex) -> bool {
        match self.cursors.get_mut(index.as_usize()) {
            Some(cursor) if cursor.live => {
                cursor.live = false;
                cursor.pending = None;
                true
            }
            _ => false,
        }
    }

    fn is_live(&self, index: SessionIndex) -> bool {
        self.cursors
            .get(index.as_usize())
            .is_some_and(|c| c.live)
    }
}

/// Time server shared by every session's sync worker.
pub struct TimeSync {
    state: Mutex<TimeState>,
    changed: Condvar,
}

impl TimeSync {
    pub fn new(sessions: usize, lookahead: u64) -> Self {
        Self {
            state: Mutex::new(TimeState::new(sessions, lookahead)),
            changed: Condvar::new(),
        }
    }

    /// Block until `index` may advance to `target`.
    ///
    /// Fails immediately with `OutOfOrderTime` if `target` is behind the
    /// session's last grant, or `AdvanceInFlight` if it already has a pending
    /// request; either way its cursor is left unchanged. Fails with
    /// `SessionClosed` if the session closes before the grant.
    pub fn request_advance(&self, index: SessionIndex, target: LogicalTime) -> FabricResult<Grant> {
        let mut state = lock(&self.state);
        state.submit(index, target)?;
        if state.recompute() > 0 {
            self.changed.notify_all();
        }
        debug!(%index, %target, authorized = %state.authorized, "advance requested");
        loop {
            if let Some(grant) = state.take_grant(index) {
                debug!(%index, time = %grant.time, sequence = grant.sequence, "advance granted");
                return Ok(grant);
            }
            if !state.is_live(index) {
                return Err(FabricError::SessionClosed(index));
            }
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Drop `index` from the minimum and wake its pending request with
    /// `SessionClosed`. Idempotent.
    pub fn close_session(&self, index: SessionIndex) {
        let mut state = lock(&self.state);
        if state.close(index) {
            state.recompute();
            debug!(%index, authorized = %state.authorized, "session left time sync");
            self.changed.notify_all();
        }
    }

    pub fn authorized_time(&self) -> LogicalTime {
        lock(&self.state).authorized
    }

    /// Last time granted to `index`.
    pub fn granted_time(&self, index: SessionIndex) -> Option<LogicalTime> {
        lock(&self.state)
            .cursors
            .get(index.as_usize())
            .map(|c| c.granted)
    }

    /// Number of sessions currently parked in `request_advance`.
    pub fn waiting(&self) -> usize {
        lock(&self.state)
            .cursors
            .iter()
            .filter(|c| matches!(c.pending, Some(Pending::Waiting(_))))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use proptest::prelude::*;

    /// Poll until `n` sessions are parked; avoids racing the spawned threads.
    fn wait_for_waiters(sync: &TimeSync, n: usize) {
        for _ in 0..200 {
            if sync.waiting() == n {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("expected {n} waiters, have {}", sync.waiting());
    }

    #[test]
    fn lockstep_grants_once_everyone_asks() {
        let sync = Arc::new(TimeSync::new(4, 0));
        let handles: Vec<_> = (0..3)
            .map(|i| {
                let sync = Arc::clone(&sync);
                thread::spawn(move || sync.request_advance(SessionIndex(i), LogicalTime(100)))
            })
            .collect();
        wait_for_waiters(&sync, 3);
        assert_eq!(sync.authorized_time(), LogicalTime(0));

        let last = sync
            .request_advance(SessionIndex(3), LogicalTime(100))
            .unwrap();
        assert_eq!(last.time, LogicalTime(100));
        assert_eq!(sync.authorized_time(), LogicalTime(100));

        let mut sequences = vec![last.sequence];
        for handle in handles {
            let grant = handle.join().unwrap().unwrap();
            assert_eq!(grant.time, LogicalTime(100));
            sequences.push(grant.sequence);
        }
        sequences.sort_unstable();
        assert_eq!(sequences, vec![0, 1, 2, 3]);
    }

    #[test]
    fn lookahead_lets_a_session_run_ahead() {
        let sync = TimeSync::new(2, 50);
        let grant = sync
            .request_advance(SessionIndex(0), LogicalTime(50))
            .unwrap();
        assert_eq!(grant.time, LogicalTime(50));
        assert_eq!(grant.authorized, LogicalTime(0));
    }

    #[test]
    fn closing_a_session_fails_its_request_and_frees_the_others() {
        let sync = Arc::new(TimeSync::new(4, 0));
        let waiters: Vec<_> = [0, 1, 2]
            .into_iter()
            .map(|i| {
                let sync = Arc::clone(&sync);
                thread::spawn(move || sync.request_advance(SessionIndex(i), LogicalTime(100)))
            })
            .collect();
        wait_for_waiters(&sync, 3);

        // Session 3 has not asked yet; session 2 leaves mid-request.
        sync.close_session(SessionIndex(2));
        sync.close_session(SessionIndex(2));
        let grant = sync
            .request_advance(SessionIndex(3), LogicalTime(100))
            .unwrap();
        assert_eq!(grant.time, LogicalTime(100));

        let results: Vec<_> = waiters.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert!(matches!(
            results[2],
            Err(FabricError::SessionClosed(SessionIndex(2)))
        ));
        assert!(matches!(
            sync.request_advance(SessionIndex(2), LogicalTime(200)),
            Err(FabricError::SessionClosed(_))
        ));
    }

    #[test]
    fn backwards_request_is_rejected_and_cursor_kept() {
        let sync = TimeSync::new(1, 0);
        sync.request_advance(SessionIndex(0), LogicalTime(100)).unwrap();
        let err = sync
            .request_advance(SessionIndex(0), LogicalTime(40))
            .unwrap_err();
        assert!(matches!(
            err,
            FabricError::OutOfOrderTime {
                requested: LogicalTime(40),
                granted: LogicalTime(100),
                ..
            }
        ));
        assert_eq!(sync.granted_time(SessionIndex(0)), Some(LogicalTime(100)));
        // Re-requesting the granted time is not a regression.
        sync.request_advance(SessionIndex(0), LogicalTime(100)).unwrap();
    }

    #[test]
    fn second_request_while_pending_is_in_flight() {
        let mut state = TimeState::new(2, 0);
        state.submit(SessionIndex(0), LogicalTime(10)).unwrap();
        assert!(matches!(
            state.submit(SessionIndex(0), LogicalTime(20)),
            Err(FabricError::AdvanceInFlight { .. })
        ));
    }

    #[test]
    fn simultaneous_grants_are_ordered_by_target_then_index() {
        let mut state = TimeState::new(3, 100);
        state.submit(SessionIndex(2), LogicalTime(30)).unwrap();
        state.submit(SessionIndex(1), LogicalTime(30)).unwrap();
        state.submit(SessionIndex(0), LogicalTime(60)).unwrap();
        assert_eq!(state.recompute(), 3);
        let order: Vec<_> = [1, 2, 0]
            .into_iter()
            .map(|i| state.take_grant(SessionIndex(i)).unwrap().sequence)
            .collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    proptest! {
        #[test]
        fn authorized_time_never_decreases(
            ops in proptest::collection::vec((0u32..4, 0u64..500, prop::bool::weighted(0.1)), 1..80),
            lookahead in 0u64..50,
        ) {
            let mut state = TimeState::new(4, lookahead);
            let mut last_authorized = LogicalTime(0);
            let mut last_grant = [LogicalTime(0); 4];
            for (session, target, close) in ops {
                let index = SessionIndex(session);
                if close {
                    state.close(index);
                } else if state.submit(index, LogicalTime(target)).is_ok() {
                    prop_assert!(LogicalTime(target) >= last_grant[session as usize]);
                }
                state.recompute();
                prop_assert!(state.authorized >= last_authorized);
                last_authorized = state.authorized;
                for i in 0..4u32 {
                    if let Some(grant) = state.take_grant(SessionIndex(i)) {
                        prop_assert!(grant.time <= state.authorized.saturating_add(lookahead));
                        prop_assert!(grant.time >= last_grant[i as usize]);
                        last_grant[i as usize] = grant.time;
                    }
                }
            }
        }
    }
}
