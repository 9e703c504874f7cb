// fabric_server: coordination server for a fabric of simulation clients.
//
// The server accepts one connection per client, holds every client at reset
// until all of them are ready, keeps their logical clocks within a lookahead
// window of each other, and switches Ethernet frames between them while taps
// watch every port. An external command processor drives the run phase.
//
// Module overview:
// - `conduit.rs`:       `Conduit` trait (send/receive/close) and its TCP,
//                       Unix-domain and in-memory implementations; endpoint
//                       naming and listeners.
// - `session.rs`:       Session table and connection states; the Hello
//                       handshake.
// - `time_sync.rs`:     Per-session advance requests gated by the minimum
//                       cursor plus lookahead.
// - `reset_barrier.rs`: Epoch barrier releasing every session at once.
// - `switch.rs`:        N-port software switch with a table-driven forwarding
//                       policy and per-port RX/TX taps.
// - `monitor.rs`:       `FrameTap` trait and the provided taps.
// - `control.rs`:       Per-session config plane, the `CommandProcessor`
//                       seam, and the scripted command processor.
// - `fabric.rs`:        Wires the above together; per-session reader and sync
//                       worker threads.
// - `coordinator.rs`:   Phase sequence listen → await reset → run → shutdown.
// - `client.rs`:        Blocking client for the fabric protocol.
// - `config.rs`, `error.rs`: `FabricConfig`/`Topology` and `FabricError`.
//
// Concurrency is plain `std::thread` + `Mutex`/`Condvar` + `mpsc`. Every
// blocking wait (accept, reset, time advance) parks only the thread that
// serves that session.

pub mod client;
pub mod conduit;
pub mod config;
pub mod control;
pub mod coordinator;
pub mod error;
pub mod fabric;
pub mod monitor;
pub mod reset_barrier;
pub mod session;
pub mod switch;
pub mod time_sync;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use client::{ClientError, FabricClient};
pub use conduit::{Conduit, Endpoint, MemoryConduit};
pub use config::{Domain, FabricConfig, QuorumPolicy, Topology};
pub use control::{CommandProcessor, ControlPlane, RunContext, ScriptedProcessor, SimControl};
pub use coordinator::{Coordinator, Phase, RunOutcome};
pub use error::{Diagnostic, ErrorKind, FabricError, FabricResult, Severity};
pub use fabric::Fabric;
pub use monitor::{Direction, FrameLog, FrameRecorder, FrameTap, TrafficMonitor};
pub use reset_barrier::ResetBarrier;
pub use session::SessionState;
pub use switch::Switch;
pub use time_sync::{Grant, TimeSync};

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
