// Coordinator: owns the fabric and walks it through its phases.
//
//   Setup → Listen → Accept → AwaitReset → Run → Shutdown → Finished
//
// - Listen binds one endpoint per session. If any bind fails, the ones
//   already bound are dropped (which unlinks their socket files) and the run
//   fails with `Bind`.
// - Accept waits for every session's client in parallel, one scoped thread
//   per listener, and handshakes each. A failure stops the other accepts;
//   sessions that did connect stay connected until shutdown.
// - AwaitReset blocks until the reset barrier releases epoch 1.
// - Run hands control to the `CommandProcessor`.
// - Shutdown always runs, whatever the earlier phases did: close the data
//   and config planes, disconnect every session in index order, join every
//   session thread.
//
// Errors are not caught anywhere below `run`. The first one ends the phase
// sequence, is logged once, and is returned to the caller.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

use fabric_protocol::{LogicalTime, ResetEpoch, SessionIndex};
use tracing::{error, info, warn};

use crate::conduit::{Endpoint, SessionListener};
use crate::config::FabricConfig;
use crate::control::{CommandProcessor, RunContext};
use crate::error::{FabricError, FabricResult};
use crate::fabric::{Fabric, SessionThreads};
use crate::session;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Setup,
    Listen,
    Accept,
    AwaitReset,
    Run,
    Shutdown,
    Finished,
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Self::Setup => "setup",
            Self::Listen => "listen",
            Self::Accept => "accept",
            Self::AwaitReset => "await-reset",
            Self::Run => "run",
            Self::Shutdown => "shutdown",
            Self::Finished => "finished",
        }
    }
}

/// How a completed run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunOutcome {
    /// The command processor saw an explicit exit command.
    pub exit_requested: bool,
    pub epoch: ResetEpoch,
    pub authorized: LogicalTime,
}

pub struct Coordinator {
    config: FabricConfig,
    fabric: Arc<Fabric>,
    listeners: Vec<SessionListener>,
    threads: Vec<SessionThreads>,
    stop: Arc<AtomicBool>,
    phase: Phase,
    failed_in: Option<Phase>,
}

impl Coordinator {
    pub fn new(config: FabricConfig) -> FabricResult<Self> {
        config.validate()?;
        let fabric = Fabric::new(&config)?;
        Ok(Self {
            config,
            fabric,
            listeners: Vec::new(),
            threads: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
            phase: Phase::Setup,
            failed_in: None,
        })
    }

    /// Flag that, once set, makes every blocking phase give up. Signal
    /// handlers set it.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn fabric(&self) -> &Arc<Fabric> {
        &self.fabric
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Phase the last failure happened in.
    pub fn failed_in(&self) -> Option<Phase> {
        self.failed_in
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Bind every session endpoint. Returns them in session order, with
    /// OS-assigned ports filled in. Calling it again returns the same
    /// endpoints.
    pub fn listen(&mut self) -> FabricResult<Vec<Endpoint>> {
        if self.listeners.is_empty() {
            self.phase = Phase::Listen;
            for i in 0..self.config.session_count {
                let index = SessionIndex(i as u32);
                let endpoint = Endpoint::for_session(&self.config, index);
                match SessionListener::bind(index, &endpoint) {
                    Ok(listener) => {
                        self.fabric.sessions().set_listening(index);
                        self.listeners.push(listener);
                    }
                    Err(e) => {
                        self.drop_listeners();
                        return Err(e);
                    }
                }
            }
        }
        Ok(self.endpoints())
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.listeners.iter().map(|l| l.endpoint().clone()).collect()
    }

    fn drop_listeners(&mut self) {
        for listener in self.listeners.drain(..) {
            self.fabric.sessions().stop_listening(listener.index());
        }
    }

    /// Wait for a client on every endpoint and attach it.
    fn accept_all(&mut self) -> FabricResult<()> {
        self.phase = Phase::Accept;
        let deadline = self.config.accept_timeout.map(|t| Instant::now() + t);
        let greeting = self.fabric.greeting();
        let failed = AtomicBool::new(false);
        let stop = &self.stop;
        let cancelled = || failed.load(Ordering::SeqCst) || stop.load(Ordering::SeqCst);

        info!(sessions = self.listeners.len(), "waiting for clients");
        let results: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = self
                .listeners
                .iter()
                .map(|listener| {
                    let failed = &failed;
                    let cancelled = &cancelled;
                    scope.spawn(move || {
                        let index = listener.index();
                        let result = listener.accept(deadline, cancelled).and_then(|conduit| {
                            let name = session::handshake(conduit.as_ref(), index, greeting)?;
                            Ok((name, conduit))
                        });
                        // The first failure is the cause; later ones were cancelled by it.
                        let cause = result.is_err() && !failed.swap(true, Ordering::SeqCst);
                        (index, result, cause)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| {
                            (
                                SessionIndex(u32::MAX),
                                Err(FabricError::fatal("accept thread panicked")),
                                true,
                            )
                        })
                })
                .collect()
        });
        self.drop_listeners();

        let mut cause = None;
        let mut other = None;
        for (index, result, is_cause) in results {
            let attached =
                result.and_then(|(name, conduit)| self.fabric.attach(index, name, conduit));
            match attached {
                Ok(threads) => self.threads.push(threads),
                Err(e) if is_cause => cause = Some(e),
                Err(e) => {
                    warn!(%index, error = %e, "session not attached");
                    other.get_or_insert(e);
                }
            }
        }
        match cause.or(other) {
            Some(e) => Err(e),
            None if self.stopping() => Err(FabricError::fatal("stopped while accepting clients")),
            None => Ok(()),
        }
    }

    fn await_reset(&mut self) -> FabricResult<ResetEpoch> {
        self.phase = Phase::AwaitReset;
        info!("all clients connected; waiting for reset");
        let epoch = self
            .fabric
            .barrier()
            .wait_for_reset_or(ResetEpoch(0), &|| self.stopping())?;
        info!(%epoch, "clients out of reset");
        Ok(epoch)
    }

    fn run_phases(&mut self, processor: &mut dyn CommandProcessor) -> FabricResult<RunOutcome> {
        self.listen()?;
        self.accept_all()?;
        let epoch = self.await_reset()?;

        self.phase = Phase::Run;
        let ctx = RunContext::new(&self.fabric, &self.stop);
        let exit_requested = processor.run(&ctx)?;
        Ok(RunOutcome {
            exit_requested,
            epoch,
            authorized: self.fabric.time_sync().authorized_time(),
        })
    }

    /// Run every phase with `processor` driving the run phase. Shutdown
    /// happens before this returns, success or not.
    pub fn run(&mut self, processor: &mut dyn CommandProcessor) -> FabricResult<RunOutcome> {
        let result = self.run_phases(processor);
        if let Err(e) = &result {
            self.failed_in = Some(self.phase);
            error!(phase = self.phase.name(), kind = %e.kind(), error = %e, "run failed");
        }
        self.shutdown();
        result
    }

    /// Close the planes, disconnect every session, join every session
    /// thread. Idempotent.
    pub fn shutdown(&mut self) {
        if self.phase == Phase::Finished {
            return;
        }
        self.phase = Phase::Shutdown;
        info!("shutting down");
        self.fabric.close_planes();
        self.drop_listeners();
        for i in 0..self.config.session_count {
            let index = SessionIndex(i as u32);
            if let Err(e) = self.fabric.disconnect(index) {
                warn!(%index, error = %e, "disconnect failed");
            }
        }
        for threads in self.threads.drain(..) {
            threads.join();
        }
        self.phase = Phase::Finished;
        info!("shutdown complete");
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::FabricClient;
    use crate::config::Domain;
    use crate::control::ScriptedProcessor;
    use crate::error::ErrorKind;
    use crate::session::SessionState;
    use std::io::Cursor;
    use std::time::Duration;

    fn networked(sessions: usize) -> FabricConfig {
        FabricConfig {
            domain: Domain::Networked,
            base_port: 0,
            session_count: sessions,
            accept_timeout: Some(Duration::from_secs(10)),
            ..FabricConfig::default()
        }
    }

    #[test]
    fn full_run_with_scripted_exit() {
        let mut coordinator = Coordinator::new(networked(2)).unwrap();
        let endpoints = coordinator.listen().unwrap();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(coordinator.listen().unwrap(), endpoints);

        let clients: Vec<_> = endpoints
            .into_iter()
            .enumerate()
            .map(|(i, endpoint)| {
                thread::spawn(move || {
                    let mut client =
                        FabricClient::connect(&endpoint, &format!("node-{i}")).unwrap();
                    client.set_timeout(Duration::from_secs(10));
                    let epoch = client.wait_for_reset().unwrap();
                    let time = client.advance_to(LogicalTime(100)).unwrap();
                    client.disconnect();
                    (epoch, time)
                })
            })
            .collect();

        let mut processor = ScriptedProcessor::new(Cursor::new("wait-clients\nexit\n"));
        let outcome = coordinator.run(&mut processor).unwrap();
        assert!(outcome.exit_requested);
        assert_eq!(outcome.epoch, ResetEpoch(1));
        assert_eq!(outcome.authorized, LogicalTime(100));

        for client in clients {
            assert_eq!(client.join().unwrap(), (ResetEpoch(1), LogicalTime(100)));
        }
        assert_eq!(coordinator.phase(), Phase::Finished);
        assert_eq!(
            coordinator.fabric().session_state(SessionIndex(0)),
            SessionState::Disconnected
        );
    }

    #[test]
    fn end_of_input_is_not_an_exit_request() {
        let mut coordinator = Coordinator::new(networked(1)).unwrap();
        let endpoint = coordinator.listen().unwrap().remove(0);
        let client = thread::spawn(move || {
            let mut client = FabricClient::connect(&endpoint, "solo").unwrap();
            client.set_timeout(Duration::from_secs(10));
            // The run may end before the release notice is written; either
            // way the session ends in a shutdown.
            let _ = client.wait_for_reset();
            client.recv_frame().err()
        });
        let outcome = coordinator
            .run(&mut ScriptedProcessor::new(Cursor::new("status\n")))
            .unwrap();
        assert!(!outcome.exit_requested);
        assert!(matches!(
            client.join().unwrap(),
            Some(crate::client::ClientError::Shutdown)
        ));
    }

    #[test]
    fn missing_client_times_out_as_connect_error() {
        let mut config = networked(2);
        config.accept_timeout = Some(Duration::from_millis(200));
        let mut coordinator = Coordinator::new(config).unwrap();
        let endpoint = coordinator.listen().unwrap().remove(0);
        let client = thread::spawn(move || {
            let mut client = FabricClient::connect(&endpoint, "lonely").unwrap();
            client.set_timeout(Duration::from_secs(10));
            client.await_reset().err()
        });

        let err = coordinator
            .run(&mut ScriptedProcessor::new(Cursor::new("exit\n")))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connect);
        assert_eq!(coordinator.failed_in(), Some(Phase::Accept));
        // The client that did connect is shut down, not left hanging.
        assert!(client.join().unwrap().is_some());
    }

    #[test]
    fn occupied_port_is_a_bind_error() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = blocker.local_addr().unwrap().port();
        let config = FabricConfig {
            domain: Domain::Networked,
            base_port: port,
            session_count: 1,
            ..FabricConfig::default()
        };
        let mut coordinator = Coordinator::new(config).unwrap();
        let err = coordinator.listen().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Bind);
        assert_eq!(
            coordinator.fabric().session_state(SessionIndex(0)),
            SessionState::Disconnected
        );
    }

    #[test]
    fn stop_flag_ends_the_accept_phase() {
        let mut config = networked(1);
        config.accept_timeout = None;
        let mut coordinator = Coordinator::new(config).unwrap();
        let stop = coordinator.stop_handle();
        let setter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            stop.store(true, Ordering::SeqCst);
        });
        let err = coordinator
            .run(&mut ScriptedProcessor::new(Cursor::new("")))
            .unwrap_err();
        setter.join().unwrap();
        assert!(!err.is_recoverable());
        assert_eq!(coordinator.phase(), Phase::Finished);
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let config = FabricConfig {
            session_count: 0,
            ..FabricConfig::default()
        };
        assert!(matches!(
            Coordinator::new(config),
            Err(FabricError::Argument(_))
        ));
    }
}
