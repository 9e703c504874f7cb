// Test-only harness for multi-client fabric scenarios.
//
// `TestFabric` runs a real `Coordinator` on its own thread with a scripted
// command processor, and `TestNode` wraps a real `FabricClient` with the
// station MAC its port owns in the default topology. Everything goes over
// real sockets; the only test-specific code is the blocking wrappers that
// panic on failure instead of returning errors.
//
// See also: `tests/full_pipeline.rs` for the scenarios themselves.

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use fabric_protocol::{EthernetFrame, LogicalTime, MacAddress, PortIndex, ResetEpoch};
use fabric_server::{
    ClientError, Coordinator, Domain, Endpoint, FabricClient, FabricConfig, FabricResult, Phase,
    QuorumPolicy, RunOutcome, ScriptedProcessor, SimControl, Topology,
};
use tempfile::TempDir;

/// Timeout for every blocking client call.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// How the coordinator's run ended, and in which phase if it failed.
pub struct RunReport {
    pub result: FabricResult<RunOutcome>,
    pub failed_in: Option<Phase>,
}

/// A coordinator running on a background thread.
pub struct TestFabric {
    endpoints: Vec<Endpoint>,
    topology: Topology,
    stop: Arc<AtomicBool>,
    server: Option<JoinHandle<RunReport>>,
    _socket_dir: Option<TempDir>,
}

impl TestFabric {
    /// `sessions` TCP endpoints on ephemeral ports, driven by `script`.
    pub fn networked(sessions: usize, script: &str) -> Self {
        Self::start(
            FabricConfig {
                domain: Domain::Networked,
                base_port: 0,
                ..Self::base_config(sessions)
            },
            script,
            None,
        )
    }

    /// Unix-domain endpoints in a private temp dir.
    #[cfg(unix)]
    pub fn local(sessions: usize, script: &str) -> Self {
        let dir = tempfile::tempdir().expect("socket dir");
        let config = FabricConfig {
            domain: Domain::Local,
            socket_dir: dir.path().to_path_buf(),
            ..Self::base_config(sessions)
        };
        Self::start(config, script, Some(dir))
    }

    /// Networked fabric with an explicit quorum policy.
    pub fn with_quorum(sessions: usize, quorum: QuorumPolicy, script: &str) -> Self {
        Self::start(
            FabricConfig {
                domain: Domain::Networked,
                base_port: 0,
                quorum,
                ..Self::base_config(sessions)
            },
            script,
            None,
        )
    }

    fn base_config(sessions: usize) -> FabricConfig {
        FabricConfig {
            session_count: sessions,
            accept_timeout: Some(CLIENT_TIMEOUT),
            ..FabricConfig::default()
        }
    }

    /// Bind every endpoint, then hand the coordinator to a background
    /// thread. Endpoints are bound before this returns, so clients may
    /// connect straight away.
    pub fn start(config: FabricConfig, script: &str, socket_dir: Option<TempDir>) -> Self {
        let topology = config.topology();
        let mut coordinator = Coordinator::new(config).expect("coordinator");
        let endpoints = coordinator.listen().expect("listen");
        let stop = coordinator.stop_handle();
        let script = script.to_owned();
        let server = thread::Builder::new()
            .name("test-coordinator".into())
            .spawn(move || {
                let mut processor = ScriptedProcessor::new(Cursor::new(script));
                let result = coordinator.run(&mut processor);
                RunReport {
                    result,
                    failed_in: coordinator.failed_in(),
                }
            })
            .expect("spawn coordinator");
        Self {
            endpoints,
            topology,
            stop,
            server: Some(server),
            _socket_dir: socket_dir,
        }
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Station MAC of `port` in the fabric's forwarding table.
    pub fn mac(&self, port: usize) -> MacAddress {
        self.topology
            .stations
            .iter()
            .find(|s| s.port.as_usize() == port)
            .map(|s| s.mac)
            .expect("no station on that port")
    }

    /// Connect one client to session `index`.
    pub fn connect(&self, index: usize, name: &str) -> TestNode {
        TestNode::connect(&self.endpoints[index], name, self.mac(index))
    }

    /// Connect a client to every session, in index order.
    pub fn connect_all(&self) -> Vec<TestNode> {
        (0..self.endpoints.len())
            .map(|i| self.connect(i, &format!("node-{i}")))
            .collect()
    }

    /// Ask the coordinator to stop, as a signal would.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Wait for the coordinator's run to end.
    pub fn join(mut self) -> RunReport {
        self.server
            .take()
            .expect("joined twice")
            .join()
            .expect("coordinator thread panicked")
    }
}

impl Drop for TestFabric {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            self.stop.store(true, Ordering::SeqCst);
            let _ = server.join();
        }
    }
}

/// A simulation client stand-in.
pub struct TestNode {
    client: FabricClient,
    pub mac: MacAddress,
}

impl TestNode {
    pub fn connect(endpoint: &Endpoint, name: &str, mac: MacAddress) -> Self {
        let mut client = FabricClient::connect(endpoint, name).expect("connect");
        client.set_timeout(CLIENT_TIMEOUT);
        Self { client, mac }
    }

    pub fn port(&self) -> PortIndex {
        self.client.session().port()
    }

    pub fn reset(&mut self) -> ResetEpoch {
        self.client.wait_for_reset().expect("reset")
    }

    /// Report ready, returning whatever the barrier said.
    pub fn try_reset(&mut self) -> Result<ResetEpoch, ClientError> {
        self.client.wait_for_reset()
    }

    pub fn advance(&mut self, ns: u64) -> LogicalTime {
        self.client.advance_to(LogicalTime(ns)).expect("advance")
    }

    pub fn try_advance(&mut self, ns: u64) -> Result<LogicalTime, ClientError> {
        self.client.advance_to(LogicalTime(ns))
    }

    /// Send `payload` to `destination` from this node's station address.
    pub fn send_to(&self, destination: MacAddress, payload: &[u8]) {
        let frame = EthernetFrame::new(destination, self.mac, payload.to_vec());
        self.client.send_frame(frame).expect("send frame");
    }

    /// Next frame delivered here: (ingress port, payload).
    pub fn recv(&mut self) -> (PortIndex, Vec<u8>) {
        let (ingress, frame) = self.client.recv_frame().expect("receive frame");
        (ingress, frame.payload)
    }

    pub fn sim_control(&mut self) -> SimControl {
        self.client.recv_sim_control().expect("sim control")
    }

    pub fn client(&mut self) -> &mut FabricClient {
        &mut self.client
    }

    pub fn disconnect(&mut self) {
        self.client.disconnect();
    }
}
