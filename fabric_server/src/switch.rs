// Software Ethernet switch connecting the session ports.
//
// Port `i` belongs to session `i`. Routing one frame entering on `ingress`:
// 1. RX taps on `ingress` see it (when monitoring is on).
// 2. The destination is resolved through the forwarding table:
//    - broadcast/group address → every registered port except `ingress`;
//    - a known station (configured, or learned when learning is on);
//    - otherwise the ingress port's default link, if it has one;
//    - otherwise `Routing { UnknownDestination }` and the frame is dropped.
//    A frame whose station sits behind `ingress` itself is filtered.
// 3. The frame is written to each destination's conduit, tagged with the
//    ingress port, and that port's TX taps see it after the write.
//
// Nothing is forwarded while the data plane is closed; it opens when the
// reset barrier first releases and closes again at shutdown.
//
// Routing errors stay with the frame that caused them: the port it came in
// on keeps working.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use fabric_protocol::framing::encode;
use fabric_protocol::{EthernetFrame, MacAddress, PortIndex, ServerMessage};
use tracing::{debug, warn};

use crate::conduit::Conduit;
use crate::config::Topology;
use crate::error::{FabricError, FabricResult, RouteFailure};
use crate::lock;
use crate::monitor::{Direction, FrameTap};

/// Static forwarding rules built from a `Topology`.
#[derive(Clone, Debug, Default)]
pub struct ForwardingTable {
    stations: BTreeMap<MacAddress, PortIndex>,
    links: BTreeMap<PortIndex, PortIndex>,
    learning: bool,
}

impl ForwardingTable {
    pub fn from_topology(topology: &Topology) -> Self {
        Self {
            stations: topology.stations.iter().map(|s| (s.mac, s.port)).collect(),
            links: topology.links.iter().map(|l| (l.from, l.to)).collect(),
            learning: topology.learning,
        }
    }

    pub fn station(&self, mac: &MacAddress) -> Option<PortIndex> {
        self.stations.get(mac).copied()
    }

    pub fn link(&self, from: PortIndex) -> Option<PortIndex> {
        self.links.get(&from).copied()
    }
}

/// Where a frame should go, before any conduit is touched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    Flood(Vec<PortIndex>),
    Unicast(PortIndex),
    /// Destination is behind the ingress port.
    Filtered,
}

#[derive(Default)]
struct Port {
    conduit: Option<Arc<dyn Conduit>>,
    rx_taps: Vec<Arc<dyn FrameTap>>,
    tx_taps: Vec<Arc<dyn FrameTap>>,
}

pub struct Switch {
    ports: RwLock<Vec<Port>>,
    table: ForwardingTable,
    learned: Mutex<BTreeMap<MacAddress, PortIndex>>,
    monitoring: bool,
    forwarding: AtomicBool,
}

impl Switch {
    /// A switch with `ports` ports, all down, forwarding closed. Fails if
    /// `topology` names a port the switch does not have.
    pub fn new(ports: usize, topology: &Topology, monitoring: bool) -> FabricResult<Self> {
        topology.validate(ports)?;
        Ok(Self {
            ports: RwLock::new((0..ports).map(|_| Port::default()).collect()),
            table: ForwardingTable::from_topology(topology),
            learned: Mutex::new(BTreeMap::new()),
            monitoring,
            forwarding: AtomicBool::new(false),
        })
    }

    fn read_ports(&self) -> RwLockReadGuard<'_, Vec<Port>> {
        self.ports.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_ports(&self) -> RwLockWriteGuard<'_, Vec<Port>> {
        self.ports.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn port_count(&self) -> usize {
        self.read_ports().len()
    }

    /// Bring `port` up on `conduit`.
    pub fn register_port(&self, port: PortIndex, conduit: Arc<dyn Conduit>) -> FabricResult<()> {
        let mut ports = self.write_ports();
        let slot = ports
            .get_mut(port.as_usize())
            .ok_or_else(|| FabricError::Argument(format!("no {port} on this switch")))?;
        slot.conduit = Some(conduit);
        debug!(%port, "port up");
        Ok(())
    }

    /// Take `port` down. Its taps stay attached.
    pub fn unregister_port(&self, port: PortIndex) {
        if let Some(slot) = self.write_ports().get_mut(port.as_usize())
            && slot.conduit.take().is_some()
        {
            debug!(%port, "port down");
        }
    }

    pub fn is_port_up(&self, port: PortIndex) -> bool {
        self.read_ports()
            .get(port.as_usize())
            .is_some_and(|p| p.conduit.is_some())
    }

    /// Attach `tap` to the RX and TX sides of each port in `ports`.
    pub fn attach_monitor(&self, tap: Arc<dyn FrameTap>, ports: &[PortIndex]) -> FabricResult<()> {
        let mut table = self.write_ports();
        if let Some(bad) = ports.iter().find(|p| p.as_usize() >= table.len()) {
            return Err(FabricError::Argument(format!(
                "cannot tap {bad}: the switch has {} ports",
                table.len()
            )));
        }
        for port in ports {
            let slot = &mut table[port.as_usize()];
            slot.rx_taps.push(Arc::clone(&tap));
            slot.tx_taps.push(Arc::clone(&tap));
        }
        Ok(())
    }

    pub fn set_forwarding(&self, on: bool) {
        self.forwarding.store(on, Ordering::SeqCst);
    }

    pub fn is_forwarding(&self) -> bool {
        self.forwarding.load(Ordering::SeqCst)
    }

    /// Resolve the destination of `frame` entering on `ingress`, without
    /// sending anything.
    pub fn resolve(&self, frame: &EthernetFrame, ingress: PortIndex) -> FabricResult<Route> {
        if frame.destination.is_group() {
            let ports = self.read_ports();
            let targets = (0..ports.len())
                .map(|i| PortIndex(i as u32))
                .filter(|&p| p != ingress && ports[p.as_usize()].conduit.is_some())
                .collect();
            return Ok(Route::Flood(targets));
        }

        let known = self.table.station(&frame.destination).or_else(|| {
            self.table
                .learning
                .then(|| lock(&self.learned).get(&frame.destination).copied())
                .flatten()
        });
        match known {
            Some(port) if port == ingress => Ok(Route::Filtered),
            Some(port) => Ok(Route::Unicast(port)),
            None => self
                .table
                .link(ingress)
                .map(Route::Unicast)
                .ok_or(FabricError::Routing {
                    ingress,
                    destination: frame.destination,
                    reason: RouteFailure::UnknownDestination,
                }),
        }
    }

    /// Forward `frame` entering on `ingress`. Returns the ports it was
    /// delivered to.
    pub fn route(&self, frame: &EthernetFrame, ingress: PortIndex) -> FabricResult<Vec<PortIndex>> {
        if !self.is_forwarding() {
            debug!(%ingress, "data plane closed; frame dropped");
            return Ok(Vec::new());
        }
        if ingress.as_usize() >= self.port_count() {
            return Err(FabricError::Argument(format!("no {ingress} on this switch")));
        }

        if self.monitoring {
            let taps = self.read_ports()[ingress.as_usize()].rx_taps.clone();
            for tap in &taps {
                tap.observe(Direction::Rx, ingress, frame);
            }
        }
        self.learn(frame.source, ingress);

        let targets = match self.resolve(frame, ingress)? {
            Route::Filtered => {
                debug!(%ingress, dst = %frame.destination, "frame filtered");
                return Ok(Vec::new());
            }
            Route::Unicast(port) => vec![port],
            Route::Flood(ports) => ports,
        };
        let flooding = frame.destination.is_group();

        let body = encode(&ServerMessage::Frame {
            ingress,
            frame: frame.clone(),
        })?;

        let mut delivered = Vec::with_capacity(targets.len());
        for port in targets {
            let (conduit, taps) = self
                .read_ports()
                .get(port.as_usize())
                .map(|slot| (slot.conduit.clone(), slot.tx_taps.clone()))
                .unwrap_or_default();
            let sent = match conduit {
                Some(conduit) => conduit.send(&body).is_ok(),
                None => false,
            };
            if !sent {
                if flooding {
                    debug!(%port, "flood skipped a port that went down");
                    continue;
                }
                return Err(FabricError::Routing {
                    ingress,
                    destination: frame.destination,
                    reason: RouteFailure::PortDown(port),
                });
            }
            if self.monitoring {
                for tap in &taps {
                    tap.observe(Direction::Tx, port, frame);
                }
            }
            delivered.push(port);
        }
        debug!(%ingress, dst = %frame.destination, ?delivered, "frame forwarded");
        Ok(delivered)
    }

    fn learn(&self, source: MacAddress, ingress: PortIndex) {
        if !self.table.learning || source.is_group() || self.table.station(&source).is_some() {
            return;
        }
        let previous = lock(&self.learned).insert(source, ingress);
        if previous != Some(ingress) {
            if previous.is_some() {
                warn!(%source, %ingress, "station moved");
            } else {
                debug!(%source, %ingress, "station learned");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conduit::MemoryConduit;
    use crate::config::{Link, Station};
    use crate::monitor::FrameRecorder;
    use fabric_protocol::framing::decode;
    use std::time::Duration;

    fn mac(last: u8) -> MacAddress {
        MacAddress([0x00, 0x10, 0xaa, 0x00, 0x00, last])
    }

    /// A forwarding switch with every port up. Returns the client ends.
    fn switch_with_clients(ports: usize, topology: &Topology) -> (Switch, Vec<MemoryConduit>) {
        let switch = Switch::new(ports, topology, true).unwrap();
        let clients = (0..ports)
            .map(|i| {
                let (server, client) = MemoryConduit::pair(&format!("port{i}"));
                switch
                    .register_port(PortIndex(i as u32), Arc::new(server))
                    .unwrap();
                client
                    .set_read_timeout(Some(Duration::from_millis(50)))
                    .unwrap();
                client
            })
            .collect();
        switch.set_forwarding(true);
        (switch, clients)
    }

    fn received(client: &MemoryConduit) -> Option<(PortIndex, EthernetFrame)> {
        let body = client.receive().ok()?;
        match decode(&body).ok()? {
            ServerMessage::Frame { ingress, frame } => Some((ingress, frame)),
            _ => None,
        }
    }

    #[test]
    fn unicast_reaches_only_the_station_port() {
        let (switch, clients) = switch_with_clients(4, &Topology::default_for(4));
        let frame = EthernetFrame::new(mac(3), mac(1), b"hi".to_vec());
        assert_eq!(switch.route(&frame, PortIndex(0)).unwrap(), vec![PortIndex(2)]);

        assert_eq!(received(&clients[2]), Some((PortIndex(0), frame)));
        assert!(received(&clients[1]).is_none());
        assert!(received(&clients[3]).is_none());
    }

    #[test]
    fn broadcast_floods_every_other_port() {
        let (switch, clients) = switch_with_clients(4, &Topology::default_for(4));
        let frame = EthernetFrame::new(MacAddress::BROADCAST, mac(2), Vec::new());
        let mut delivered = switch.route(&frame, PortIndex(1)).unwrap();
        delivered.sort();
        assert_eq!(delivered, vec![PortIndex(0), PortIndex(2), PortIndex(3)]);
        assert!(received(&clients[1]).is_none());
        assert!(received(&clients[3]).is_some());
    }

    #[test]
    fn unknown_destination_drops_only_that_frame() {
        let (switch, clients) = switch_with_clients(4, &Topology::default_for(4));
        let stray = EthernetFrame::new(mac(0x42), mac(1), Vec::new());
        let err = switch.route(&stray, PortIndex(0)).unwrap_err();
        assert!(matches!(
            err,
            FabricError::Routing {
                ingress: PortIndex(0),
                reason: RouteFailure::UnknownDestination,
                ..
            }
        ));

        let next = EthernetFrame::new(mac(2), mac(1), Vec::new());
        assert_eq!(switch.route(&next, PortIndex(0)).unwrap(), vec![PortIndex(1)]);
        assert!(received(&clients[1]).is_some());
    }

    #[test]
    fn default_link_carries_unknown_destinations() {
        let mut topology = Topology::default_for(2);
        topology.links.push(Link {
            from: PortIndex(0),
            to: PortIndex(1),
        });
        let (switch, clients) = switch_with_clients(2, &topology);
        let frame = EthernetFrame::new(mac(0x77), mac(1), Vec::new());
        assert_eq!(switch.route(&frame, PortIndex(0)).unwrap(), vec![PortIndex(1)]);
        assert!(received(&clients[1]).is_some());
    }

    #[test]
    fn hairpin_frames_are_filtered() {
        let (switch, clients) = switch_with_clients(2, &Topology::default_for(2));
        let frame = EthernetFrame::new(mac(1), mac(1), Vec::new());
        assert!(switch.route(&frame, PortIndex(0)).unwrap().is_empty());
        assert!(received(&clients[0]).is_none());
    }

    #[test]
    fn down_port_is_a_routing_error() {
        let (switch, _clients) = switch_with_clients(4, &Topology::default_for(4));
        switch.unregister_port(PortIndex(3));
        let frame = EthernetFrame::new(mac(4), mac(1), Vec::new());
        let err = switch.route(&frame, PortIndex(0)).unwrap_err();
        assert!(matches!(
            err,
            FabricError::Routing {
                reason: RouteFailure::PortDown(PortIndex(3)),
                ..
            }
        ));
    }

    #[test]
    fn closed_data_plane_forwards_nothing() {
        let (switch, clients) = switch_with_clients(2, &Topology::default_for(2));
        switch.set_forwarding(false);
        let frame = EthernetFrame::new(mac(2), mac(1), Vec::new());
        assert!(switch.route(&frame, PortIndex(0)).unwrap().is_empty());
        assert!(received(&clients[1]).is_none());
    }

    #[test]
    fn rx_tap_fires_before_tx_tap() {
        let (switch, _clients) = switch_with_clients(2, &Topology::default_for(2));
        let recorder = Arc::new(FrameRecorder::new());
        switch
            .attach_monitor(recorder.clone(), &[PortIndex(0), PortIndex(1)])
            .unwrap();
        let frame = EthernetFrame::new(mac(2), mac(1), b"x".to_vec());
        switch.route(&frame, PortIndex(0)).unwrap();

        let seen: Vec<_> = recorder
            .observations()
            .into_iter()
            .map(|o| (o.direction, o.port))
            .collect();
        assert_eq!(
            seen,
            vec![(Direction::Rx, PortIndex(0)), (Direction::Tx, PortIndex(1))]
        );
    }

    #[test]
    fn taps_stay_silent_with_monitoring_off() {
        let switch = Switch::new(2, &Topology::default_for(2), false).unwrap();
        let (server, _client) = MemoryConduit::pair("p1");
        switch.register_port(PortIndex(1), Arc::new(server)).unwrap();
        let recorder = Arc::new(FrameRecorder::new());
        switch
            .attach_monitor(recorder.clone(), &[PortIndex(0), PortIndex(1)])
            .unwrap();
        switch.set_forwarding(true);

        let frame = EthernetFrame::new(mac(2), mac(1), Vec::new());
        assert_eq!(switch.route(&frame, PortIndex(0)).unwrap(), vec![PortIndex(1)]);
        assert!(recorder.is_empty());
    }

    #[test]
    fn zero_taps_still_forward() {
        let (switch, clients) = switch_with_clients(2, &Topology::default_for(2));
        let frame = EthernetFrame::new(mac(2), mac(1), Vec::new());
        switch.route(&frame, PortIndex(0)).unwrap();
        assert!(received(&clients[1]).is_some());
    }

    #[test]
    fn learning_switch_remembers_sources() {
        let topology = Topology {
            stations: vec![Station {
                port: PortIndex(0),
                mac: mac(1),
            }],
            links: Vec::new(),
            learning: true,
        };
        let (switch, clients) = switch_with_clients(2, &topology);
        let roaming = mac(0x20);

        // Unknown until port 1 speaks.
        let to_roaming = EthernetFrame::new(roaming, mac(1), Vec::new());
        assert!(switch.route(&to_roaming, PortIndex(0)).is_err());

        let hello = EthernetFrame::new(mac(1), roaming, Vec::new());
        switch.route(&hello, PortIndex(1)).unwrap();
        assert!(received(&clients[0]).is_some());

        assert_eq!(switch.route(&to_roaming, PortIndex(0)).unwrap(), vec![PortIndex(1)]);
    }

    #[test]
    fn tapping_a_missing_port_is_an_argument_error() {
        let switch = Switch::new(2, &Topology::default_for(2), true).unwrap();
        let err = switch
            .attach_monitor(Arc::new(FrameRecorder::new()), &[PortIndex(5)])
            .unwrap_err();
        assert!(matches!(err, FabricError::Argument(_)));
    }

    #[test]
    fn station_beyond_the_last_port_is_refused() {
        let mut topology = Topology::default_for(2);
        topology.stations.push(Station {
            port: PortIndex(5),
            mac: mac(0x50),
        });
        let err = Switch::new(2, &topology, true).err().unwrap();
        assert!(matches!(err, FabricError::Argument(_)));
    }

    #[test]
    fn link_beyond_the_last_port_is_refused() {
        let mut topology = Topology::default_for(2);
        topology.links.push(Link {
            from: PortIndex(0),
            to: PortIndex(9),
        });
        assert!(Switch::new(2, &topology, true).is_err());
    }
}
