//! The controller end of every switch connection.
//!
//! `DeviceController` owns the connections, runs the OpenFlow handshake, reassembles
//! stats replies, keeps one `OfSyncFlowTable` per switch and hands what happens to the
//! registered applications as `DeviceControllerEvent`s.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::Clock;
use crate::config::ControllerConfig;
use crate::event::EventResult;
use crate::flow_table::{FlowTableModification, TableEntry};
use crate::match_spec::MatchSpec;
use crate::message::*;
use crate::ofp_connection::{Connection, ConnectionError, ConnectionId, ConnectionState, DeviceId};
use crate::ofp_header::Xid;
use crate::ofp_transport::{DeferredSender, Transport};
use crate::openflow0x01::StatsRespBody0x01;
use crate::sync_table::{OfSyncFlowTable, SwitchSender};

#[derive(Clone, Debug, PartialEq)]
pub enum DeviceControllerEvent {
    ConnectionUp(DeviceId, SwitchFeatures),
    ConnectionDown(DeviceId),
    PacketIn(DeviceId, PacketIn),
    FlowRemoved(DeviceId, FlowRemoved),
    PortStatus(DeviceId, PortStatus),
    /// A barrier reply that no flow table was waiting for.
    BarrierIn(DeviceId, Xid),
    ErrorIn(DeviceId, Xid, Error),
    SwitchDescReceived(DeviceId, Xid, SwitchDesc),
    FlowStatsReceived(DeviceId, Xid, Vec<FlowStats>),
    AggregateStatsReceived(DeviceId, Xid, AggregateStats),
    TableStatsReceived(DeviceId, Xid, Vec<TableStats>),
    PortStatsReceived(DeviceId, Xid, Vec<PortStats>),
    QueueStatsReceived(DeviceId, Xid, Vec<QueueStats>),
    FlowTableModification(DeviceId, FlowTableModification),
}

#[derive(Debug, Fail)]
pub enum ControllerError {
    #[fail(display = "Switch {} is not connected", dpid)]
    NotConnected { dpid: DeviceId },
    #[fail(display = "Switch {}: {}", dpid, error)]
    Connection { dpid: DeviceId, error: ConnectionError },
}

/// What applications may do while handling an event.
pub trait ControllerContext {
    /// Send `message` to `dpid` under a fresh xid, which is returned.
    fn send_message(&mut self, dpid: DeviceId, message: Message) -> Result<Xid, ControllerError>;

    fn install_flow(&mut self, dpid: DeviceId, entry: TableEntry) -> Result<(), ControllerError>;

    fn remove_flow_strict(
        &mut self,
        dpid: DeviceId,
        entry: TableEntry,
    ) -> Result<(), ControllerError>;

    fn remove_flows(
        &mut self,
        dpid: DeviceId,
        match_spec: MatchSpec,
    ) -> Result<(), ControllerError>;

    fn flow_table(&self, dpid: DeviceId) -> Option<&OfSyncFlowTable>;

    fn features(&self, dpid: DeviceId) -> Option<&SwitchFeatures>;

    fn connected_devices(&self) -> Vec<DeviceId>;
}

pub trait DeviceControllerApp {
    fn event(
        &mut self,
        event: &DeviceControllerEvent,
        ctx: &mut dyn ControllerContext,
    ) -> EventResult;

    fn start(&mut self) {
        // Default implementation is empty
    }

    /// Called on every controller tick.
    fn tick(&mut self, _ctx: &mut dyn ControllerContext) {}
}

/// A switch end that is not connected: operations are queued and nothing is sent.
struct Detached;

impl SwitchSender for Detached {
    fn connection(&self) -> Option<ConnectionId> {
        None
    }

    fn next_xid(&mut self) -> Xid {
        0
    }

    fn send(&mut self, _xid: Xid, _message: Message) -> bool {
        false
    }
}

struct Device {
    connection: Connection,
    last_seen: Duration,
    echo_pending: bool,
}

type ModificationQueue = Arc<Mutex<Vec<(DeviceId, FlowTableModification)>>>;

struct Devices {
    connections: HashMap<ConnectionId, Device>,
    by_dpid: HashMap<DeviceId, ConnectionId>,
    features: HashMap<DeviceId, SwitchFeatures>,
    tables: HashMap<DeviceId, OfSyncFlowTable>,
    modifications: ModificationQueue,
    clock: Arc<dyn Clock>,
    sync_flow_tables: bool,
    barrier_timeout: Option<Duration>,
}

impl Devices {
    fn new(config: &ControllerConfig, clock: Arc<dyn Clock>) -> Devices {
        Devices {
            connections: HashMap::new(),
            by_dpid: HashMap::new(),
            features: HashMap::new(),
            tables: HashMap::new(),
            modifications: Arc::new(Mutex::new(vec![])),
            clock,
            sync_flow_tables: config.sync_flow_tables,
            barrier_timeout: config.barrier_timeout,
        }
    }

    fn connection_of(&mut self, dpid: DeviceId) -> Option<&mut Connection> {
        let id = self.by_dpid.get(&dpid)?;
        self.connections.get_mut(id).map(|d| &mut d.connection)
    }

    fn new_table(&self, dpid: DeviceId) -> OfSyncFlowTable {
        let mut table = OfSyncFlowTable::new(self.clock.clone(), self.barrier_timeout);
        let queue = self.modifications.clone();
        table.add_listener(move |modification| {
            let mut queue = match queue.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            queue.push((dpid, modification.clone()));
            EventResult::Continue
        });
        table
    }

    fn take_modifications(&self) -> Vec<(DeviceId, FlowTableModification)> {
        let mut queue = match self.modifications.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        std::mem::replace(&mut *queue, vec![])
    }

    /// Run `op` on the mirrored table of `dpid`, against its connection when there is one.
    fn with_table<F>(&mut self, dpid: DeviceId, op: F)
    where
        F: FnOnce(&mut OfSyncFlowTable, &mut dyn SwitchSender),
    {
        if !self.tables.contains_key(&dpid) {
            let table = self.new_table(dpid);
            self.tables.insert(dpid, table);
        }
        let table = match self.tables.get_mut(&dpid) {
            Some(table) => table,
            None => return,
        };
        let connections = &mut self.connections;
        let connection = self
            .by_dpid
            .get(&dpid)
            .and_then(|id| connections.get_mut(id))
            .map(|d| &mut d.connection);
        match connection {
            Some(connection) => op(table, connection),
            None => op(table, &mut Detached),
        }
    }

    /// Send a flow mod directly, bypassing any mirrored table.
    fn send_flow_mod(&mut self, dpid: DeviceId, flow_mod: FlowMod) -> Result<(), ControllerError> {
        self.send_message(dpid, Message::FlowMod(flow_mod)).map(|_| ())
    }
}

impl ControllerContext for Devices {
    fn send_message(&mut self, dpid: DeviceId, message: Message) -> Result<Xid, ControllerError> {
        let connection = self.connection_of(dpid).ok_or(ControllerError::NotConnected { dpid })?;
        let xid = connection.next_xid();
        connection
            .send(xid, &message)
            .map_err(|error| ControllerError::Connection { dpid, error })?;
        Ok(xid)
    }

    fn install_flow(&mut self, dpid: DeviceId, entry: TableEntry) -> Result<(), ControllerError> {
        if self.sync_flow_tables {
            self.with_table(dpid, |table, sender| table.install(sender, entry));
            Ok(())
        } else {
            self.send_flow_mod(dpid, entry.to_flow_mod(FlowModCmd::AddFlow))
        }
    }

    fn remove_flow_strict(
        &mut self,
        dpid: DeviceId,
        entry: TableEntry,
    ) -> Result<(), ControllerError> {
        if self.sync_flow_tables {
            self.with_table(dpid, |table, sender| table.remove_strict(sender, entry));
            Ok(())
        } else {
            let flow_mod = FlowMod {
                actions: vec![],
                ..entry.to_flow_mod(FlowModCmd::DeleteStrictFlow)
            };
            self.send_flow_mod(dpid, flow_mod)
        }
    }

    fn remove_flows(
        &mut self,
        dpid: DeviceId,
        match_spec: MatchSpec,
    ) -> Result<(), ControllerError> {
        if self.sync_flow_tables {
            self.with_table(dpid, |table, sender| table.remove_with_wildcards(sender, match_spec));
            Ok(())
        } else {
            self.send_flow_mod(dpid, FlowMod::new(FlowModCmd::DeleteFlow, match_spec, 0))
        }
    }

    fn flow_table(&self, dpid: DeviceId) -> Option<&OfSyncFlowTable> {
        self.tables.get(&dpid)
    }

    fn features(&self, dpid: DeviceId) -> Option<&SwitchFeatures> {
        self.features.get(&dpid)
    }

    fn connected_devices(&self) -> Vec<DeviceId> {
        let mut devices: Vec<DeviceId> = self.by_dpid.keys().cloned().collect();
        devices.sort();
        devices
    }
}

pub struct DeviceController {
    config: ControllerConfig,
    clock: Arc<dyn Clock>,
    sender: Arc<DeferredSender>,
    devices: Devices,
    apps: Vec<Box<dyn DeviceControllerApp + Send>>,
    next_connection: u64,
}

impl DeviceController {
    pub fn new(config: ControllerConfig, clock: Arc<dyn Clock>) -> io::Result<DeviceController> {
        let sender = Arc::new(DeferredSender::new()?);
        let devices = Devices::new(&config, clock.clone());
        Ok(DeviceController {
            config,
            clock,
            sender,
            devices,
            apps: Vec::new(),
            next_connection: 1,
        })
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn register_app(&mut self, app: Box<dyn DeviceControllerApp + Send>) {
        self.apps.push(app);
    }

    pub fn start(&mut self) {
        for app in self.apps.iter_mut() {
            app.start();
        }
    }

    /// Take over a freshly accepted transport and greet the switch behind it.
    pub fn register_connection(&mut self, transport: Arc<dyn Transport>) -> ConnectionId {
        let id = ConnectionId(self.next_connection);
        self.next_connection += 1;

        let mut connection = Connection::new(id, transport, self.sender.clone());
        let xid = connection.next_xid();
        if let Err(e) = connection.send(xid, &Message::Hello) {
            warn!("Connection {}: could not send hello: {}", id, e);
        }
        info!("Connection {} registered", id);
        self.devices.connections.insert(
            id,
            Device {
                connection,
                last_seen: self.clock.now(),
                echo_pending: false,
            },
        );
        id
    }

    pub fn list_all_devices(&self) -> Vec<DeviceId> {
        self.devices.connected_devices()
    }

    pub fn is_registered(&self, id: ConnectionId) -> bool {
        self.devices.connections.contains_key(&id)
    }

    pub fn flow_table(&self, dpid: DeviceId) -> Option<&OfSyncFlowTable> {
        self.devices.flow_table(dpid)
    }

    pub fn features(&self, dpid: DeviceId) -> Option<&SwitchFeatures> {
        self.devices.features(dpid)
    }

    pub fn send_message(
        &mut self,
        dpid: DeviceId,
        message: Message,
    ) -> Result<Xid, ControllerError> {
        self.devices.send_message(dpid, message)
    }

    /// Install `entry` on `dpid`. With mirrored tables this works before the switch has
    /// connected; the entry is pushed once it does.
    pub fn install_flow(
        &mut self,
        dpid: DeviceId,
        entry: TableEntry,
    ) -> Result<(), ControllerError> {
        let result = self.devices.install_flow(dpid, entry);
        self.flush_modifications();
        result
    }

    pub fn remove_flow_strict(
        &mut self,
        dpid: DeviceId,
        entry: TableEntry,
    ) -> Result<(), ControllerError> {
        let result = self.devices.remove_flow_strict(dpid, entry);
        self.flush_modifications();
        result
    }

    pub fn remove_flows(
        &mut self,
        dpid: DeviceId,
        match_spec: MatchSpec,
    ) -> Result<(), ControllerError> {
        let result = self.devices.remove_flows(dpid, match_spec);
        self.flush_modifications();
        result
    }

    /// Feed bytes read from connection `id`.
    pub fn handle_bytes(&mut self, id: ConnectionId, data: &[u8]) {
        let now = self.clock.now();
        let messages = match self.devices.connections.get_mut(&id) {
            Some(device) => {
                device.last_seen = now;
                device.echo_pending = false;
                device.connection.feed(data)
            }
            None => {
                debug!("Dropping {} bytes for unknown connection {}", data.len(), id);
                return;
            }
        };
        match messages {
            Ok(messages) => {
                for (xid, message) in messages {
                    self.handle_message(id, xid, message);
                }
            }
            Err(e) => {
                warn!("Connection {}: {}", id, e);
                self.handle_disconnect(id);
            }
        }
        self.flush_modifications();
    }

    /// Forget connection `id`, closing it if it is still open.
    pub fn handle_disconnect(&mut self, id: ConnectionId) {
        let mut device = match self.devices.connections.remove(&id) {
            Some(device) => device,
            None => return,
        };
        device.connection.disconnect();

        let dpid = match device.connection.dpid() {
            Some(dpid) => dpid,
            None => return,
        };
        if self.devices.by_dpid.get(&dpid) != Some(&id) {
            return;
        }
        self.devices.by_dpid.remove(&dpid);
        if let Some(table) = self.devices.tables.get_mut(&dpid) {
            table.handle_connection_down();
        }
        info!("Switch {} disconnected", dpid);
        self.post(DeviceControllerEvent::ConnectionDown(dpid));
    }

    /// Periodic housekeeping: reap failed connections, probe idle switches and re-issue
    /// overdue flow table updates.
    pub fn tick(&mut self) {
        let mut dead = self.sender.take_failed();
        dead.extend(
            self.devices
                .connections
                .iter()
                .filter(|(_, d)| d.connection.state() == ConnectionState::Disconnected)
                .map(|(id, _)| *id),
        );

        let now = self.clock.now();
        let interval = self.config.echo_interval;
        for (id, device) in self.devices.connections.iter_mut() {
            if !device.connection.is_operational() {
                continue;
            }
            let idle = now.checked_sub(device.last_seen).unwrap_or_default();
            if device.echo_pending && idle >= interval * 2 {
                warn!("Connection {}: no reply to echo request, disconnecting", id);
                dead.push(*id);
            } else if !device.echo_pending && idle >= interval {
                let xid = device.connection.next_xid();
                match device.connection.send(xid, &Message::EchoRequest(vec![])) {
                    Ok(()) => device.echo_pending = true,
                    Err(e) => {
                        warn!("Connection {}: echo request failed: {}", id, e);
                        dead.push(*id);
                    }
                }
            }
        }

        dead.sort();
        dead.dedup();
        for id in dead {
            self.handle_disconnect(id);
        }

        let dpids: Vec<DeviceId> = if self.devices.sync_flow_tables {
            self.devices.by_dpid.keys().cloned().collect()
        } else {
            vec![]
        };
        for dpid in dpids {
            self.devices.with_table(dpid, |table, sender| {
                let retried = table.retry_stale(sender);
                if retried > 0 {
                    warn!("Switch {}: re-sent {} flow table updates", dpid, retried);
                }
            });
        }

        for app in self.apps.iter_mut() {
            app.tick(&mut self.devices);
        }
        self.flush_modifications();
    }

    fn handle_message(&mut self, id: ConnectionId, xid: Xid, message: Message) {
        let dpid = match self.devices.connections.get_mut(&id) {
            Some(device) => device.connection.dpid(),
            None => return,
        };

        match message {
            Message::Hello => self.send_on(id, Message::FeaturesReq),
            Message::EchoRequest(data) => self.reply_on(id, xid, Message::EchoReply(data)),
            Message::EchoReply(_) => trace!("Connection {}: echo reply", id),
            Message::FeaturesReply(features) => self.handle_features(id, features),
            message => match dpid {
                Some(dpid) => self.handle_switch_message(id, dpid, xid, message),
                None => warn!("Connection {}: {:?} before handshake, ignoring", id, message),
            },
        }
    }

    fn handle_features(&mut self, id: ConnectionId, features: SwitchFeatures) {
        let dpid = DeviceId(features.datapath_id);
        let already_bound = self
            .devices
            .connections
            .get(&id)
            .map_or(false, |d| d.connection.dpid().is_some());
        if already_bound {
            self.devices.features.insert(dpid, features);
            return;
        }

        if let Some(&old) = self.devices.by_dpid.get(&dpid) {
            if old != id {
                info!("Switch {} reconnected, replacing connection {}", dpid, old);
                self.handle_disconnect(old);
            }
        }

        match self.devices.connections.get_mut(&id) {
            Some(device) => device.connection.bind(dpid),
            None => return,
        }
        info!("Switch {} connected on connection {}", dpid, id);
        self.devices.by_dpid.insert(dpid, id);
        self.devices.features.insert(dpid, features.clone());

        if self.config.sync_flow_tables {
            self.devices.with_table(dpid, |table, sender| table.handle_connection_up(sender));
        } else if self.config.clear_flows_on_connect {
            let clear = FlowMod::new(FlowModCmd::DeleteFlow, MatchSpec::match_all(), 0);
            if let Err(e) = self.devices.send_flow_mod(dpid, clear) {
                warn!("Switch {}: could not clear flows: {}", dpid, e);
            }
        }
        self.post(DeviceControllerEvent::ConnectionUp(dpid, features));
    }

    fn handle_switch_message(
        &mut self,
        id: ConnectionId,
        dpid: DeviceId,
        xid: Xid,
        message: Message,
    ) {
        match message {
            Message::PacketIn(packet_in) => {
                self.post(DeviceControllerEvent::PacketIn(dpid, packet_in))
            }
            Message::FlowRemoved(flow_removed) => {
                if let Some(table) = self.devices.tables.get_mut(&dpid) {
                    table.handle_flow_removed(&flow_removed);
                }
                self.post(DeviceControllerEvent::FlowRemoved(dpid, flow_removed));
            }
            Message::PortStatus(status) => {
                if let Some(features) = self.devices.features.get_mut(&dpid) {
                    features.ports.retain(|p| p.port_no != status.desc.port_no);
                    if status.reason != PortReason::PortDelete {
                        features.ports.push(status.desc.clone());
                        features.ports.sort_by_key(|p| p.port_no);
                    }
                }
                self.post(DeviceControllerEvent::PortStatus(dpid, status));
            }
            Message::BarrierReply => {
                let consumed = match self.devices.tables.get_mut(&dpid) {
                    Some(table) => table.handle_barrier_reply(id, xid),
                    None => EventResult::Continue,
                };
                if consumed == EventResult::Continue {
                    self.post(DeviceControllerEvent::BarrierIn(dpid, xid));
                }
            }
            Message::Error(error) => {
                debug!("Switch {}: error for xid {}: {:?}", dpid, xid, error);
                self.post(DeviceControllerEvent::ErrorIn(dpid, xid, error));
            }
            Message::StatsReply(reply) => self.handle_stats(id, dpid, xid, reply),
            Message::GetConfigReply(config) => debug!("Switch {}: config {:?}", dpid, config),
            other => debug!("Switch {}: unhandled message {:?}", dpid, other),
        }
    }

    fn handle_stats(&mut self, id: ConnectionId, dpid: DeviceId, xid: Xid, reply: StatsReply) {
        let complete = match self.devices.connections.get_mut(&id) {
            Some(device) => device.connection.accumulate_stats(xid, reply),
            None => None,
        };
        let (xid, req_type, body) = match complete {
            Some(complete) => complete,
            None => return,
        };
        let body = match StatsRespBody0x01::parse(req_type, &body) {
            Ok(body) => body,
            Err(e) => {
                warn!("Switch {}: bad {:?} stats reply: {}", dpid, req_type, e);
                return;
            }
        };

        let event = match body {
            StatsRespBody::DescBody(desc) => {
                DeviceControllerEvent::SwitchDescReceived(dpid, xid, desc)
            }
            StatsRespBody::FlowStatsBody { flow_stats } => {
                DeviceControllerEvent::FlowStatsReceived(dpid, xid, flow_stats)
            }
            StatsRespBody::AggregateStatsBody(stats) => {
                DeviceControllerEvent::AggregateStatsReceived(dpid, xid, stats)
            }
            StatsRespBody::TableBody { table_stats } => {
                DeviceControllerEvent::TableStatsReceived(dpid, xid, table_stats)
            }
            StatsRespBody::PortBody { port_stats } => {
                DeviceControllerEvent::PortStatsReceived(dpid, xid, port_stats)
            }
            StatsRespBody::QueueBody { queue_stats } => {
                DeviceControllerEvent::QueueStatsReceived(dpid, xid, queue_stats)
            }
            StatsRespBody::VendorBody(_) => {
                debug!("Switch {}: ignoring vendor stats", dpid);
                return;
            }
        };
        self.post(event);
    }

    fn send_on(&mut self, id: ConnectionId, message: Message) {
        let xid = match self.devices.connections.get_mut(&id) {
            Some(device) => device.connection.next_xid(),
            None => return,
        };
        self.reply_on(id, xid, message);
    }

    fn reply_on(&mut self, id: ConnectionId, xid: Xid, message: Message) {
        if let Some(device) = self.devices.connections.get_mut(&id) {
            if let Err(e) = device.connection.send(xid, &message) {
                warn!("Connection {}: could not send {:?}: {}", id, message, e);
            }
        }
    }

    fn post(&mut self, event: DeviceControllerEvent) {
        self.dispatch(&event);
        self.flush_modifications();
    }

    fn dispatch(&mut self, event: &DeviceControllerEvent) {
        for app in self.apps.iter_mut() {
            if app.event(event, &mut self.devices) == EventResult::Halt {
                break;
            }
        }
    }

    /// Deliver the flow table modifications published since the last call.
    fn flush_modifications(&mut self) {
        loop {
            let modifications = self.devices.take_modifications();
            if modifications.is_empty() {
                break;
            }
            for (dpid, modification) in modifications {
                self.dispatch(&DeviceControllerEvent::FlowTableModification(dpid, modification));
            }
        }
    }
}
