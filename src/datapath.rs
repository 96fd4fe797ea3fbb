//! A software OpenFlow 1.0 switch.
//!
//! The switch answers controller requests on its connection and forwards dataplane packets
//! through its flow table. Packets leaving a port are handed to `DpPacketOut` listeners.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::DatapathConfig;
use crate::event::{EventResult, ListenerId, Listeners};
use crate::flow_table::{FlowTable, TableEntry};
use crate::match_spec::MatchSpec;
use crate::message::*;
use crate::ofp_connection::{Connection, ConnectionError, ConnectionState, DeviceId};
use crate::ofp_header::{Xid, OFP_HEADER_LENGTH};
use crate::ofp_message::OfpMessage;
use crate::openflow0x01::{
    out_port_of_int, StatsRespBody0x01, OFP_MAX_MESSAGE_LENGTH, OFP_STATS_HEADER_LENGTH,
};
use crate::packet;
use crate::packet_buffer::PacketBuffer;

/// Bytes of an offending request echoed back in an error message.
const ERROR_DATA_LENGTH: usize = 64;
/// Room left for the body of one stats reply.
const MAX_STATS_BODY_LENGTH: usize =
    OFP_MAX_MESSAGE_LENGTH - OFP_HEADER_LENGTH - OFP_STATS_HEADER_LENGTH;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwitchState {
    Unconnected,
    HandshakeHello,
    HandshakeFeatures,
    Operational,
    Disconnected,
}

#[derive(Debug, Fail)]
pub enum DatapathError {
    #[fail(display = "Switch is not connected to a controller")]
    NotConnected,
    #[fail(display = "Unknown port {}", port_no)]
    UnknownPort { port_no: u16 },
    #[fail(display = "Port {} already exists", port_no)]
    DuplicatePort { port_no: u16 },
}

/// A packet leaving the switch on a port.
#[derive(Clone, Debug, PartialEq)]
pub struct DpPacketOut {
    pub dpid: u64,
    pub port: PortDesc,
    pub data: Vec<u8>,
}

pub struct SoftwareSwitch {
    dpid: u64,
    name: String,
    n_buffers: usize,
    n_tables: u8,
    miss_send_len: u16,
    config_flags: u16,
    table: FlowTable,
    buffer: PacketBuffer,
    ports: BTreeMap<u16, PortDesc>,
    port_stats: BTreeMap<u16, PortStats>,
    down_ports: BTreeSet<u16>,
    no_flood_ports: BTreeSet<u16>,
    lookup_count: u64,
    matched_count: u64,
    connection: Option<Connection>,
    state: SwitchState,
    clock: Arc<dyn Clock>,
    listeners: Listeners<DpPacketOut>,
}

impl SoftwareSwitch {
    pub fn new(config: &DatapathConfig, clock: Arc<dyn Clock>) -> SoftwareSwitch {
        let ports: BTreeMap<u16, PortDesc> = config
            .port_list()
            .into_iter()
            .map(|p| (p.port_no, p))
            .collect();
        let port_stats = ports
            .keys()
            .map(|&port_no| {
                (
                    port_no,
                    PortStats {
                        port_no,
                        ..PortStats::default()
                    },
                )
            })
            .collect();
        SoftwareSwitch {
            dpid: config.dpid,
            name: config.name(),
            n_buffers: config.n_buffers,
            n_tables: config.n_tables,
            miss_send_len: config.miss_send_len,
            config_flags: 0,
            table: FlowTable::new(),
            buffer: PacketBuffer::new(config.n_buffers),
            ports,
            port_stats,
            down_ports: BTreeSet::new(),
            no_flood_ports: BTreeSet::new(),
            lookup_count: 0,
            matched_count: 0,
            connection: None,
            state: SwitchState::Unconnected,
            clock,
            listeners: Listeners::new(),
        }
    }

    pub fn dpid(&self) -> u64 {
        self.dpid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SwitchState {
        self.state
    }

    pub fn table(&self) -> &FlowTable {
        &self.table
    }

    pub fn ports(&self) -> impl Iterator<Item = &PortDesc> {
        self.ports.values()
    }

    pub fn port(&self, port_no: u16) -> Option<&PortDesc> {
        self.ports.get(&port_no)
    }

    pub fn port_stats(&self, port_no: u16) -> Option<&PortStats> {
        self.port_stats.get(&port_no)
    }

    pub fn is_port_down(&self, port_no: u16) -> bool {
        self.down_ports.contains(&port_no)
    }

    pub fn miss_send_len(&self) -> u16 {
        self.miss_send_len
    }

    pub fn buffered_packets(&self) -> usize {
        self.buffer.len()
    }

    pub fn connection_mut(&mut self) -> Option<&mut Connection> {
        self.connection.as_mut()
    }

    pub fn add_listener<F>(&mut self, handler: F) -> ListenerId
    where
        F: FnMut(&DpPacketOut) -> EventResult + Send + 'static,
    {
        self.listeners.add(handler)
    }

    /// Attach the controller connection and start the handshake.
    pub fn set_connection(&mut self, connection: Connection) {
        if let Some(mut old) = self.connection.take() {
            old.disconnect();
        }
        info!("{}: connected on connection {}", self.name, connection.id());
        self.connection = Some(connection);
        self.state = SwitchState::HandshakeHello;
        self.send(Message::Hello);
    }

    pub fn disconnect(&mut self) -> Result<(), DatapathError> {
        let mut connection = self.connection.take().ok_or(DatapathError::NotConnected)?;
        connection.disconnect();
        self.state = SwitchState::Disconnected;
        Ok(())
    }

    /// Feed bytes read from the controller.
    pub fn receive(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        let messages = match self.connection.as_mut() {
            Some(connection) => connection.feed(data),
            None => return Err(ConnectionError::Disconnected),
        };
        let messages = match messages {
            Ok(messages) => messages,
            Err(e) => {
                error!("{}: dropping connection: {}", self.name, e);
                self.state = SwitchState::Disconnected;
                return Err(e);
            }
        };
        for (xid, message) in messages {
            self.handle_message(xid, message);
        }
        Ok(())
    }

    /// Send `message` to the controller under a fresh xid.
    pub fn send_message(&mut self, message: Message) -> Result<(), DatapathError> {
        let xid = match self.connection.as_mut() {
            Some(connection) if connection.state() != ConnectionState::Disconnected => {
                connection.next_xid()
            }
            _ => return Err(DatapathError::NotConnected),
        };
        self.reply(xid, message);
        Ok(())
    }

    fn send(&mut self, message: Message) {
        if let Err(e) = self.send_message(message) {
            debug!("{}: not sending message: {}", self.name, e);
        }
    }

    fn reply(&mut self, xid: Xid, message: Message) {
        let result = match self.connection.as_mut() {
            Some(connection) => connection.send(xid, &message),
            None => Err(ConnectionError::Disconnected),
        };
        if let Err(e) = result {
            warn!("{}: could not send {:?}: {}", self.name, message, e);
            if let Some(ref connection) = self.connection {
                if connection.state() == ConnectionState::Disconnected {
                    self.state = SwitchState::Disconnected;
                }
            }
        }
    }

    fn send_error(&mut self, xid: Xid, error: ErrorType, offending: &Message) {
        let mut data = offending.marshal(xid).unwrap_or_default();
        data.truncate(ERROR_DATA_LENGTH);
        self.reply(xid, Message::Error(Error::Error(error, data)));
    }

    pub fn handle_message(&mut self, xid: Xid, message: Message) {
        trace!("{}: received {:?} xid {}", self.name, message, xid);
        match message {
            Message::Hello => {
                if self.state == SwitchState::HandshakeHello {
                    self.state = SwitchState::HandshakeFeatures;
                }
            }
            Message::EchoRequest(data) => self.reply(xid, Message::EchoReply(data)),
            Message::EchoReply(_) => debug!("{}: echo reply", self.name),
            Message::FeaturesReq => {
                let features = self.features();
                self.reply(xid, Message::FeaturesReply(features));
                if self.state != SwitchState::Disconnected {
                    self.state = SwitchState::Operational;
                    if let Some(connection) = self.connection.as_mut() {
                        let dpid = DeviceId(self.dpid);
                        connection.bind(dpid);
                    }
                    info!("{}: operational", self.name);
                }
            }
            Message::GetConfigRequest => {
                let config = SwitchConfig {
                    flags: self.config_flags,
                    miss_send_len: self.miss_send_len,
                };
                self.reply(xid, Message::GetConfigReply(config));
            }
            Message::SetConfig(config) => {
                debug!("{}: set config {:?}", self.name, config);
                self.config_flags = config.flags;
                self.miss_send_len = config.miss_send_len;
            }
            Message::FlowMod(flow_mod) => self.receive_flow_mod(xid, flow_mod),
            Message::PacketOut(packet_out) => self.receive_packet_out(xid, packet_out),
            Message::PortMod(port_mod) => self.receive_port_mod(xid, port_mod),
            Message::BarrierRequest => self.reply(xid, Message::BarrierReply),
            Message::StatsRequest(req) => self.receive_stats_request(xid, req),
            Message::Vendor(_) => {
                self.send_error(xid, ErrorType::BadRequest(BadRequest::BadVendor), &message);
            }
            Message::Error(err) => warn!("{}: error from controller: {:?}", self.name, err),
            other => warn!("{}: unexpected message from controller: {:?}", self.name, other),
        }
    }

    pub fn features(&self) -> SwitchFeatures {
        SwitchFeatures {
            datapath_id: self.dpid,
            num_buffers: self.n_buffers as u32,
            num_tables: self.n_tables,
            supported_capabilities: Capabilities {
                flow_stats: true,
                table_stats: true,
                port_stats: true,
                arp_match_ip: true,
                ..Capabilities::default()
            },
            supported_actions: SupportedActions {
                output: true,
                set_vlan_id: true,
                set_vlan_pcp: true,
                strip_vlan: true,
                set_dl_src: true,
                set_dl_dst: true,
                set_nw_src: true,
                set_nw_dst: true,
                set_nw_tos: true,
                set_tp_src: true,
                set_tp_dst: true,
                enqueue: true,
                vendor: false,
            },
            ports: self.ports.values().cloned().collect(),
        }
    }

    fn receive_flow_mod(&mut self, xid: Xid, flow_mod: FlowMod) {
        debug!("{}: flow mod {:?} {}", self.name, flow_mod.command, flow_mod.match_spec);
        let now = self.clock.now();
        let strict = flow_mod.command.is_strict();
        match flow_mod.command {
            FlowModCmd::AddFlow => self.table.add_entry(TableEntry::from_flow_mod(&flow_mod, now)),
            FlowModCmd::ModFlow | FlowModCmd::ModStrictFlow => {
                let modified = self.table.modify_matching_entries(
                    &flow_mod.match_spec,
                    flow_mod.priority,
                    strict,
                    &flow_mod.actions,
                );
                if modified == 0 {
                    self.table.add_entry(TableEntry::from_flow_mod(&flow_mod, now));
                }
            }
            FlowModCmd::DeleteFlow | FlowModCmd::DeleteStrictFlow => {
                let removed = self.table.remove_matching_entries_for_port(
                    &flow_mod.match_spec,
                    flow_mod.priority,
                    strict,
                    flow_mod.out_port.as_ref(),
                );
                for entry in removed.iter().filter(|e| e.notify_when_removed) {
                    let flow_removed = entry.to_flow_removed(FlowRemovedReason::Delete, now);
                    self.send(Message::FlowRemoved(flow_removed));
                }
                return;
            }
        }

        if let Some(buffer_id) = flow_mod.buffer_id {
            match self.buffer.take(buffer_id) {
                Some(packet) => {
                    self.apply_actions(&flow_mod.actions, packet.data, packet.in_port, false)
                }
                None => {
                    warn!("{}: flow mod refers to unknown buffer {}", self.name, buffer_id);
                    let message = Message::FlowMod(flow_mod);
                    self.send_error(
                        xid,
                        ErrorType::BadRequest(BadRequest::BufferUnknown),
                        &message,
                    );
                }
            }
        }
    }

    fn receive_packet_out(&mut self, xid: Xid, packet_out: PacketOut) {
        let (data, in_port) = match packet_out.output_payload {
            Payload::Buffered(buffer_id, _) => match self.buffer.take(buffer_id) {
                Some(packet) => (packet.data, packet_out.port_id.unwrap_or(packet.in_port)),
                None => {
                    warn!("{}: packet out refers to unknown buffer {}", self.name, buffer_id);
                    let message = Message::PacketOut(packet_out);
                    self.send_error(
                        xid,
                        ErrorType::BadRequest(BadRequest::BufferUnknown),
                        &message,
                    );
                    return;
                }
            },
            Payload::NotBuffered(ref data) if data.is_empty() => {
                warn!("{}: packet out with neither data nor buffer id", self.name);
                return;
            }
            Payload::NotBuffered(ref data) => {
                (data.clone(), packet_out.port_id.unwrap_or(OFPP_NONE))
            }
        };
        self.apply_actions(&packet_out.apply_actions, data, in_port, true);
    }

    fn receive_port_mod(&mut self, xid: Xid, port_mod: PortMod) {
        let error = match self.ports.get(&port_mod.port_no) {
            None => Some(PortModFailed::BadPort),
            Some(port) if port.hw_addr != port_mod.hw_addr => Some(PortModFailed::BadHwAddr),
            Some(_) => None,
        };
        if let Some(error) = error {
            let message = Message::PortMod(port_mod);
            self.send_error(xid, ErrorType::PortModFailed(error), &message);
            return;
        }

        let mut mask = port_mod.mask;
        let mut status = None;
        if let Some(port) = self.ports.get_mut(&port_mod.port_no) {
            if mask & OFPPC_NO_FLOOD != 0 {
                mask &= !OFPPC_NO_FLOOD;
                port.config.no_flood = port_mod.config & OFPPC_NO_FLOOD != 0;
                if port.config.no_flood {
                    debug!("Disabling flooding on port {}", port.port_no);
                    self.no_flood_ports.insert(port.port_no);
                } else {
                    debug!("Enabling flooding on port {}", port.port_no);
                    self.no_flood_ports.remove(&port.port_no);
                }
            }
            if mask & OFPPC_PORT_DOWN != 0 {
                mask &= !OFPPC_PORT_DOWN;
                port.config.down = port_mod.config & OFPPC_PORT_DOWN != 0;
                // a configured-down port also reports its link down
                let was_down = port.state.down;
                port.state.down = port.config.down;
                if was_down != port.state.down {
                    status = Some(port.clone());
                }
            }
        }
        if mask != 0 {
            warn!("{}: unsupported port mod flags: {:08x}", self.name, mask);
        }
        if let Some(desc) = status {
            self.send(Message::PortStatus(PortStatus {
                reason: PortReason::PortModify,
                desc,
            }));
        }
    }

    fn receive_stats_request(&mut self, xid: Xid, req: StatsReq) {
        let now = self.clock.now();
        let body = match req.body {
            StatsReqBody::DescBody => StatsRespBody::DescBody(SwitchDesc {
                manufacturer_desc: "rust_pox".to_string(),
                hardware_desc: "software switch".to_string(),
                software_desc: env!("CARGO_PKG_VERSION").to_string(),
                serial_number: self.dpid.to_string(),
                datapath_desc: self.name.clone(),
            }),
            StatsReqBody::FlowStatsBody {
                ref match_spec,
                out_port,
                ..
            } if req.req_type == StatsReqType::Flow => {
                let flow_stats = self.table.flow_stats(
                    match_spec,
                    out_port_of_int(out_port).as_ref(),
                    now,
                );
                self.send_flow_stats(xid, flow_stats);
                return;
            }
            StatsReqBody::FlowStatsBody {
                ref match_spec,
                out_port,
                ..
            } => StatsRespBody::AggregateStatsBody(
                self.table
                    .aggregate_stats(match_spec, out_port_of_int(out_port).as_ref()),
            ),
            StatsReqBody::TableBody => StatsRespBody::TableBody {
                table_stats: vec![TableStats {
                    table_id: 0,
                    name: "classifier".to_string(),
                    wildcards: Wildcards::all(),
                    max_entries: 0x10000,
                    active_count: self.table.len() as u32,
                    lookup_count: self.lookup_count,
                    matched_count: self.matched_count,
                }],
            },
            StatsReqBody::PortBody { port_no } => StatsRespBody::PortBody {
                port_stats: if port_no == OFPP_NONE {
                    self.port_stats.values().cloned().collect()
                } else {
                    self.port_stats.get(&port_no).cloned().into_iter().collect()
                },
            },
            StatsReqBody::QueueBody { .. } | StatsReqBody::VendorBody(_) => {
                let message = Message::StatsRequest(req);
                self.send_error(xid, ErrorType::BadRequest(BadRequest::BadStat), &message);
                return;
            }
        };
        self.reply(xid, Message::StatsReply(StatsRespBody0x01::to_reply(&body)));
    }

    /// Reply with `flow_stats`, split over as many messages as needed.
    fn send_flow_stats(&mut self, xid: Xid, flow_stats: Vec<FlowStats>) {
        let mut parts: Vec<Vec<FlowStats>> = vec![vec![]];
        let mut size = 0;
        for stats in flow_stats {
            let len = StatsRespBody0x01::flow_stats_size(&stats);
            if size + len > MAX_STATS_BODY_LENGTH && size > 0 {
                parts.push(vec![]);
                size = 0;
            }
            size += len;
            if let Some(part) = parts.last_mut() {
                part.push(stats);
            }
        }

        let count = parts.len();
        for (i, part) in parts.into_iter().enumerate() {
            let mut reply =
                StatsRespBody0x01::to_reply(&StatsRespBody::FlowStatsBody { flow_stats: part });
            if i + 1 < count {
                reply.flags |= OFPSF_REPLY_MORE;
            }
            self.reply(xid, Message::StatsReply(reply));
        }
    }

    /// Run a dataplane packet through the flow table. A table miss is sent to the
    /// controller, or dropped while the switch is not operational.
    pub fn process_packet(&mut self, frame: &[u8], in_port: u16) {
        if let Some(stats) = self.port_stats.get_mut(&in_port) {
            stats.packets.rx += 1;
            stats.bytes.rx += frame.len() as u64;
        }
        self.lookup_packet(frame, in_port);
    }

    fn lookup_packet(&mut self, frame: &[u8], in_port: u16) {
        let now = self.clock.now();
        let fields = MatchSpec::from_frame(frame, in_port).unwrap_or_else(|e| {
            debug!("{}: matching unparsable packet on in_port only: {}", self.name, e);
            MatchSpec {
                in_port: Some(in_port),
                ..MatchSpec::default()
            }
        });

        self.lookup_count += 1;
        let actions = match self.table.lookup_mut(&fields) {
            Some(entry) => {
                entry.touch_packet(frame.len() as u64, now);
                Some(entry.actions.clone())
            }
            None => None,
        };

        match actions {
            Some(actions) => {
                self.matched_count += 1;
                self.apply_actions(&actions, frame.to_vec(), in_port, false);
            }
            None if self.state == SwitchState::Operational => {
                let max_len = self.miss_send_len;
                self.send_packet_in(frame, in_port, PacketInReason::NoMatch, max_len);
            }
            None => trace!("{}: table miss while not connected, dropping packet", self.name),
        }
    }

    /// Buffer `frame` and send its first `max_len` bytes to the controller.
    pub fn send_packet_in(
        &mut self,
        frame: &[u8],
        in_port: u16,
        reason: PacketInReason,
        max_len: u16,
    ) {
        let now = self.clock.now();
        let payload = match self.buffer.insert(frame.to_vec(), in_port, now) {
            Some(buffered) => {
                if let Some(evicted) = buffered.evicted {
                    debug!("{}: buffer {} dropped to make room", self.name, evicted);
                }
                let len = frame.len().min(usize::from(max_len));
                Payload::Buffered(buffered.buffer_id, frame[..len].to_vec())
            }
            None => Payload::NotBuffered(frame.to_vec()),
        };
        self.send(Message::PacketIn(PacketIn {
            input_payload: payload,
            total_len: frame.len() as u16,
            port: in_port,
            reason,
        }));
    }

    /// Apply `actions` in order. Field rewrites affect the outputs that follow them.
    fn apply_actions(
        &mut self,
        actions: &[Action],
        mut frame: Vec<u8>,
        in_port: u16,
        from_packet_out: bool,
    ) {
        for action in actions {
            match action.output_port() {
                Some(port) => self.output_packet(&frame, *port, in_port, from_packet_out),
                None => {
                    if let Err(e) = packet::rewrite(&mut frame, action) {
                        warn!("{}: cannot apply {:?}: {}", self.name, action, e);
                    }
                }
            }
        }
    }

    fn output_packet(
        &mut self,
        frame: &[u8],
        out_port: PseudoPort,
        in_port: u16,
        from_packet_out: bool,
    ) {
        match out_port {
            PseudoPort::PhysicalPort(port_no) => self.send_on_port(frame, port_no, in_port, false),
            PseudoPort::InPort => self.send_on_port(frame, in_port, in_port, true),
            PseudoPort::Flood | PseudoPort::AllPorts => {
                let targets: Vec<u16> = self
                    .ports
                    .keys()
                    .filter(|&&p| p != in_port && !self.no_flood_ports.contains(&p))
                    .cloned()
                    .collect();
                for port_no in targets {
                    self.send_on_port(frame, port_no, in_port, false);
                }
            }
            PseudoPort::Controller(max_len) => {
                self.send_packet_in(frame, in_port, PacketInReason::Action, max_len);
            }
            PseudoPort::Table if from_packet_out => self.lookup_packet(frame, in_port),
            PseudoPort::Table => {
                warn!("{}: output to table outside of packet out, dropping", self.name)
            }
            PseudoPort::Normal | PseudoPort::Local => {
                warn!("{}: unsupported output port {:?}, dropping", self.name, out_port);
            }
        }
    }

    fn send_on_port(&mut self, frame: &[u8], port_no: u16, in_port: u16, allow_in_port: bool) {
        if port_no == in_port && !allow_in_port {
            warn!("{}: out_port {} == in_port, dropping", self.name, port_no);
            return;
        }
        let port = match self.ports.get(&port_no) {
            Some(port) => port.clone(),
            None => {
                warn!("{}: invalid output port {}, dropping", self.name, port_no);
                return;
            }
        };
        if self.down_ports.contains(&port_no) || port.state.down {
            warn!("{}: port {} is down, dropping", self.name, port_no);
            return;
        }
        if let Some(stats) = self.port_stats.get_mut(&port_no) {
            stats.packets.tx += 1;
            stats.bytes.tx += frame.len() as u64;
        }
        self.listeners.publish(&DpPacketOut {
            dpid: self.dpid,
            port,
            data: frame.to_vec(),
        });
    }

    fn send_port_status(&mut self, reason: PortReason, desc: PortDesc) {
        self.send(Message::PortStatus(PortStatus { reason, desc }));
    }

    pub fn add_port(&mut self, desc: PortDesc) -> Result<(), DatapathError> {
        let port_no = desc.port_no;
        if self.ports.contains_key(&port_no) {
            return Err(DatapathError::DuplicatePort { port_no });
        }
        self.ports.insert(port_no, desc.clone());
        self.port_stats.insert(
            port_no,
            PortStats {
                port_no,
                ..PortStats::default()
            },
        );
        self.send_port_status(PortReason::PortAdd, desc);
        Ok(())
    }

    /// Remove a port. Flow entries forwarding to it are left alone.
    pub fn remove_port(&mut self, port_no: u16) -> Result<PortDesc, DatapathError> {
        let desc = self.ports.remove(&port_no).ok_or(DatapathError::UnknownPort { port_no })?;
        self.port_stats.remove(&port_no);
        self.down_ports.remove(&port_no);
        self.no_flood_ports.remove(&port_no);
        self.send_port_status(PortReason::PortDelete, desc.clone());
        Ok(desc)
    }

    pub fn take_port_down(&mut self, port_no: u16) -> Result<(), DatapathError> {
        let desc = self.ports.get(&port_no).cloned().ok_or(DatapathError::UnknownPort { port_no })?;
        self.down_ports.insert(port_no);
        self.send_port_status(PortReason::PortDelete, desc);
        Ok(())
    }

    pub fn bring_port_up(&mut self, port_no: u16) -> Result<(), DatapathError> {
        let desc = self.ports.get(&port_no).cloned().ok_or(DatapathError::UnknownPort { port_no })?;
        self.down_ports.remove(&port_no);
        self.send_port_status(PortReason::PortAdd, desc);
        Ok(())
    }

    /// Remove expired flow entries, notifying the controller of those that asked for it.
    pub fn expire_flows(&mut self) -> Vec<TableEntry> {
        let now = self.clock.now();
        let expired = self.table.remove_expired_entries(now);
        for entry in expired.iter() {
            debug!("{}: flow expired: {}", self.name, entry.match_spec);
            if !entry.notify_when_removed {
                continue;
            }
            if let Some(reason) = entry.expiry_reason(now) {
                let flow_removed = entry.to_flow_removed(reason, now);
                self.send(Message::FlowRemoved(flow_removed));
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ofp_connection::tests::{connection, written};
    use crate::ofp_transport::MemoryTransport;
    use crate::openflow0x01::StatsRespBody0x01;
    use crate::packet::test_frames::tcp_frame;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Harness {
        switch: SoftwareSwitch,
        memory: MemoryTransport,
        clock: Arc<ManualClock>,
        out: Arc<Mutex<Vec<DpPacketOut>>>,
    }

    impl Harness {
        /// A switch with a fresh connection, handshake not done.
        fn unconnected() -> Harness {
            let clock = Arc::new(ManualClock::default());
            let mut switch = SoftwareSwitch::new(&DatapathConfig::new(1), clock.clone());
            let out = Arc::new(Mutex::new(vec![]));
            let events = out.clone();
            switch.add_listener(move |e| {
                events.lock().unwrap().push(e.clone());
                EventResult::Continue
            });
            let (conn, memory) = connection(1);
            switch.set_connection(conn);
            Harness {
                switch,
                memory,
                clock,
                out,
            }
        }

        fn operational() -> Harness {
            let mut h = Harness::unconnected();
            h.to_switch(1, Message::Hello);
            h.to_switch(2, Message::FeaturesReq);
            assert_eq!(h.switch.state(), SwitchState::Operational);
            h.received();
            h
        }

        fn to_switch(&mut self, xid: Xid, message: Message) {
            let bytes = message.marshal(xid).unwrap();
            self.switch.receive(&bytes).unwrap();
        }

        fn received(&self) -> Vec<(Xid, Message)> {
            written(&self.memory)
        }

        fn packets_out(&self) -> Vec<DpPacketOut> {
            std::mem::replace(&mut *self.out.lock().unwrap(), vec![])
        }
    }

    fn packet() -> Vec<u8> {
        tcp_frame(1, 2, [1, 2, 3, 4], [1, 2, 3, 5], 1234, 53)
    }

    fn match_in_port_nw_src() -> MatchSpec {
        let mut m = MatchSpec {
            in_port: Some(1),
            ..MatchSpec::default()
        };
        m.set_nw_src(Ipv4Addr::new(1, 2, 3, 4), 32);
        m
    }

    fn output(port: u16) -> Action {
        Action::Output(PseudoPort::PhysicalPort(port))
    }

    #[test]
    fn test_handshake() {
        let mut h = Harness::unconnected();
        assert_eq!(h.switch.state(), SwitchState::HandshakeHello);
        let sent = h.received();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, Message::Hello);

        h.to_switch(5, Message::Hello);
        assert_eq!(h.switch.state(), SwitchState::HandshakeFeatures);
        assert!(h.received().is_empty());

        h.to_switch(6, Message::FeaturesReq);
        assert_eq!(h.switch.state(), SwitchState::Operational);
        match h.received().as_slice() {
            [(6, Message::FeaturesReply(features))] => {
                assert_eq!(features.datapath_id, 1);
                assert_eq!(features.num_buffers, 100);
                assert_eq!(features.ports.len(), 4);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_echo_request() {
        let mut h = Harness::operational();
        h.to_switch(123, Message::EchoRequest(vec![1, 2]));
        assert_eq!(h.received(), vec![(123, Message::EchoReply(vec![1, 2]))]);
    }

    #[test]
    fn test_barrier() {
        let mut h = Harness::operational();
        h.to_switch(123, Message::BarrierRequest);
        assert_eq!(h.received(), vec![(123, Message::BarrierReply)]);
    }

    #[test]
    fn test_config() {
        let mut h = Harness::operational();
        h.to_switch(
            3,
            Message::SetConfig(SwitchConfig {
                flags: 0,
                miss_send_len: 64,
            }),
        );
        h.to_switch(4, Message::GetConfigRequest);
        assert_eq!(
            h.received(),
            vec![(
                4,
                Message::GetConfigReply(SwitchConfig {
                    flags: 0,
                    miss_send_len: 64
                })
            )]
        );
    }

    #[test]
    fn test_vendor_is_rejected() {
        let mut h = Harness::operational();
        h.to_switch(9, Message::Vendor(vec![0, 0, 0x23, 0x20]));
        match h.received().as_slice() {
            [(9, Message::Error(Error::Error(ErrorType::BadRequest(code), _)))] => {
                assert_eq!(*code, BadRequest::BadVendor)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_flow_mod() {
        let mut h = Harness::operational();
        h.to_switch(
            124,
            Message::FlowMod(FlowMod::new(FlowModCmd::AddFlow, match_in_port_nw_src(), 1)),
        );
        assert!(h.received().is_empty());
        assert_eq!(h.switch.table().len(), 1);
        let e = &h.switch.table().entries()[0];
        assert_eq!(e.priority, 1);
        assert_eq!(e.match_spec, match_in_port_nw_src());
    }

    #[test]
    fn test_packet_out() {
        let mut h = Harness::operational();
        h.to_switch(
            7,
            Message::PacketOut(PacketOut {
                output_payload: Payload::NotBuffered(packet()),
                port_id: None,
                apply_actions: vec![output(2)],
            }),
        );
        assert!(h.received().is_empty());
        let out = h.packets_out();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].port.port_no, 2);
        assert_eq!(out[0].data, packet());
        assert_eq!(h.switch.port_stats(2).unwrap().packets.tx, 1);
    }

    #[test]
    fn test_packet_out_unknown_buffer() {
        let mut h = Harness::operational();
        h.to_switch(
            7,
            Message::PacketOut(PacketOut {
                output_payload: Payload::Buffered(77, vec![]),
                port_id: None,
                apply_actions: vec![output(2)],
            }),
        );
        match h.received().as_slice() {
            [(7, Message::Error(Error::Error(ErrorType::BadRequest(code), data)))] => {
                assert_eq!(*code, BadRequest::BufferUnknown);
                assert!(!data.is_empty() && data.len() <= ERROR_DATA_LENGTH);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(h.packets_out().is_empty());
    }

    #[test]
    fn test_process_packet() {
        let mut h = Harness::operational();

        // no flow entries -> packet_in
        h.switch.process_packet(&packet(), 1);
        let buffer_id = match h.received().as_slice() {
            [(_, Message::PacketIn(packet_in))] => {
                assert_eq!(packet_in.port, 1);
                assert_eq!(packet_in.reason, PacketInReason::NoMatch);
                assert_eq!(packet_in.total_len as usize, packet().len());
                assert_eq!(packet_in.input_payload.data(), &packet()[..]);
                packet_in.input_payload.buffer_id().unwrap()
            }
            other => panic!("unexpected {:?}", other),
        };
        assert!(buffer_id > 0);

        // a flow mod carrying the buffer id releases the packet
        h.to_switch(
            124,
            Message::FlowMod(FlowMod {
                buffer_id: Some(buffer_id),
                ..add_flow(1, match_in_port_nw_src(), vec![output(3)])
            }),
        );
        let out = h.packets_out();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].port.port_no, 3);
        assert_eq!(out[0].data, packet());
        assert_eq!(h.switch.buffered_packets(), 0);

        // the next packet takes the fast path
        h.switch.process_packet(&packet(), 1);
        assert!(h.received().is_empty());
        let out = h.packets_out();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].port.port_no, 3);
        assert_eq!(h.switch.table().entries()[0].packet_count, 1);
        assert_eq!(h.switch.table().entries()[0].byte_count, packet().len() as u64);
    }

    #[test]
    fn test_packet_in_is_truncated_to_miss_send_len() {
        let mut h = Harness::operational();
        h.to_switch(
            3,
            Message::SetConfig(SwitchConfig {
                flags: 0,
                miss_send_len: 20,
            }),
        );
        h.switch.process_packet(&packet(), 1);
        match h.received().as_slice() {
            [(_, Message::PacketIn(packet_in))] => {
                assert_eq!(packet_in.input_payload.data(), &packet()[..20]);
                assert_eq!(packet_in.total_len as usize, packet().len());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_table_miss_while_not_operational_is_dropped() {
        let mut h = Harness::unconnected();
        h.received();
        h.switch.process_packet(&packet(), 1);
        assert!(h.received().is_empty());
        assert_eq!(h.switch.buffered_packets(), 0);
    }

    #[test]
    fn test_flow_mod_with_unknown_buffer_still_installs() {
        let mut h = Harness::operational();
        h.to_switch(
            5,
            Message::FlowMod(FlowMod {
                buffer_id: Some(999),
                ..add_flow(1, match_in_port_nw_src(), vec![output(3)])
            }),
        );
        assert_eq!(h.switch.table().len(), 1);
        match h.received().as_slice() {
            [(5, Message::Error(Error::Error(ErrorType::BadRequest(code), _)))] => {
                assert_eq!(*code, BadRequest::BufferUnknown)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_modify_without_match_adds() {
        let mut h = Harness::operational();
        h.to_switch(
            5,
            Message::FlowMod(FlowMod {
                actions: vec![output(2)],
                ..FlowMod::new(FlowModCmd::ModStrictFlow, match_in_port_nw_src(), 3)
            }),
        );
        assert_eq!(h.switch.table().len(), 1);

        h.to_switch(
            6,
            Message::FlowMod(FlowMod {
                actions: vec![output(4)],
                ..FlowMod::new(FlowModCmd::ModFlow, MatchSpec::match_all(), 0)
            }),
        );
        assert_eq!(h.switch.table().len(), 1);
        assert_eq!(h.switch.table().entries()[0].actions, vec![output(4)]);
    }

    #[test]
    fn test_delete_sends_flow_removed_when_asked() {
        let mut h = Harness::operational();
        let notify = FlowMod {
            notify_when_removed: true,
            cookie: 42,
            ..add_flow(5, match_in_port_nw_src(), vec![output(2)])
        };
        h.to_switch(1, Message::FlowMod(notify));
        h.to_switch(2, Message::FlowMod(add_flow(4, MatchSpec::match_all(), vec![output(3)])));
        h.clock.advance(Duration::from_secs(3));

        h.to_switch(
            3,
            Message::FlowMod(FlowMod::new(FlowModCmd::DeleteFlow, MatchSpec::match_all(), 0)),
        );
        assert!(h.switch.table().is_empty());
        match h.received().as_slice() {
            [(_, Message::FlowRemoved(removed))] => {
                assert_eq!(removed.cookie, 42);
                assert_eq!(removed.reason, FlowRemovedReason::Delete);
                assert_eq!(removed.duration_sec, 3);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_delete_honours_out_port() {
        let mut h = Harness::operational();
        h.to_switch(1, Message::FlowMod(add_flow(5, match_in_port_nw_src(), vec![output(2)])));
        h.to_switch(2, Message::FlowMod(add_flow(4, MatchSpec::match_all(), vec![output(3)])));
        h.to_switch(
            3,
            Message::FlowMod(FlowMod {
                out_port: Some(PseudoPort::PhysicalPort(3)),
                ..FlowMod::new(FlowModCmd::DeleteFlow, MatchSpec::match_all(), 0)
            }),
        );
        assert_eq!(h.switch.table().len(), 1);
        assert_eq!(h.switch.table().entries()[0].priority, 5);
    }

    #[test]
    fn test_flood_skips_in_port_and_no_flood_ports() {
        let mut h = Harness::operational();
        h.to_switch(
            1,
            Message::PortMod(PortMod {
                port_no: 3,
                hw_addr: h.switch.port(3).unwrap().hw_addr,
                config: OFPPC_NO_FLOOD,
                mask: OFPPC_NO_FLOOD,
                advertise: 0,
            }),
        );
        assert!(h.received().is_empty());
        assert!(h.switch.port(3).unwrap().config.no_flood);

        h.to_switch(
            2,
            Message::FlowMod(add_flow(
                1,
                MatchSpec::match_all(),
                vec![Action::Output(PseudoPort::Flood)],
            )),
        );
        h.switch.process_packet(&packet(), 1);
        let ports: Vec<u16> = h.packets_out().iter().map(|o| o.port.port_no).collect();
        assert_eq!(ports, vec![2, 4]);
    }

    #[test]
    fn test_in_port_output() {
        let mut h = Harness::operational();
        h.to_switch(1, Message::FlowMod(add_flow(1, MatchSpec::match_all(), vec![output(1)])));
        h.switch.process_packet(&packet(), 1);
        assert!(h.packets_out().is_empty());

        h.to_switch(
            2,
            Message::FlowMod(add_flow(
                2,
                MatchSpec::match_all(),
                vec![Action::Output(PseudoPort::InPort)],
            )),
        );
        h.switch.process_packet(&packet(), 1);
        let out = h.packets_out();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].port.port_no, 1);
    }

    #[test]
    fn test_controller_output_sends_packet_in() {
        let mut h = Harness::operational();
        h.to_switch(
            1,
            Message::FlowMod(add_flow(
                1,
                MatchSpec::match_all(),
                vec![Action::Output(PseudoPort::Controller(10))],
            )),
        );
        h.switch.process_packet(&packet(), 2);
        match h.received().as_slice() {
            [(_, Message::PacketIn(packet_in))] => {
                assert_eq!(packet_in.reason, PacketInReason::Action);
                assert_eq!(packet_in.input_payload.data().len(), 10);
                assert_eq!(packet_in.port, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_rewrite_before_output() {
        let mut h = Harness::operational();
        h.to_switch(
            1,
            Message::FlowMod(add_flow(
                1,
                MatchSpec::match_all(),
                vec![output(2), Action::SetDlDst(0xaa), Action::SetTpDst(8080), output(3)],
            )),
        );
        h.switch.process_packet(&packet(), 1);
        let out = h.packets_out();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].data, packet());
        let rewritten = crate::packet::Packet::parse(&out[1].data).unwrap();
        assert_eq!(rewritten.dl_dst, 0xaa);
        assert_eq!(rewritten.ip().unwrap().tp.unwrap().ports(), (1234, 8080));
    }

    #[test]
    fn test_packet_out_to_table() {
        let mut h = Harness::operational();
        h.to_switch(1, Message::FlowMod(add_flow(1, MatchSpec::match_all(), vec![output(4)])));
        h.to_switch(
            2,
            Message::PacketOut(PacketOut {
                output_payload: Payload::NotBuffered(packet()),
                port_id: Some(1),
                apply_actions: vec![Action::Output(PseudoPort::Table)],
            }),
        );
        let out = h.packets_out();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].port.port_no, 4);
    }

    #[test]
    fn test_take_port_down() {
        let mut h = Harness::operational();
        h.switch.take_port_down(1).unwrap();
        assert!(h.switch.is_port_down(1));
        assert_eq!(h.switch.ports().count(), 4);
        match h.received().as_slice() {
            [(_, Message::PortStatus(status))] => assert_eq!(status.reason, PortReason::PortDelete),
            other => panic!("unexpected {:?}", other),
        }

        // nothing leaves through a down port
        h.to_switch(1, Message::FlowMod(add_flow(1, MatchSpec::match_all(), vec![output(1)])));
        h.switch.process_packet(&packet(), 2);
        assert!(h.packets_out().is_empty());
    }

    #[test]
    fn test_bring_port_up() {
        let mut h = Harness::operational();
        h.switch.take_port_down(1).unwrap();
        h.switch.bring_port_up(1).unwrap();
        assert!(!h.switch.is_port_down(1));
        let received = h.received();
        assert_eq!(received.len(), 2);
        match received[1].1 {
            Message::PortStatus(ref status) => assert_eq!(status.reason, PortReason::PortAdd),
            ref other => panic!("unexpected {:?}", other),
        }
        assert!(h.switch.take_port_down(9).is_err());
    }

    #[test]
    fn test_add_and_remove_port() {
        let mut h = Harness::operational();
        h.switch.add_port(PortDesc::new(5, 0x105, "eth5")).unwrap();
        assert!(h.switch.add_port(PortDesc::new(5, 0x105, "eth5")).is_err());
        h.to_switch(1, Message::FlowMod(add_flow(1, MatchSpec::match_all(), vec![output(5)])));

        let removed = h.switch.remove_port(5).unwrap();
        assert_eq!(removed.port_no, 5);
        assert_eq!(h.switch.table().len(), 1);

        let reasons: Vec<PortReason> = h
            .received()
            .into_iter()
            .filter_map(|(_, m)| match m {
                Message::PortStatus(status) => Some(status.reason),
                _ => None,
            })
            .collect();
        assert_eq!(reasons, vec![PortReason::PortAdd, PortReason::PortDelete]);

        h.switch.process_packet(&packet(), 1);
        assert!(h.packets_out().is_empty());
    }

    #[test]
    fn test_port_mod_errors_and_port_down() {
        let mut h = Harness::operational();
        h.to_switch(
            1,
            Message::PortMod(PortMod {
                port_no: 42,
                hw_addr: 0,
                config: 0,
                mask: 0,
                advertise: 0,
            }),
        );
        h.to_switch(
            2,
            Message::PortMod(PortMod {
                port_no: 1,
                hw_addr: 0xdead,
                config: 0,
                mask: 0,
                advertise: 0,
            }),
        );
        let hw_addr = h.switch.port(1).unwrap().hw_addr;
        h.to_switch(
            3,
            Message::PortMod(PortMod {
                port_no: 1,
                hw_addr,
                config: OFPPC_PORT_DOWN,
                mask: OFPPC_PORT_DOWN,
                advertise: 0,
            }),
        );

        let received = h.received();
        assert_eq!(received.len(), 3);
        match received[0].1 {
            Message::Error(Error::Error(ErrorType::PortModFailed(PortModFailed::BadPort), _)) => {}
            ref other => panic!("unexpected {:?}", other),
        }
        match received[1].1 {
            Message::Error(Error::Error(ErrorType::PortModFailed(code), _)) => {
                assert_eq!(code, PortModFailed::BadHwAddr)
            }
            ref other => panic!("unexpected {:?}", other),
        }
        match received[2].1 {
            Message::PortStatus(ref status) => {
                assert_eq!(status.reason, PortReason::PortModify);
                assert!(status.desc.state.down);
            }
            ref other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_expire_flows() {
        let mut h = Harness::operational();
        h.to_switch(
            1,
            Message::FlowMod(FlowMod {
                idle_timeout: Timeout::ExpiresAfter(5),
                notify_when_removed: true,
                ..add_flow(1, match_in_port_nw_src(), vec![output(2)])
            }),
        );
        h.to_switch(
            2,
            Message::FlowMod(FlowMod {
                hard_timeout: Timeout::ExpiresAfter(10),
                ..add_flow(1, MatchSpec::match_all(), vec![output(2)])
            }),
        );

        h.clock.set(Duration::from_secs(5));
        assert!(h.switch.expire_flows().is_empty());
        h.clock.set(Duration::from_secs(6));
        assert_eq!(h.switch.expire_flows().len(), 1);
        match h.received().as_slice() {
            [(_, Message::FlowRemoved(removed))] => {
                assert_eq!(removed.reason, FlowRemovedReason::IdleTimeout)
            }
            other => panic!("unexpected {:?}", other),
        }
        h.clock.set(Duration::from_secs(11));
        assert_eq!(h.switch.expire_flows().len(), 1);
        assert!(h.received().is_empty());
        assert!(h.switch.table().is_empty());
    }

    #[test]
    fn test_stats() {
        let mut h = Harness::operational();
        h.to_switch(1, Message::FlowMod(add_flow(1, MatchSpec::match_all(), vec![output(2)])));
        h.switch.process_packet(&packet(), 1);
        h.received();

        h.to_switch(2, Message::StatsRequest(StatsReq::flow(MatchSpec::match_all(), OFPP_NONE)));
        h.to_switch(
            3,
            Message::StatsRequest(StatsReq {
                req_type: StatsReqType::Aggregate,
                ..StatsReq::flow(MatchSpec::match_all(), OFPP_NONE)
            }),
        );
        h.to_switch(4, Message::StatsRequest(StatsReq::port(OFPP_NONE)));
        h.to_switch(
            5,
            Message::StatsRequest(StatsReq {
                req_type: StatsReqType::Queue,
                flags: 0,
                body: StatsReqBody::QueueBody {
                    port_no: 1,
                    queue_id: 0,
                },
            }),
        );

        let received = h.received();
        assert_eq!(received.len(), 4);
        let body = |i: usize| match received[i].1 {
            Message::StatsReply(ref reply) => {
                StatsRespBody0x01::parse(reply.req_type, &reply.body).unwrap()
            }
            ref other => panic!("unexpected {:?}", other),
        };
        match body(0) {
            StatsRespBody::FlowStatsBody { flow_stats } => {
                assert_eq!(flow_stats.len(), 1);
                assert_eq!(flow_stats[0].packet_count, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        match body(1) {
            StatsRespBody::AggregateStatsBody(agg) => assert_eq!(agg.flow_count, 1),
            other => panic!("unexpected {:?}", other),
        }
        match body(2) {
            StatsRespBody::PortBody { port_stats } => {
                assert_eq!(port_stats.len(), 4);
                assert_eq!(port_stats[0].packets.rx, 1);
                assert_eq!(port_stats[1].packets.tx, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        match received[3] {
            (5, Message::Error(Error::Error(ErrorType::BadRequest(BadRequest::BadStat), _))) => {}
            ref other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_large_flow_stats_are_split() {
        let mut h = Harness::operational();
        for i in 0..1000u16 {
            let m = MatchSpec {
                tp_dst: Some(i),
                ..MatchSpec::default()
            };
            h.to_switch(u32::from(i) + 1, Message::FlowMod(add_flow(1, m, vec![output(2)])));
        }
        h.to_switch(5000, Message::StatsRequest(StatsReq::flow(MatchSpec::match_all(), OFPP_NONE)));

        let replies: Vec<StatsReply> = h
            .received()
            .into_iter()
            .map(|(xid, m)| {
                assert_eq!(xid, 5000);
                match m {
                    Message::StatsReply(reply) => reply,
                    other => panic!("unexpected {:?}", other),
                }
            })
            .collect();
        assert!(replies.len() > 1);
        let (last, rest) = replies.split_last().unwrap();
        assert!(rest.iter().all(StatsReply::more));
        assert!(!last.more());

        let total: usize = replies
            .iter()
            .map(|r| match StatsRespBody0x01::parse(r.req_type, &r.body).unwrap() {
                StatsRespBody::FlowStatsBody { flow_stats } => flow_stats.len(),
                _ => 0,
            })
            .sum();
        assert_eq!(total, 1000);
    }
}
