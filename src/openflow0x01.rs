use std::io::{Cursor, Read};
use std::net::Ipv4Addr;

use byteorder::{BigEndian, ReadBytesExt};
use bytes::BufMut;

use crate::bits::*;
use crate::match_spec::{ipv4_prefix, MatchSpec, OFP_VLAN_NONE};
use crate::message::*;
use crate::ofp_header::{OfpHeader, Xid, OFP_HEADER_LENGTH, OPENFLOW_0_01_VERSION};
use crate::ofp_message::{OfpMessage, OfpSerializationError};
use crate::ofp_utils::{
    read_fixed_size_string, remaining, skip, write_fixed_size_string, write_padding_bytes,
};
use crate::openflow::MsgCode;
use crate::packet::{bytes_of_mac, mac_of_bytes};

const OFP_MAX_TABLE_NAME_LENGTH: usize = 32;
const OFP_MAX_PORT_NAME_LENGTH: usize = 16;
const DESC_STR_LENGTH: usize = 256;
const SERIAL_NUM_LENGTH: usize = 32;

pub const OFP_MATCH_LENGTH: usize = 40;
const OFP_FLOW_MOD_LENGTH: usize = 24;
const OFP_PHY_PORT_LENGTH: usize = 48;
const OFP_SWITCH_FEATURES_LENGTH: usize = 24;
const OFP_PACKET_IN_LENGTH: usize = 10;
const OFP_PACKET_OUT_LENGTH: usize = 8;
const OFP_FLOW_REMOVED_LENGTH: usize = 40;
const OFP_PORT_STATUS_LENGTH: usize = 8 + OFP_PHY_PORT_LENGTH;
const OFP_PORT_MOD_LENGTH: usize = 24;
const OFP_SWITCH_CONFIG_LENGTH: usize = 4;
const OFP_ERROR_LENGTH: usize = 4;
pub const OFP_STATS_HEADER_LENGTH: usize = 4;
const OFP_FLOW_STATS_REQUEST_LENGTH: usize = OFP_MATCH_LENGTH + 4;
const OFP_PORT_STATS_REQUEST_LENGTH: usize = 8;
const OFP_QUEUE_STATS_REQUEST_LENGTH: usize = 8;
const OFP_DESC_STATS_LENGTH: usize = 4 * DESC_STR_LENGTH + SERIAL_NUM_LENGTH;
const OFP_FLOW_STATS_LENGTH: usize = 48 + OFP_MATCH_LENGTH;
const OFP_AGGREGATE_STATS_LENGTH: usize = 24;
const OFP_TABLE_STATS_LENGTH: usize = 64;
const OFP_PORT_STATS_LENGTH: usize = 104;
const OFP_QUEUE_STATS_LENGTH: usize = 32;

/// Largest message the 16-bit header length can describe.
pub const OFP_MAX_MESSAGE_LENGTH: usize = 0xffff;

fn unexpected(value: String, field: &str, message: &str) -> OfpSerializationError {
    OfpSerializationError::UnexpectedValueError {
        value,
        field: field.to_string(),
        message: message.to_string(),
    }
}

fn read_mac(bytes: &mut Cursor<&[u8]>) -> Result<u64, OfpSerializationError> {
    let mut arr = [0u8; 6];
    bytes.read_exact(&mut arr)?;
    Ok(mac_of_bytes(arr))
}

fn write_mac(bytes: &mut Vec<u8>, mac: u64) {
    bytes.put_slice(&bytes_of_mac(mac));
}

/// Remaining bytes of `bytes`, consumed.
fn read_rest(bytes: &mut Cursor<&[u8]>) -> Vec<u8> {
    let pos = bytes.position() as usize;
    let rest = bytes.get_ref()[pos.min(bytes.get_ref().len())..].to_vec();
    bytes.set_position(bytes.get_ref().len() as u64);
    rest
}

/// Common API for message types implementing OpenFlow Message Codes (see `MsgCode` enum).
pub trait MessageType {
    /// Return the byte-size of a message body.
    fn size_of(&self) -> usize;
    /// Parse a buffer into a message.
    fn parse(buf: &[u8]) -> Result<Self, OfpSerializationError>
    where
        Self: Sized;
    /// Marshal a message into a `u8` buffer.
    fn marshal(&self, bytes: &mut Vec<u8>);
}

create_empty_wrapper!(Wildcards, Wildcards0x01);

impl Wildcards0x01 {
    fn set_nw_mask(f: u32, offset: usize, v: u32) -> u32 {
        let value = (0x3f & v) << offset;
        f | value
    }

    fn get_nw_mask(f: u32, offset: usize) -> u32 {
        (f >> offset) & 0x3f
    }

    fn to_int(w: &Wildcards) -> u32 {
        let ret = 0u64;
        let ret = bit(0, ret, w.in_port);
        let ret = bit(1, ret, w.dl_vlan);
        let ret = bit(2, ret, w.dl_src);
        let ret = bit(3, ret, w.dl_dst);
        let ret = bit(4, ret, w.dl_type);
        let ret = bit(5, ret, w.nw_proto);
        let ret = bit(6, ret, w.tp_src);
        let ret = bit(7, ret, w.tp_dst);
        let ret = Wildcards0x01::set_nw_mask(ret as u32, 8, w.nw_src.min(32));
        let ret = Wildcards0x01::set_nw_mask(ret, 14, w.nw_dst.min(32));
        let ret = bit(20, ret as u64, w.dl_vlan_pcp);
        bit(21, ret, w.nw_tos) as u32
    }

    fn of_int(bits: u32) -> Wildcards {
        let d = bits as u64;
        Wildcards {
            in_port: test_bit(0, d),
            dl_vlan: test_bit(1, d),
            dl_src: test_bit(2, d),
            dl_dst: test_bit(3, d),
            dl_type: test_bit(4, d),
            nw_proto: test_bit(5, d),
            tp_src: test_bit(6, d),
            tp_dst: test_bit(7, d),
            nw_src: Wildcards0x01::get_nw_mask(bits, 8),
            nw_dst: Wildcards0x01::get_nw_mask(bits, 14),
            dl_vlan_pcp: test_bit(20, d),
            nw_tos: test_bit(21, d),
        }
    }
}

create_empty_wrapper!(MatchSpec, Match0x01);

impl Match0x01 {
    fn read_field<T>(
        wildcarded: bool,
        bytes: &mut Cursor<&[u8]>,
        size: usize,
        read: impl FnOnce(&mut Cursor<&[u8]>) -> Result<T, OfpSerializationError>,
    ) -> Result<Option<T>, OfpSerializationError> {
        if wildcarded {
            skip(bytes, size)?;
            Ok(None)
        } else {
            Ok(Some(read(bytes)?))
        }
    }

    fn read_nw(
        bits: u32,
        bytes: &mut Cursor<&[u8]>,
    ) -> Result<Option<ipnetwork::Ipv4Network>, OfpSerializationError> {
        let addr = Ipv4Addr::from(bytes.read_u32::<BigEndian>()?);
        if bits >= 32 {
            Ok(None)
        } else {
            Ok(ipv4_prefix(addr, (32 - bits) as u8))
        }
    }

    pub fn parse(bytes: &mut Cursor<&[u8]>) -> Result<MatchSpec, OfpSerializationError> {
        let w = Wildcards0x01::of_int(bytes.read_u32::<BigEndian>()?);
        let in_port =
            Match0x01::read_field(w.in_port, bytes, 2, |b| Ok(b.read_u16::<BigEndian>()?))?;
        let dl_src = Match0x01::read_field(w.dl_src, bytes, 6, read_mac)?;
        let dl_dst = Match0x01::read_field(w.dl_dst, bytes, 6, read_mac)?;
        let dl_vlan = Match0x01::read_field(w.dl_vlan, bytes, 2, |b| {
            let vlan = b.read_u16::<BigEndian>()?;
            Ok(if vlan == OFP_VLAN_NONE { None } else { Some(vlan) })
        })?;
        let dl_vlan_pcp = Match0x01::read_field(w.dl_vlan_pcp, bytes, 1, |b| Ok(b.read_u8()?))?;
        skip(bytes, 1)?;
        let dl_type =
            Match0x01::read_field(w.dl_type, bytes, 2, |b| Ok(b.read_u16::<BigEndian>()?))?;
        let nw_tos = Match0x01::read_field(w.nw_tos, bytes, 1, |b| Ok(b.read_u8()?))?;
        let nw_proto = Match0x01::read_field(w.nw_proto, bytes, 1, |b| Ok(b.read_u8()?))?;
        skip(bytes, 2)?;
        let nw_src = Match0x01::read_nw(w.nw_src, bytes)?;
        let nw_dst = Match0x01::read_nw(w.nw_dst, bytes)?;
        let tp_src = Match0x01::read_field(w.tp_src, bytes, 2, |b| Ok(b.read_u16::<BigEndian>()?))?;
        let tp_dst = Match0x01::read_field(w.tp_dst, bytes, 2, |b| Ok(b.read_u16::<BigEndian>()?))?;
        Ok(MatchSpec {
            in_port,
            dl_src,
            dl_dst,
            dl_vlan,
            dl_vlan_pcp,
            dl_type,
            nw_tos,
            nw_proto,
            nw_src,
            nw_dst,
            tp_src,
            tp_dst,
        })
    }

    pub fn marshal(m: &MatchSpec, bytes: &mut Vec<u8>) {
        bytes.put_u32(Wildcards0x01::to_int(&m.wildcards()));
        bytes.put_u16(m.in_port.unwrap_or(0));
        write_mac(bytes, m.dl_src.unwrap_or(0));
        write_mac(bytes, m.dl_dst.unwrap_or(0));
        let vlan = match m.dl_vlan {
            Some(Some(v)) => v,
            Some(None) | None => OFP_VLAN_NONE,
        };
        bytes.put_u16(vlan);
        bytes.put_u8(m.dl_vlan_pcp.unwrap_or(0));
        write_padding_bytes(bytes, 1);
        bytes.put_u16(m.dl_type.unwrap_or(0));
        bytes.put_u8(m.nw_tos.unwrap_or(0));
        bytes.put_u8(m.nw_proto.unwrap_or(0));
        write_padding_bytes(bytes, 2);
        bytes.put_u32(m.nw_src.map(|n| u32::from(n.network())).unwrap_or(0));
        bytes.put_u32(m.nw_dst.map(|n| u32::from(n.network())).unwrap_or(0));
        bytes.put_u16(m.tp_src.unwrap_or(0));
        bytes.put_u16(m.tp_dst.unwrap_or(0));
    }
}

#[repr(u16)]
pub enum OfpPort {
    OFPPMax = 0xff00,
    OFPPInPort = 0xfff8,
    OFPPTable = 0xfff9,
    OFPPNormal = 0xfffa,
    OFPPFlood = 0xfffb,
    OFPPAll = 0xfffc,
    OFPPController = 0xfffd,
    OFPPLocal = 0xfffe,
    OFPPNone = 0xffff,
}

create_empty_wrapper!(PseudoPort, PseudoPort0x01);

impl PseudoPort0x01 {
    fn of_int(p: u16) -> Result<Option<PseudoPort>, OfpSerializationError> {
        if (OfpPort::OFPPNone as u16) == p {
            Ok(None)
        } else {
            Ok(Some(PseudoPort0x01::make(p, 0)?))
        }
    }

    fn make(p: u16, len: u16) -> Result<PseudoPort, OfpSerializationError> {
        let res = match p {
            p if p == (OfpPort::OFPPInPort as u16) => PseudoPort::InPort,
            p if p == (OfpPort::OFPPTable as u16) => PseudoPort::Table,
            p if p == (OfpPort::OFPPNormal as u16) => PseudoPort::Normal,
            p if p == (OfpPort::OFPPFlood as u16) => PseudoPort::Flood,
            p if p == (OfpPort::OFPPAll as u16) => PseudoPort::AllPorts,
            p if p == (OfpPort::OFPPController as u16) => PseudoPort::Controller(len),
            p if p == (OfpPort::OFPPLocal as u16) => PseudoPort::Local,
            _ => {
                if p <= (OfpPort::OFPPMax as u16) {
                    PseudoPort::PhysicalPort(p)
                } else {
                    return Err(unexpected(format!("{:x}", p), "port number", "action"));
                }
            }
        };
        Ok(res)
    }

    fn to_int(pp: &PseudoPort) -> u16 {
        match *pp {
            PseudoPort::PhysicalPort(p) => p,
            PseudoPort::InPort => OfpPort::OFPPInPort as u16,
            PseudoPort::Table => OfpPort::OFPPTable as u16,
            PseudoPort::Normal => OfpPort::OFPPNormal as u16,
            PseudoPort::Flood => OfpPort::OFPPFlood as u16,
            PseudoPort::AllPorts => OfpPort::OFPPAll as u16,
            PseudoPort::Controller(_) => OfpPort::OFPPController as u16,
            PseudoPort::Local => OfpPort::OFPPLocal as u16,
        }
    }

    fn marshal(pp: &PseudoPort, bytes: &mut Vec<u8>) {
        bytes.put_u16(PseudoPort0x01::to_int(pp));
    }
}

/// Decode the `out_port` filter of flow and aggregate stats requests. `OFPP_NONE` and
/// unknown port numbers disable the filter.
pub fn out_port_of_int(p: u16) -> Option<PseudoPort> {
    PseudoPort0x01::of_int(p).ok().flatten()
}

code_enum! {
    u16, OfpActionType {
        Output = 0,
        SetVlanVId = 1,
        SetVlanPcp = 2,
        StripVlan = 3,
        SetDlSrc = 4,
        SetDlDst = 5,
        SetNwSrc = 6,
        SetNwDst = 7,
        SetNwTos = 8,
        SetTpSrc = 9,
        SetTpDst = 10,
        Enqueue = 11,
    }
}

create_empty_wrapper!(Action, Action0x01);

impl Action0x01 {
    fn type_code(a: &Action) -> OfpActionType {
        match *a {
            Action::Output(_) => OfpActionType::Output,
            Action::SetDlVlan(None) => OfpActionType::StripVlan,
            Action::SetDlVlan(Some(_)) => OfpActionType::SetVlanVId,
            Action::SetDlVlanPcp(_) => OfpActionType::SetVlanPcp,
            Action::SetDlSrc(_) => OfpActionType::SetDlSrc,
            Action::SetDlDst(_) => OfpActionType::SetDlDst,
            Action::SetNwSrc(_) => OfpActionType::SetNwSrc,
            Action::SetNwDst(_) => OfpActionType::SetNwDst,
            Action::SetNwTos(_) => OfpActionType::SetNwTos,
            Action::SetTpSrc(_) => OfpActionType::SetTpSrc,
            Action::SetTpDst(_) => OfpActionType::SetTpDst,
            Action::Enqueue(_, _) => OfpActionType::Enqueue,
        }
    }

    fn size_of(a: &Action) -> usize {
        match *a {
            Action::SetDlSrc(_) | Action::SetDlDst(_) | Action::Enqueue(_, _) => 16,
            _ => 8,
        }
    }

    pub fn size_of_sequence(actions: &[Action]) -> usize {
        actions.iter().map(Action0x01::size_of).sum()
    }

    fn parse_one(bytes: &mut Cursor<&[u8]>) -> Result<Action, OfpSerializationError> {
        let action_code = bytes.read_u16::<BigEndian>()?;
        let len = bytes.read_u16::<BigEndian>()? as usize;
        if len < 8 || len % 8 != 0 || remaining(bytes) < len - 4 {
            return Err(unexpected(format!("{}", len), "len", "action"));
        }
        let start = bytes.position();
        let typ = OfpActionType::from_code(action_code)
            .ok_or_else(|| unexpected(format!("0x{:x}", action_code), "type", "action"))?;
        let action = match typ {
            OfpActionType::Output => {
                let port_code = bytes.read_u16::<BigEndian>()?;
                let max_len = bytes.read_u16::<BigEndian>()?;
                Action::Output(PseudoPort0x01::make(port_code, max_len)?)
            }
            OfpActionType::SetVlanVId => {
                let vid = bytes.read_u16::<BigEndian>()?;
                if vid == OFP_VLAN_NONE {
                    Action::SetDlVlan(None)
                } else {
                    Action::SetDlVlan(Some(vid))
                }
            }
            OfpActionType::SetVlanPcp => Action::SetDlVlanPcp(bytes.read_u8()?),
            OfpActionType::StripVlan => Action::SetDlVlan(None),
            OfpActionType::SetDlSrc => Action::SetDlSrc(read_mac(bytes)?),
            OfpActionType::SetDlDst => Action::SetDlDst(read_mac(bytes)?),
            OfpActionType::SetNwSrc => Action::SetNwSrc(bytes.read_u32::<BigEndian>()?),
            OfpActionType::SetNwDst => Action::SetNwDst(bytes.read_u32::<BigEndian>()?),
            OfpActionType::SetNwTos => Action::SetNwTos(bytes.read_u8()?),
            OfpActionType::SetTpSrc => Action::SetTpSrc(bytes.read_u16::<BigEndian>()?),
            OfpActionType::SetTpDst => Action::SetTpDst(bytes.read_u16::<BigEndian>()?),
            OfpActionType::Enqueue => {
                let pp = PseudoPort0x01::make(bytes.read_u16::<BigEndian>()?, 0)?;
                skip(bytes, 6)?;
                let queue_id = bytes.read_u32::<BigEndian>()?;
                Action::Enqueue(pp, queue_id)
            }
        };
        bytes.set_position(start + (len - 4) as u64);
        Ok(action)
    }

    pub fn parse_sequence(bytes: &mut Cursor<&[u8]>) -> Result<Vec<Action>, OfpSerializationError> {
        let mut actions = vec![];
        while remaining(bytes) > 0 {
            actions.push(Action0x01::parse_one(bytes)?);
        }
        Ok(actions)
    }

    fn marshal(act: &Action, bytes: &mut Vec<u8>) {
        bytes.put_u16(Action0x01::type_code(act).code());
        bytes.put_u16(Action0x01::size_of(act) as u16);
        match *act {
            Action::Output(pp) => {
                PseudoPort0x01::marshal(&pp, bytes);
                bytes.put_u16(match pp {
                    PseudoPort::Controller(w) => w,
                    _ => 0,
                });
            }
            Action::SetDlVlan(None) => write_padding_bytes(bytes, 4),
            Action::SetDlVlan(Some(vid)) => {
                bytes.put_u16(vid);
                write_padding_bytes(bytes, 2);
            }
            Action::SetDlVlanPcp(n) | Action::SetNwTos(n) => {
                bytes.put_u8(n);
                write_padding_bytes(bytes, 3);
            }
            Action::SetDlSrc(mac) | Action::SetDlDst(mac) => {
                write_mac(bytes, mac);
                write_padding_bytes(bytes, 6);
            }
            Action::SetNwSrc(addr) | Action::SetNwDst(addr) => bytes.put_u32(addr),
            Action::SetTpSrc(pt) | Action::SetTpDst(pt) => {
                bytes.put_u16(pt);
                write_padding_bytes(bytes, 2);
            }
            Action::Enqueue(pp, qid) => {
                PseudoPort0x01::marshal(&pp, bytes);
                write_padding_bytes(bytes, 6);
                bytes.put_u32(qid);
            }
        }
    }

    pub fn marshal_sequence(actions: &[Action], bytes: &mut Vec<u8>) {
        for act in actions {
            Action0x01::marshal(act, bytes);
        }
    }
}

create_empty_wrapper!(Capabilities, Capabilities0x01);

impl Capabilities0x01 {
    fn of_int(d: u32) -> Capabilities {
        let d = d as u64;
        Capabilities {
            flow_stats: test_bit(0, d),
            table_stats: test_bit(1, d),
            port_stats: test_bit(2, d),
            stp: test_bit(3, d),
            ip_reasm: test_bit(5, d),
            queue_stats: test_bit(6, d),
            arp_match_ip: test_bit(7, d),
        }
    }

    fn to_int(c: &Capabilities) -> u32 {
        let ret = bit(0, 0, c.flow_stats);
        let ret = bit(1, ret, c.table_stats);
        let ret = bit(2, ret, c.port_stats);
        let ret = bit(3, ret, c.stp);
        let ret = bit(5, ret, c.ip_reasm);
        let ret = bit(6, ret, c.queue_stats);
        bit(7, ret, c.arp_match_ip) as u32
    }
}

create_empty_wrapper!(SupportedActions, SupportedActions0x01);

impl SupportedActions0x01 {
    fn of_int(d: u32) -> SupportedActions {
        let d = d as u64;
        SupportedActions {
            output: test_bit(0, d),
            set_vlan_id: test_bit(1, d),
            set_vlan_pcp: test_bit(2, d),
            strip_vlan: test_bit(3, d),
            set_dl_src: test_bit(4, d),
            set_dl_dst: test_bit(5, d),
            set_nw_src: test_bit(6, d),
            set_nw_dst: test_bit(7, d),
            set_nw_tos: test_bit(8, d),
            set_tp_src: test_bit(9, d),
            set_tp_dst: test_bit(10, d),
            enqueue: test_bit(11, d),
            vendor: test_bit(12, d),
        }
    }

    fn to_int(a: &SupportedActions) -> u32 {
        let ret = bit(0, 0, a.output);
        let ret = bit(1, ret, a.set_vlan_id);
        let ret = bit(2, ret, a.set_vlan_pcp);
        let ret = bit(3, ret, a.strip_vlan);
        let ret = bit(4, ret, a.set_dl_src);
        let ret = bit(5, ret, a.set_dl_dst);
        let ret = bit(6, ret, a.set_nw_src);
        let ret = bit(7, ret, a.set_nw_dst);
        let ret = bit(8, ret, a.set_nw_tos);
        let ret = bit(9, ret, a.set_tp_src);
        let ret = bit(10, ret, a.set_tp_dst);
        let ret = bit(11, ret, a.enqueue);
        bit(12, ret, a.vendor) as u32
    }
}

impl MessageType for SwitchFeatures {
    fn size_of(&self) -> usize {
        OFP_SWITCH_FEATURES_LENGTH + self.ports.len() * OFP_PHY_PORT_LENGTH
    }

    fn parse(buf: &[u8]) -> Result<SwitchFeatures, OfpSerializationError> {
        let mut bytes = Cursor::new(buf);
        let datapath_id = bytes.read_u64::<BigEndian>()?;
        let num_buffers = bytes.read_u32::<BigEndian>()?;
        let num_tables = bytes.read_u8()?;
        skip(&mut bytes, 3)?;
        let supported_capabilities = Capabilities0x01::of_int(bytes.read_u32::<BigEndian>()?);
        let supported_actions = SupportedActions0x01::of_int(bytes.read_u32::<BigEndian>()?);
        let mut ports = vec![];
        while remaining(&bytes) >= OFP_PHY_PORT_LENGTH {
            ports.push(PortDesc0x01::parse(&mut bytes)?);
        }
        Ok(SwitchFeatures {
            datapath_id,
            num_buffers,
            num_tables,
            supported_capabilities,
            supported_actions,
            ports,
        })
    }

    fn marshal(&self, bytes: &mut Vec<u8>) {
        bytes.put_u64(self.datapath_id);
        bytes.put_u32(self.num_buffers);
        bytes.put_u8(self.num_tables);
        write_padding_bytes(bytes, 3);
        bytes.put_u32(Capabilities0x01::to_int(&self.supported_capabilities));
        bytes.put_u32(SupportedActions0x01::to_int(&self.supported_actions));
        for port in &self.ports {
            PortDesc0x01::marshal(port, bytes);
        }
    }
}

create_empty_wrapper!(FlowMod, FlowMod0x01);

impl FlowMod0x01 {
    fn flags_to_int(check_overlap: bool, notify_when_removed: bool) -> u16 {
        (if check_overlap { 1 << 1 } else { 0 }) | (if notify_when_removed { 1 << 0 } else { 0 })
    }

    fn check_overlap_of_flags(flags: u16) -> bool {
        2 & flags != 0
    }

    fn notify_when_removed_of_flags(flags: u16) -> bool {
        1 & flags != 0
    }
}

fn buffer_id_of_int(id: u32) -> Option<u32> {
    if id == NO_BUFFER {
        None
    } else {
        Some(id)
    }
}

impl MessageType for FlowMod {
    fn size_of(&self) -> usize {
        OFP_MATCH_LENGTH + OFP_FLOW_MOD_LENGTH + Action0x01::size_of_sequence(&self.actions)
    }

    fn parse(buf: &[u8]) -> Result<FlowMod, OfpSerializationError> {
        let mut bytes = Cursor::new(buf);
        let match_spec = Match0x01::parse(&mut bytes)?;
        let cookie = bytes.read_u64::<BigEndian>()?;
        let cmd = bytes.read_u16::<BigEndian>()?;
        let command = FlowModCmd::from_code(cmd)
            .ok_or_else(|| unexpected(format!("{}", cmd), "command", "flow_mod"))?;
        let idle = Timeout::of_int(bytes.read_u16::<BigEndian>()?);
        let hard = Timeout::of_int(bytes.read_u16::<BigEndian>()?);
        let priority = bytes.read_u16::<BigEndian>()?;
        let buffer_id = buffer_id_of_int(bytes.read_u32::<BigEndian>()?);
        let out_port = PseudoPort0x01::of_int(bytes.read_u16::<BigEndian>()?)?;
        let flags = bytes.read_u16::<BigEndian>()?;
        let actions = Action0x01::parse_sequence(&mut bytes)?;
        Ok(FlowMod {
            command,
            match_spec,
            priority,
            actions,
            cookie,
            idle_timeout: idle,
            hard_timeout: hard,
            notify_when_removed: FlowMod0x01::notify_when_removed_of_flags(flags),
            buffer_id,
            out_port,
            check_overlap: FlowMod0x01::check_overlap_of_flags(flags),
        })
    }

    fn marshal(&self, bytes: &mut Vec<u8>) {
        Match0x01::marshal(&self.match_spec, bytes);
        bytes.put_u64(self.cookie);
        bytes.put_u16(self.command.code());
        bytes.put_u16(Timeout::to_int(self.idle_timeout));
        bytes.put_u16(Timeout::to_int(self.hard_timeout));
        bytes.put_u16(self.priority);
        bytes.put_u32(self.buffer_id.unwrap_or(NO_BUFFER));
        match self.out_port {
            None => bytes.put_u16(OfpPort::OFPPNone as u16),
            Some(ref x) => PseudoPort0x01::marshal(x, bytes),
        }
        bytes.put_u16(FlowMod0x01::flags_to_int(self.check_overlap, self.notify_when_removed));
        Action0x01::marshal_sequence(&self.actions, bytes);
    }
}

impl MessageType for PacketIn {
    fn size_of(&self) -> usize {
        OFP_PACKET_IN_LENGTH + Payload::size_of(&self.input_payload)
    }

    fn parse(buf: &[u8]) -> Result<PacketIn, OfpSerializationError> {
        let mut bytes = Cursor::new(buf);
        let buf_id = buffer_id_of_int(bytes.read_u32::<BigEndian>()?);
        let total_len = bytes.read_u16::<BigEndian>()?;
        let port = bytes.read_u16::<BigEndian>()?;
        let code = bytes.read_u8()?;
        let reason = PacketInReason::from_code(code)
            .ok_or_else(|| unexpected(format!("{}", code), "reason", "packet_in"))?;
        skip(&mut bytes, 1)?;
        let pk = read_rest(&mut bytes);
        let input_payload = match buf_id {
            None => Payload::NotBuffered(pk),
            Some(n) => Payload::Buffered(n, pk),
        };
        Ok(PacketIn {
            input_payload,
            total_len,
            port,
            reason,
        })
    }

    fn marshal(&self, bytes: &mut Vec<u8>) {
        bytes.put_u32(self.input_payload.buffer_id().unwrap_or(NO_BUFFER));
        bytes.put_u16(self.total_len);
        bytes.put_u16(self.port);
        bytes.put_u8(self.reason.code());
        write_padding_bytes(bytes, 1);
        bytes.put_slice(self.input_payload.data());
    }
}

impl MessageType for PacketOut {
    fn size_of(&self) -> usize {
        OFP_PACKET_OUT_LENGTH
            + Action0x01::size_of_sequence(&self.apply_actions)
            + Payload::size_of(&self.output_payload)
    }

    fn parse(buf: &[u8]) -> Result<PacketOut, OfpSerializationError> {
        let mut bytes = Cursor::new(buf);
        let buf_id = buffer_id_of_int(bytes.read_u32::<BigEndian>()?);
        let in_port = bytes.read_u16::<BigEndian>()?;
        let actions_len = bytes.read_u16::<BigEndian>()? as usize;
        if remaining(&bytes) < actions_len {
            return Err(unexpected(format!("{}", actions_len), "actions_len", "packet_out"));
        }
        let pos = bytes.position() as usize;
        let mut actions_bytes = Cursor::new(&buf[pos..pos + actions_len]);
        let apply_actions = Action0x01::parse_sequence(&mut actions_bytes)?;
        skip(&mut bytes, actions_len)?;
        let data = read_rest(&mut bytes);
        Ok(PacketOut {
            output_payload: match buf_id {
                None => Payload::NotBuffered(data),
                Some(n) => Payload::Buffered(n, data),
            },
            port_id: if in_port == OfpPort::OFPPNone as u16 {
                None
            } else {
                Some(in_port)
            },
            apply_actions,
        })
    }

    fn marshal(&self, bytes: &mut Vec<u8>) {
        bytes.put_u32(self.output_payload.buffer_id().unwrap_or(NO_BUFFER));
        bytes.put_u16(self.port_id.unwrap_or(OfpPort::OFPPNone as u16));
        bytes.put_u16(Action0x01::size_of_sequence(&self.apply_actions) as u16);
        Action0x01::marshal_sequence(&self.apply_actions, bytes);
        bytes.put_slice(self.output_payload.data());
    }
}

impl MessageType for FlowRemoved {
    fn size_of(&self) -> usize {
        OFP_MATCH_LENGTH + OFP_FLOW_REMOVED_LENGTH
    }

    fn parse(buf: &[u8]) -> Result<FlowRemoved, OfpSerializationError> {
        let mut bytes = Cursor::new(buf);
        let match_spec = Match0x01::parse(&mut bytes)?;
        let cookie = bytes.read_u64::<BigEndian>()?;
        let priority = bytes.read_u16::<BigEndian>()?;
        let code = bytes.read_u8()?;
        let reason = FlowRemovedReason::from_code(code)
            .ok_or_else(|| unexpected(format!("{}", code), "reason", "flow_removed"))?;
        skip(&mut bytes, 1)?;
        let duration_sec = bytes.read_u32::<BigEndian>()?;
        let duration_nsec = bytes.read_u32::<BigEndian>()?;
        let idle_timeout = Timeout::of_int(bytes.read_u16::<BigEndian>()?);
        skip(&mut bytes, 2)?;
        let packet_count = bytes.read_u64::<BigEndian>()?;
        let byte_count = bytes.read_u64::<BigEndian>()?;
        Ok(FlowRemoved {
            match_spec,
            cookie,
            priority,
            reason,
            duration_sec,
            duration_nsec,
            idle_timeout,
            packet_count,
            byte_count,
        })
    }

    fn marshal(&self, bytes: &mut Vec<u8>) {
        Match0x01::marshal(&self.match_spec, bytes);
        bytes.put_u64(self.cookie);
        bytes.put_u16(self.priority);
        bytes.put_u8(self.reason.code());
        write_padding_bytes(bytes, 1);
        bytes.put_u32(self.duration_sec);
        bytes.put_u32(self.duration_nsec);
        bytes.put_u16(Timeout::to_int(self.idle_timeout));
        write_padding_bytes(bytes, 2);
        bytes.put_u64(self.packet_count);
        bytes.put_u64(self.byte_count);
    }
}

create_empty_wrapper!(PortFeatures, PortFeatures0x01);

impl PortFeatures0x01 {
    fn of_int(d: u32) -> PortFeatures {
        let d = d as u64;
        PortFeatures {
            f_10mbhd: test_bit(0, d),
            f_10mbfd: test_bit(1, d),
            f_100mbhd: test_bit(2, d),
            f_100mbfd: test_bit(3, d),
            f_1gbhd: test_bit(4, d),
            f_1gbfd: test_bit(5, d),
            f_10gbfd: test_bit(6, d),
            copper: test_bit(7, d),
            fiber: test_bit(8, d),
            autoneg: test_bit(9, d),
            pause: test_bit(10, d),
            pause_asym: test_bit(11, d),
        }
    }

    fn to_int(f: &PortFeatures) -> u32 {
        let ret = bit(0, 0, f.f_10mbhd);
        let ret = bit(1, ret, f.f_10mbfd);
        let ret = bit(2, ret, f.f_100mbhd);
        let ret = bit(3, ret, f.f_100mbfd);
        let ret = bit(4, ret, f.f_1gbhd);
        let ret = bit(5, ret, f.f_1gbfd);
        let ret = bit(6, ret, f.f_10gbfd);
        let ret = bit(7, ret, f.copper);
        let ret = bit(8, ret, f.fiber);
        let ret = bit(9, ret, f.autoneg);
        let ret = bit(10, ret, f.pause);
        bit(11, ret, f.pause_asym) as u32
    }
}

create_empty_wrapper!(PortConfig, PortConfig0x01);

impl PortConfig0x01 {
    pub fn of_int(d: u32) -> PortConfig {
        let d = d as u64;
        PortConfig {
            down: test_bit(0, d),
            no_stp: test_bit(1, d),
            no_recv: test_bit(2, d),
            no_recv_stp: test_bit(3, d),
            no_flood: test_bit(4, d),
            no_fwd: test_bit(5, d),
            no_packet_in: test_bit(6, d),
        }
    }

    pub fn to_int(c: &PortConfig) -> u32 {
        let ret = bit(0, 0, c.down);
        let ret = bit(1, ret, c.no_stp);
        let ret = bit(2, ret, c.no_recv);
        let ret = bit(3, ret, c.no_recv_stp);
        let ret = bit(4, ret, c.no_flood);
        let ret = bit(5, ret, c.no_fwd);
        bit(6, ret, c.no_packet_in) as u32
    }
}

create_empty_wrapper!(PortDesc, PortDesc0x01);

impl PortDesc0x01 {
    fn parse(bytes: &mut Cursor<&[u8]>) -> Result<PortDesc, OfpSerializationError> {
        let port_no = bytes.read_u16::<BigEndian>()?;
        let hw_addr = read_mac(bytes)?;
        let name = read_fixed_size_string(bytes, OFP_MAX_PORT_NAME_LENGTH)?;
        let config = PortConfig0x01::of_int(bytes.read_u32::<BigEndian>()?);
        let state = {
            let d = bytes.read_u32::<BigEndian>()?;
            let stp = (d >> 8) & 3;
            PortState {
                down: test_bit(0, d as u64),
                stp_state: StpState::from_code(stp).ok_or_else(|| {
                    unexpected(format!("{:x}", stp), "ofp_port_state/stp_state", "Port Description")
                })?,
            }
        };
        let curr = PortFeatures0x01::of_int(bytes.read_u32::<BigEndian>()?);
        let advertised = PortFeatures0x01::of_int(bytes.read_u32::<BigEndian>()?);
        let supported = PortFeatures0x01::of_int(bytes.read_u32::<BigEndian>()?);
        let peer = PortFeatures0x01::of_int(bytes.read_u32::<BigEndian>()?);
        Ok(PortDesc {
            port_no,
            hw_addr,
            name,
            config,
            state,
            curr,
            advertised,
            supported,
            peer,
        })
    }

    fn marshal(desc: &PortDesc, bytes: &mut Vec<u8>) {
        bytes.put_u16(desc.port_no);
        write_mac(bytes, desc.hw_addr);
        write_fixed_size_string(bytes, &desc.name, OFP_MAX_PORT_NAME_LENGTH);
        bytes.put_u32(PortConfig0x01::to_int(&desc.config));
        let state = bit(0, 0, desc.state.down) as u32 | (desc.state.stp_state.code() << 8);
        bytes.put_u32(state);
        bytes.put_u32(PortFeatures0x01::to_int(&desc.curr));
        bytes.put_u32(PortFeatures0x01::to_int(&desc.advertised));
        bytes.put_u32(PortFeatures0x01::to_int(&desc.supported));
        bytes.put_u32(PortFeatures0x01::to_int(&desc.peer));
    }
}

impl MessageType for PortStatus {
    fn size_of(&self) -> usize {
        OFP_PORT_STATUS_LENGTH
    }

    fn parse(buf: &[u8]) -> Result<PortStatus, OfpSerializationError> {
        let mut bytes = Cursor::new(buf);
        let code = bytes.read_u8()?;
        let reason = PortReason::from_code(code)
            .ok_or_else(|| unexpected(format!("{}", code), "reason", "port_status"))?;
        skip(&mut bytes, 7)?;
        let desc = PortDesc0x01::parse(&mut bytes)?;
        Ok(PortStatus { reason, desc })
    }

    fn marshal(&self, bytes: &mut Vec<u8>) {
        bytes.put_u8(self.reason.code());
        write_padding_bytes(bytes, 7);
        PortDesc0x01::marshal(&self.desc, bytes);
    }
}

impl MessageType for PortMod {
    fn size_of(&self) -> usize {
        OFP_PORT_MOD_LENGTH
    }

    fn parse(buf: &[u8]) -> Result<PortMod, OfpSerializationError> {
        let mut bytes = Cursor::new(buf);
        let port_no = bytes.read_u16::<BigEndian>()?;
        let hw_addr = read_mac(&mut bytes)?;
        let config = bytes.read_u32::<BigEndian>()?;
        let mask = bytes.read_u32::<BigEndian>()?;
        let advertise = bytes.read_u32::<BigEndian>()?;
        Ok(PortMod {
            port_no,
            hw_addr,
            config,
            mask,
            advertise,
        })
    }

    fn marshal(&self, bytes: &mut Vec<u8>) {
        bytes.put_u16(self.port_no);
        write_mac(bytes, self.hw_addr);
        bytes.put_u32(self.config);
        bytes.put_u32(self.mask);
        bytes.put_u32(self.advertise);
        write_padding_bytes(bytes, 4);
    }
}

impl MessageType for SwitchConfig {
    fn size_of(&self) -> usize {
        OFP_SWITCH_CONFIG_LENGTH
    }

    fn parse(buf: &[u8]) -> Result<SwitchConfig, OfpSerializationError> {
        let mut bytes = Cursor::new(buf);
        Ok(SwitchConfig {
            flags: bytes.read_u16::<BigEndian>()?,
            miss_send_len: bytes.read_u16::<BigEndian>()?,
        })
    }

    fn marshal(&self, bytes: &mut Vec<u8>) {
        bytes.put_u16(self.flags);
        bytes.put_u16(self.miss_send_len);
    }
}

create_empty_wrapper!(ErrorType, ErrorType0x01);

impl ErrorType0x01 {
    fn of_int(error_type: u16, error_code: u16) -> Result<ErrorType, OfpSerializationError> {
        let bad_code = || unexpected(format!("{}", error_code), "error code", "error");
        let typ = match error_type {
            0 => ErrorType::HelloFailed(HelloFailed::from_code(error_code).ok_or_else(bad_code)?),
            1 => ErrorType::BadRequest(BadRequest::from_code(error_code).ok_or_else(bad_code)?),
            2 => ErrorType::BadAction(BadAction::from_code(error_code).ok_or_else(bad_code)?),
            3 => ErrorType::FlowModFailed(
                FlowModFailed::from_code(error_code).ok_or_else(bad_code)?,
            ),
            4 => ErrorType::PortModFailed(
                PortModFailed::from_code(error_code).ok_or_else(bad_code)?,
            ),
            5 => ErrorType::QueueOpFailed(
                QueueOpFailed::from_code(error_code).ok_or_else(bad_code)?,
            ),
            _ => return Err(unexpected(format!("{:x}", error_type), "error type", "error")),
        };
        Ok(typ)
    }

    fn to_int(typ: &ErrorType) -> (u16, u16) {
        match *typ {
            ErrorType::HelloFailed(c) => (0, c.code()),
            ErrorType::BadRequest(c) => (1, c.code()),
            ErrorType::BadAction(c) => (2, c.code()),
            ErrorType::FlowModFailed(c) => (3, c.code()),
            ErrorType::PortModFailed(c) => (4, c.code()),
            ErrorType::QueueOpFailed(c) => (5, c.code()),
        }
    }
}

impl MessageType for Error {
    fn size_of(&self) -> usize {
        match *self {
            Error::Error(_, ref body) => OFP_ERROR_LENGTH + body.len(),
        }
    }

    fn parse(buf: &[u8]) -> Result<Error, OfpSerializationError> {
        let mut bytes = Cursor::new(buf);
        let error_type = bytes.read_u16::<BigEndian>()?;
        let error_code = bytes.read_u16::<BigEndian>()?;
        let typ = ErrorType0x01::of_int(error_type, error_code)?;
        Ok(Error::Error(typ, read_rest(&mut bytes)))
    }

    fn marshal(&self, bytes: &mut Vec<u8>) {
        match *self {
            Error::Error(ref typ, ref body) => {
                let (t, c) = ErrorType0x01::to_int(typ);
                bytes.put_u16(t);
                bytes.put_u16(c);
                bytes.put_slice(body);
            }
        }
    }
}

fn stats_type_of_int(code: u16, message: &str) -> Result<StatsReqType, OfpSerializationError> {
    StatsReqType::from_code(code).ok_or_else(|| unexpected(format!("{}", code), "type", message))
}

impl MessageType for StatsReq {
    fn size_of(&self) -> usize {
        OFP_STATS_HEADER_LENGTH
            + match self.body {
                StatsReqBody::DescBody | StatsReqBody::TableBody => 0,
                StatsReqBody::FlowStatsBody { .. } => OFP_FLOW_STATS_REQUEST_LENGTH,
                StatsReqBody::PortBody { .. } => OFP_PORT_STATS_REQUEST_LENGTH,
                StatsReqBody::QueueBody { .. } => OFP_QUEUE_STATS_REQUEST_LENGTH,
                StatsReqBody::VendorBody(ref body) => body.len(),
            }
    }

    fn parse(buf: &[u8]) -> Result<StatsReq, OfpSerializationError> {
        let mut bytes = Cursor::new(buf);
        let req_type = stats_type_of_int(bytes.read_u16::<BigEndian>()?, "stats_request")?;
        let flags = bytes.read_u16::<BigEndian>()?;
        let body = match req_type {
            StatsReqType::Desc => StatsReqBody::DescBody,
            StatsReqType::Table => StatsReqBody::TableBody,
            StatsReqType::Flow | StatsReqType::Aggregate => {
                let match_spec = Match0x01::parse(&mut bytes)?;
                let table_id = bytes.read_u8()?;
                skip(&mut bytes, 1)?;
                let out_port = bytes.read_u16::<BigEndian>()?;
                StatsReqBody::FlowStatsBody {
                    match_spec,
                    table_id,
                    out_port,
                }
            }
            StatsReqType::Port => {
                let port_no = bytes.read_u16::<BigEndian>()?;
                skip(&mut bytes, 6)?;
                StatsReqBody::PortBody { port_no }
            }
            StatsReqType::Queue => {
                let port_no = bytes.read_u16::<BigEndian>()?;
                skip(&mut bytes, 2)?;
                let queue_id = bytes.read_u32::<BigEndian>()?;
                StatsReqBody::QueueBody { port_no, queue_id }
            }
            StatsReqType::Vendor => StatsReqBody::VendorBody(read_rest(&mut bytes)),
        };
        Ok(StatsReq { req_type, flags, body })
    }

    fn marshal(&self, bytes: &mut Vec<u8>) {
        bytes.put_u16(self.req_type.code());
        bytes.put_u16(self.flags);
        match self.body {
            StatsReqBody::DescBody | StatsReqBody::TableBody => {}
            StatsReqBody::FlowStatsBody {
                ref match_spec,
                table_id,
                out_port,
            } => {
                Match0x01::marshal(match_spec, bytes);
                bytes.put_u8(table_id);
                write_padding_bytes(bytes, 1);
                bytes.put_u16(out_port);
            }
            StatsReqBody::PortBody { port_no } => {
                bytes.put_u16(port_no);
                write_padding_bytes(bytes, 6);
            }
            StatsReqBody::QueueBody { port_no, queue_id } => {
                bytes.put_u16(port_no);
                write_padding_bytes(bytes, 2);
                bytes.put_u32(queue_id);
            }
            StatsReqBody::VendorBody(ref body) => bytes.put_slice(body),
        }
    }
}

impl MessageType for StatsReply {
    fn size_of(&self) -> usize {
        OFP_STATS_HEADER_LENGTH + self.body.len()
    }

    fn parse(buf: &[u8]) -> Result<StatsReply, OfpSerializationError> {
        let mut bytes = Cursor::new(buf);
        let req_type = stats_type_of_int(bytes.read_u16::<BigEndian>()?, "stats_reply")?;
        let flags = bytes.read_u16::<BigEndian>()?;
        Ok(StatsReply {
            req_type,
            flags,
            body: read_rest(&mut bytes),
        })
    }

    fn marshal(&self, bytes: &mut Vec<u8>) {
        bytes.put_u16(self.req_type.code());
        bytes.put_u16(self.flags);
        bytes.put_slice(&self.body);
    }
}

create_empty_wrapper!(TransmissionCounter, TransmissionCounter0x01);

impl TransmissionCounter0x01 {
    fn parse(bytes: &mut Cursor<&[u8]>) -> Result<TransmissionCounter, OfpSerializationError> {
        Ok(TransmissionCounter {
            rx: bytes.read_u64::<BigEndian>()?,
            tx: bytes.read_u64::<BigEndian>()?,
        })
    }

    fn marshal(counter: &TransmissionCounter, bytes: &mut Vec<u8>) {
        bytes.put_u64(counter.rx);
        bytes.put_u64(counter.tx);
    }
}

/// Typed decoding of reassembled stats reply bodies.
pub struct StatsRespBody0x01;

impl StatsRespBody0x01 {
    /// Wire size of one flow stats entry.
    pub fn flow_stats_size(stats: &FlowStats) -> usize {
        OFP_FLOW_STATS_LENGTH + Action0x01::size_of_sequence(&stats.actions)
    }

    fn parse_flow_stats(bytes: &mut Cursor<&[u8]>) -> Result<FlowStats, OfpSerializationError> {
        let length = bytes.read_u16::<BigEndian>()? as usize;
        if length < OFP_FLOW_STATS_LENGTH || remaining(bytes) < length - 2 {
            return Err(unexpected(format!("{}", length), "length", "flow_stats"));
        }
        let table_id = bytes.read_u8()?;
        skip(bytes, 1)?;
        let match_spec = Match0x01::parse(bytes)?;
        let duration_sec = bytes.read_u32::<BigEndian>()?;
        let duration_nsec = bytes.read_u32::<BigEndian>()?;
        let priority = bytes.read_u16::<BigEndian>()?;
        let idle_timeout = bytes.read_u16::<BigEndian>()?;
        let hard_timeout = bytes.read_u16::<BigEndian>()?;
        skip(bytes, 6)?;
        let cookie = bytes.read_u64::<BigEndian>()?;
        let packet_count = bytes.read_u64::<BigEndian>()?;
        let byte_count = bytes.read_u64::<BigEndian>()?;
        let pos = bytes.position() as usize;
        let actions_len = length - OFP_FLOW_STATS_LENGTH;
        let mut action_bytes = Cursor::new(&bytes.get_ref()[pos..pos + actions_len]);
        let actions = Action0x01::parse_sequence(&mut action_bytes)?;
        skip(bytes, actions_len)?;
        Ok(FlowStats {
            table_id,
            match_spec,
            duration_sec,
            duration_nsec,
            priority,
            idle_timeout,
            hard_timeout,
            cookie,
            packet_count,
            byte_count,
            actions,
        })
    }

    fn marshal_flow_stats(stats: &FlowStats, bytes: &mut Vec<u8>) {
        bytes.put_u16(StatsRespBody0x01::flow_stats_size(stats) as u16);
        bytes.put_u8(stats.table_id);
        write_padding_bytes(bytes, 1);
        Match0x01::marshal(&stats.match_spec, bytes);
        bytes.put_u32(stats.duration_sec);
        bytes.put_u32(stats.duration_nsec);
        bytes.put_u16(stats.priority);
        bytes.put_u16(stats.idle_timeout);
        bytes.put_u16(stats.hard_timeout);
        write_padding_bytes(bytes, 6);
        bytes.put_u64(stats.cookie);
        bytes.put_u64(stats.packet_count);
        bytes.put_u64(stats.byte_count);
        Action0x01::marshal_sequence(&stats.actions, bytes);
    }

    fn parse_port_stats(bytes: &mut Cursor<&[u8]>) -> Result<PortStats, OfpSerializationError> {
        let port_no = bytes.read_u16::<BigEndian>()?;
        skip(bytes, 6)?;
        let packets = TransmissionCounter0x01::parse(bytes)?;
        let bytes_counter = TransmissionCounter0x01::parse(bytes)?;
        let dropped = TransmissionCounter0x01::parse(bytes)?;
        let errors = TransmissionCounter0x01::parse(bytes)?;
        Ok(PortStats {
            port_no,
            packets,
            bytes: bytes_counter,
            dropped,
            errors,
            rx_frame_errors: bytes.read_u64::<BigEndian>()?,
            rx_over_errors: bytes.read_u64::<BigEndian>()?,
            rx_crc_errors: bytes.read_u64::<BigEndian>()?,
            collisions: bytes.read_u64::<BigEndian>()?,
        })
    }

    fn marshal_port_stats(stats: &PortStats, bytes: &mut Vec<u8>) {
        bytes.put_u16(stats.port_no);
        write_padding_bytes(bytes, 6);
        TransmissionCounter0x01::marshal(&stats.packets, bytes);
        TransmissionCounter0x01::marshal(&stats.bytes, bytes);
        TransmissionCounter0x01::marshal(&stats.dropped, bytes);
        TransmissionCounter0x01::marshal(&stats.errors, bytes);
        bytes.put_u64(stats.rx_frame_errors);
        bytes.put_u64(stats.rx_over_errors);
        bytes.put_u64(stats.rx_crc_errors);
        bytes.put_u64(stats.collisions);
    }

    fn parse_table_stats(bytes: &mut Cursor<&[u8]>) -> Result<TableStats, OfpSerializationError> {
        let table_id = bytes.read_u8()?;
        skip(bytes, 3)?;
        Ok(TableStats {
            table_id,
            name: read_fixed_size_string(bytes, OFP_MAX_TABLE_NAME_LENGTH)?,
            wildcards: Wildcards0x01::of_int(bytes.read_u32::<BigEndian>()?),
            max_entries: bytes.read_u32::<BigEndian>()?,
            active_count: bytes.read_u32::<BigEndian>()?,
            lookup_count: bytes.read_u64::<BigEndian>()?,
            matched_count: bytes.read_u64::<BigEndian>()?,
        })
    }

    fn marshal_table_stats(stats: &TableStats, bytes: &mut Vec<u8>) {
        bytes.put_u8(stats.table_id);
        write_padding_bytes(bytes, 3);
        write_fixed_size_string(bytes, &stats.name, OFP_MAX_TABLE_NAME_LENGTH);
        bytes.put_u32(Wildcards0x01::to_int(&stats.wildcards));
        bytes.put_u32(stats.max_entries);
        bytes.put_u32(stats.active_count);
        bytes.put_u64(stats.lookup_count);
        bytes.put_u64(stats.matched_count);
    }

    fn parse_queue_stats(bytes: &mut Cursor<&[u8]>) -> Result<QueueStats, OfpSerializationError> {
        let port_no = bytes.read_u16::<BigEndian>()?;
        skip(bytes, 2)?;
        Ok(QueueStats {
            port_no,
            queue_id: bytes.read_u32::<BigEndian>()?,
            tx_bytes: bytes.read_u64::<BigEndian>()?,
            tx_packets: bytes.read_u64::<BigEndian>()?,
            tx_errors: bytes.read_u64::<BigEndian>()?,
        })
    }

    fn marshal_queue_stats(stats: &QueueStats, bytes: &mut Vec<u8>) {
        bytes.put_u16(stats.port_no);
        write_padding_bytes(bytes, 2);
        bytes.put_u32(stats.queue_id);
        bytes.put_u64(stats.tx_bytes);
        bytes.put_u64(stats.tx_packets);
        bytes.put_u64(stats.tx_errors);
    }

    fn parse_entries<T>(
        bytes: &mut Cursor<&[u8]>,
        entry_size: usize,
        parse: fn(&mut Cursor<&[u8]>) -> Result<T, OfpSerializationError>,
    ) -> Result<Vec<T>, OfpSerializationError> {
        let mut entries = vec![];
        while remaining(bytes) >= entry_size {
            entries.push(parse(bytes)?);
        }
        Ok(entries)
    }

    pub fn parse(
        req_type: StatsReqType,
        buf: &[u8],
    ) -> Result<StatsRespBody, OfpSerializationError> {
        let mut bytes = Cursor::new(buf);
        let body = match req_type {
            StatsReqType::Desc => {
                if buf.len() < OFP_DESC_STATS_LENGTH {
                    return Err(unexpected(format!("{}", buf.len()), "length", "desc_stats"));
                }
                StatsRespBody::DescBody(SwitchDesc {
                    manufacturer_desc: read_fixed_size_string(&mut bytes, DESC_STR_LENGTH)?,
                    hardware_desc: read_fixed_size_string(&mut bytes, DESC_STR_LENGTH)?,
                    software_desc: read_fixed_size_string(&mut bytes, DESC_STR_LENGTH)?,
                    serial_number: read_fixed_size_string(&mut bytes, SERIAL_NUM_LENGTH)?,
                    datapath_desc: read_fixed_size_string(&mut bytes, DESC_STR_LENGTH)?,
                })
            }
            StatsReqType::Flow => StatsRespBody::FlowStatsBody {
                flow_stats: StatsRespBody0x01::parse_entries(
                    &mut bytes,
                    OFP_FLOW_STATS_LENGTH,
                    StatsRespBody0x01::parse_flow_stats,
                )?,
            },
            StatsReqType::Aggregate => {
                let packet_count = bytes.read_u64::<BigEndian>()?;
                let byte_count = bytes.read_u64::<BigEndian>()?;
                let flow_count = bytes.read_u32::<BigEndian>()?;
                StatsRespBody::AggregateStatsBody(AggregateStats {
                    packet_count,
                    byte_count,
                    flow_count,
                })
            }
            StatsReqType::Table => StatsRespBody::TableBody {
                table_stats: StatsRespBody0x01::parse_entries(
                    &mut bytes,
                    OFP_TABLE_STATS_LENGTH,
                    StatsRespBody0x01::parse_table_stats,
                )?,
            },
            StatsReqType::Port => StatsRespBody::PortBody {
                port_stats: StatsRespBody0x01::parse_entries(
                    &mut bytes,
                    OFP_PORT_STATS_LENGTH,
                    StatsRespBody0x01::parse_port_stats,
                )?,
            },
            StatsReqType::Queue => StatsRespBody::QueueBody {
                queue_stats: StatsRespBody0x01::parse_entries(
                    &mut bytes,
                    OFP_QUEUE_STATS_LENGTH,
                    StatsRespBody0x01::parse_queue_stats,
                )?,
            },
            StatsReqType::Vendor => StatsRespBody::VendorBody(buf.to_vec()),
        };
        Ok(body)
    }

    pub fn marshal(body: &StatsRespBody, bytes: &mut Vec<u8>) {
        match *body {
            StatsRespBody::DescBody(ref desc) => {
                write_fixed_size_string(bytes, &desc.manufacturer_desc, DESC_STR_LENGTH);
                write_fixed_size_string(bytes, &desc.hardware_desc, DESC_STR_LENGTH);
                write_fixed_size_string(bytes, &desc.software_desc, DESC_STR_LENGTH);
                write_fixed_size_string(bytes, &desc.serial_number, SERIAL_NUM_LENGTH);
                write_fixed_size_string(bytes, &desc.datapath_desc, DESC_STR_LENGTH);
            }
            StatsRespBody::FlowStatsBody { ref flow_stats } => {
                for stats in flow_stats {
                    StatsRespBody0x01::marshal_flow_stats(stats, bytes);
                }
            }
            StatsRespBody::AggregateStatsBody(ref agg) => {
                bytes.put_u64(agg.packet_count);
                bytes.put_u64(agg.byte_count);
                bytes.put_u32(agg.flow_count);
                write_padding_bytes(bytes, 4);
            }
            StatsRespBody::TableBody { ref table_stats } => {
                for stats in table_stats {
                    StatsRespBody0x01::marshal_table_stats(stats, bytes);
                }
            }
            StatsRespBody::PortBody { ref port_stats } => {
                for stats in port_stats {
                    StatsRespBody0x01::marshal_port_stats(stats, bytes);
                }
            }
            StatsRespBody::QueueBody { ref queue_stats } => {
                for stats in queue_stats {
                    StatsRespBody0x01::marshal_queue_stats(stats, bytes);
                }
            }
            StatsRespBody::VendorBody(ref body) => bytes.put_slice(body),
        }
    }

    /// A single-part reply carrying `body`.
    pub fn to_reply(body: &StatsRespBody) -> StatsReply {
        let mut bytes = vec![];
        StatsRespBody0x01::marshal(body, &mut bytes);
        StatsReply {
            req_type: body.req_type(),
            flags: 0,
            body: bytes,
        }
    }
}

/// Map `Message` to associated OpenFlow message type code `MsgCode`.
pub fn msg_code_of_message(msg: &Message) -> MsgCode {
    match *msg {
        Message::Hello => MsgCode::Hello,
        Message::Error(_) => MsgCode::Error,
        Message::EchoRequest(_) => MsgCode::EchoReq,
        Message::EchoReply(_) => MsgCode::EchoResp,
        Message::Vendor(_) => MsgCode::Vendor,
        Message::FeaturesReq => MsgCode::FeaturesReq,
        Message::FeaturesReply(_) => MsgCode::FeaturesResp,
        Message::GetConfigRequest => MsgCode::GetConfigReq,
        Message::GetConfigReply(_) => MsgCode::GetConfigResp,
        Message::SetConfig(_) => MsgCode::SetConfig,
        Message::FlowMod(_) => MsgCode::FlowMod,
        Message::PacketIn(_) => MsgCode::PacketIn,
        Message::FlowRemoved(_) => MsgCode::FlowRemoved,
        Message::PortStatus(_) => MsgCode::PortStatus,
        Message::PacketOut(_) => MsgCode::PacketOut,
        Message::PortMod(_) => MsgCode::PortMod,
        Message::BarrierRequest => MsgCode::BarrierReq,
        Message::BarrierReply => MsgCode::BarrierResp,
        Message::StatsRequest(_) => MsgCode::StatsReq,
        Message::StatsReply(_) => MsgCode::StatsResp,
    }
}

fn body_size_of(msg: &Message) -> usize {
    match *msg {
        Message::Hello
        | Message::FeaturesReq
        | Message::GetConfigRequest
        | Message::BarrierRequest
        | Message::BarrierReply => 0,
        Message::Error(ref err) => err.size_of(),
        Message::EchoRequest(ref buf) | Message::EchoReply(ref buf) | Message::Vendor(ref buf) => {
            buf.len()
        }
        Message::FeaturesReply(ref sf) => sf.size_of(),
        Message::GetConfigReply(ref c) | Message::SetConfig(ref c) => c.size_of(),
        Message::FlowMod(ref flow_mod) => flow_mod.size_of(),
        Message::PacketIn(ref packet_in) => packet_in.size_of(),
        Message::FlowRemoved(ref flow) => flow.size_of(),
        Message::PortStatus(ref ps) => ps.size_of(),
        Message::PacketOut(ref po) => po.size_of(),
        Message::PortMod(ref pm) => pm.size_of(),
        Message::StatsRequest(ref sr) => sr.size_of(),
        Message::StatsReply(ref sr) => sr.size_of(),
    }
}

/// Marshal the body of the OpenFlow message `msg`.
fn marshal_body(msg: &Message, bytes: &mut Vec<u8>) {
    match *msg {
        Message::Hello
        | Message::FeaturesReq
        | Message::GetConfigRequest
        | Message::BarrierRequest
        | Message::BarrierReply => (),
        Message::Error(ref err) => err.marshal(bytes),
        Message::EchoRequest(ref buf) | Message::EchoReply(ref buf) | Message::Vendor(ref buf) => {
            bytes.put_slice(buf)
        }
        Message::FeaturesReply(ref sf) => sf.marshal(bytes),
        Message::GetConfigReply(ref c) | Message::SetConfig(ref c) => c.marshal(bytes),
        Message::FlowMod(ref flow_mod) => flow_mod.marshal(bytes),
        Message::PacketIn(ref packet_in) => packet_in.marshal(bytes),
        Message::FlowRemoved(ref flow) => flow.marshal(bytes),
        Message::PortStatus(ref sts) => sts.marshal(bytes),
        Message::PacketOut(ref po) => po.marshal(bytes),
        Message::PortMod(ref pm) => pm.marshal(bytes),
        Message::StatsRequest(ref sr) => sr.marshal(bytes),
        Message::StatsReply(ref sr) => sr.marshal(bytes),
    }
}

impl OfpMessage for Message {
    fn size_of(&self) -> usize {
        OFP_HEADER_LENGTH + body_size_of(self)
    }

    fn header_of(&self, xid: Xid) -> Result<OfpHeader, OfpSerializationError> {
        let length = self.size_of();
        if length > OFP_MAX_MESSAGE_LENGTH {
            return Err(OfpSerializationError::MessageTooLong { length });
        }
        Ok(OfpHeader::new(
            OPENFLOW_0_01_VERSION,
            msg_code_of_message(self) as u8,
            length as u16,
            xid,
        ))
    }

    fn marshal(&self, xid: Xid) -> Result<Vec<u8>, OfpSerializationError> {
        let hdr = self.header_of(xid)?;
        let mut bytes = Vec::with_capacity(hdr.length());
        OfpHeader::marshal(&mut bytes, hdr);
        marshal_body(self, &mut bytes);
        Ok(bytes)
    }

    fn parse(header: &OfpHeader, buf: &[u8]) -> Result<(Xid, Message), OfpSerializationError> {
        if header.version() != OPENFLOW_0_01_VERSION && !header.is_hello() {
            return Err(OfpSerializationError::UnsupportedVersion {
                version: header.version(),
            });
        }
        let typ = header.type_code()?;
        let msg = match typ {
            MsgCode::Hello => Message::Hello,
            MsgCode::Error => Message::Error(Error::parse(buf)?),
            MsgCode::EchoReq => Message::EchoRequest(buf.to_vec()),
            MsgCode::EchoResp => Message::EchoReply(buf.to_vec()),
            MsgCode::Vendor => Message::Vendor(buf.to_vec()),
            MsgCode::FeaturesReq => Message::FeaturesReq,
            MsgCode::FeaturesResp => Message::FeaturesReply(SwitchFeatures::parse(buf)?),
            MsgCode::GetConfigReq => Message::GetConfigRequest,
            MsgCode::GetConfigResp => Message::GetConfigReply(SwitchConfig::parse(buf)?),
            MsgCode::SetConfig => Message::SetConfig(SwitchConfig::parse(buf)?),
            MsgCode::FlowMod => Message::FlowMod(FlowMod::parse(buf)?),
            MsgCode::PacketIn => Message::PacketIn(PacketIn::parse(buf)?),
            MsgCode::FlowRemoved => Message::FlowRemoved(FlowRemoved::parse(buf)?),
            MsgCode::PortStatus => Message::PortStatus(PortStatus::parse(buf)?),
            MsgCode::PacketOut => Message::PacketOut(PacketOut::parse(buf)?),
            MsgCode::PortMod => Message::PortMod(PortMod::parse(buf)?),
            MsgCode::StatsReq => Message::StatsRequest(StatsReq::parse(buf)?),
            MsgCode::StatsResp => Message::StatsReply(StatsReply::parse(buf)?),
            MsgCode::BarrierReq => Message::BarrierRequest,
            MsgCode::BarrierResp => Message::BarrierReply,
            code => {
                return Err(OfpSerializationError::UnsupportedMessageCode {
                    version: header.version(),
                    code,
                })
            }
        };
        Ok((header.xid(), msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_XID: u32 = 0x12345678;

    fn round_trip(msg: &Message) -> Message {
        let bytes = msg.marshal(TEST_XID).unwrap();
        assert_eq!(bytes.len(), msg.size_of());
        let header = OfpHeader::parse(&bytes).unwrap();
        assert_eq!(header.length(), bytes.len());
        let (xid, parsed) = Message::parse(&header, &bytes[OFP_HEADER_LENGTH..]).unwrap();
        assert_eq!(xid, TEST_XID);
        parsed
    }

    fn sample_match() -> MatchSpec {
        let mut m = MatchSpec {
            in_port: Some(3),
            dl_src: Some(0x0000_0000_000a),
            dl_vlan: Some(None),
            dl_type: Some(0x0800),
            tp_dst: Some(80),
            ..MatchSpec::default()
        };
        m.set_nw_dst(Ipv4Addr::new(10, 1, 0, 0), 16);
        m
    }

    #[test]
    fn test_mask_serialization() {
        let mask = 8;
        let data = 0;
        let serialized = Wildcards0x01::set_nw_mask(data, 14, mask);
        let deserialized = Wildcards0x01::get_nw_mask(serialized, 14);

        assert_eq!(mask, deserialized);
    }

    #[test]
    fn test_match_wire_layout() {
        let mut bytes = vec![];
        Match0x01::marshal(&MatchSpec::match_all(), &mut bytes);
        assert_eq!(bytes.len(), OFP_MATCH_LENGTH);
        // every field bit plus 32 wildcarded bits for each address
        assert_eq!(&bytes[0..4], &[0x00, 0x38, 0x20, 0xff]);

        let mut bytes = vec![];
        Match0x01::marshal(&sample_match(), &mut bytes);
        let parsed = Match0x01::parse(&mut Cursor::new(&bytes[..])).unwrap();
        assert_eq!(parsed, sample_match());
    }

    #[test]
    fn test_flow_mod() {
        let flow_mod = FlowMod {
            cookie: 0xdead_beef,
            idle_timeout: Timeout::ExpiresAfter(10),
            notify_when_removed: true,
            buffer_id: Some(7),
            out_port: Some(PseudoPort::PhysicalPort(2)),
            actions: vec![
                Action::SetDlVlan(Some(5)),
                Action::SetDlSrc(0x0102_0304_0506),
                Action::Output(PseudoPort::Controller(128)),
                Action::Output(PseudoPort::PhysicalPort(1)),
            ],
            ..FlowMod::new(FlowModCmd::ModStrictFlow, sample_match(), 100)
        };
        let msg = Message::FlowMod(flow_mod);
        let bytes = msg.marshal(TEST_XID).unwrap();
        assert_eq!(bytes.len(), 8 + 40 + 24 + 8 + 16 + 8 + 8);
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_bad_action_length() {
        let mut bytes = vec![];
        bytes.put_u16(0);
        bytes.put_u16(6);
        bytes.put_u16(1);
        assert!(Action0x01::parse_sequence(&mut Cursor::new(&bytes[..])).is_err());
    }

    #[test]
    fn test_packet_in_and_out() {
        let packet_in = Message::PacketIn(PacketIn {
            input_payload: Payload::Buffered(9, vec![1, 2, 3, 4]),
            total_len: 60,
            port: 2,
            reason: PacketInReason::NoMatch,
        });
        assert_eq!(round_trip(&packet_in), packet_in);

        let packet_out = Message::PacketOut(PacketOut {
            output_payload: Payload::NotBuffered(vec![0xab; 20]),
            port_id: None,
            apply_actions: vec![Action::Output(PseudoPort::Flood)],
        });
        assert_eq!(round_trip(&packet_out), packet_out);
    }

    #[test]
    fn test_features_reply() {
        let features = Message::FeaturesReply(SwitchFeatures {
            datapath_id: 0x0011_2233_4455_6677,
            num_buffers: 100,
            num_tables: 1,
            supported_capabilities: Capabilities {
                flow_stats: true,
                port_stats: true,
                ..Capabilities::default()
            },
            supported_actions: SupportedActions {
                output: true,
                strip_vlan: true,
                ..SupportedActions::default()
            },
            ports: vec![
                PortDesc::new(1, 0xaabb_ccdd_eeff, "port_1"),
                PortDesc::new(2, 0x02, "port_2"),
            ],
        });
        let bytes = features.marshal(TEST_XID).unwrap();
        assert_eq!(bytes.len(), 8 + 24 + 2 * 48);
        assert_eq!(round_trip(&features), features);
    }

    #[test]
    fn test_error_and_port_status() {
        let error = Message::Error(Error::Error(
            ErrorType::BadRequest(BadRequest::BufferUnknown),
            vec![1; 12],
        ));
        assert_eq!(round_trip(&error), error);

        let status = Message::PortStatus(PortStatus {
            reason: PortReason::PortModify,
            desc: PortDesc::new(4, 0x04, "port_4"),
        });
        assert_eq!(round_trip(&status), status);
    }

    #[test]
    fn test_stats_reply_body() {
        let flow_stats = FlowStats {
            table_id: 0,
            match_spec: sample_match(),
            duration_sec: 5,
            duration_nsec: 0,
            priority: 10,
            idle_timeout: 0,
            hard_timeout: 30,
            cookie: 1,
            packet_count: 2,
            byte_count: 120,
            actions: vec![Action::Output(PseudoPort::PhysicalPort(1))],
        };
        assert_eq!(StatsRespBody0x01::flow_stats_size(&flow_stats), 96);
        let body = StatsRespBody::FlowStatsBody {
            flow_stats: vec![flow_stats.clone(), flow_stats],
        };
        let reply = StatsRespBody0x01::to_reply(&body);
        assert_eq!(reply.body.len(), 192);
        let msg = Message::StatsReply(reply.clone());
        assert_eq!(round_trip(&msg), msg);
        assert_eq!(StatsRespBody0x01::parse(reply.req_type, &reply.body).unwrap(), body);

        let desc = StatsRespBody::DescBody(SwitchDesc {
            manufacturer_desc: "rust_pox".to_string(),
            ..SwitchDesc::default()
        });
        let reply = StatsRespBody0x01::to_reply(&desc);
        assert_eq!(reply.body.len(), OFP_DESC_STATS_LENGTH);
        assert_eq!(StatsRespBody0x01::parse(StatsReqType::Desc, &reply.body).unwrap(), desc);
    }

    #[test]
    fn test_stats_request() {
        let msg = Message::StatsRequest(StatsReq::flow(sample_match(), OFPP_NONE));
        let bytes = msg.marshal(TEST_XID).unwrap();
        assert_eq!(bytes.len(), 8 + 4 + 44);
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn test_unsupported_version() {
        let header = OfpHeader::new(4, MsgCode::BarrierReq as u8, 8, 1);
        assert!(Message::parse(&header, &[]).is_err());
        let hello = OfpHeader::new(4, MsgCode::Hello as u8, 8, 1);
        assert_eq!(Message::parse(&hello, &[]).unwrap().1, Message::Hello);
    }

    #[test]
    fn test_message_too_long() {
        let msg = Message::EchoRequest(vec![0; OFP_MAX_MESSAGE_LENGTH]);
        assert!(msg.marshal(1).is_err());
    }
}
