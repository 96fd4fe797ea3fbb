use std::fmt;
use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;

use crate::message::Wildcards;
use crate::packet::{format_mac, Nw, Packet, PacketError};

/// `dl_vlan` value of an untagged frame on the wire.
pub const OFP_VLAN_NONE: u16 = 0xffff;

/// Fields of a `MatchSpec`, for wildcard queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MatchField {
    InPort,
    DlSrc,
    DlDst,
    DlVlan,
    DlVlanPcp,
    DlType,
    NwTos,
    NwProto,
    NwSrc,
    NwDst,
    TpSrc,
    TpDst,
}

/// Build an IPv4 prefix match. A zero-length (or out of range) prefix matches every
/// address and is represented as a wildcard.
pub fn ipv4_prefix(addr: Ipv4Addr, prefix: u8) -> Option<Ipv4Network> {
    if prefix == 0 {
        return None;
    }
    Ipv4Network::new(addr, prefix).ok()
}

/// Fields to match against flows.
///
/// `None` means the field is wildcarded. `dl_vlan` uses `Some(None)` for frames without
/// an 802.1Q tag.
#[derive(Clone, Copy, Debug, Default)]
pub struct MatchSpec {
    pub in_port: Option<u16>,
    pub dl_src: Option<u64>,
    pub dl_dst: Option<u64>,
    pub dl_vlan: Option<Option<u16>>,
    pub dl_vlan_pcp: Option<u8>,
    pub dl_type: Option<u16>,
    pub nw_tos: Option<u8>,
    pub nw_proto: Option<u8>,
    pub nw_src: Option<Ipv4Network>,
    pub nw_dst: Option<Ipv4Network>,
    pub tp_src: Option<u16>,
    pub tp_dst: Option<u16>,
}

fn normalized(net: &Option<Ipv4Network>) -> Option<(Ipv4Addr, u8)> {
    match net {
        Some(n) if n.prefix() > 0 => Some((n.network(), n.prefix())),
        _ => None,
    }
}

fn covers<T: PartialEq>(general: &Option<T>, specific: &Option<T>) -> bool {
    match general {
        None => true,
        Some(value) => specific.as_ref() == Some(value),
    }
}

fn ip_covers(general: &Option<Ipv4Network>, specific: &Option<Ipv4Network>) -> bool {
    match (normalized(general), normalized(specific)) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some((g_addr, g_prefix)), Some((s_addr, s_prefix))) => {
            g_prefix <= s_prefix
                && Ipv4Network::new(g_addr, g_prefix)
                    .map(|g| g.contains(s_addr))
                    .unwrap_or(false)
        }
    }
}

impl PartialEq for MatchSpec {
    fn eq(&self, other: &MatchSpec) -> bool {
        self.in_port == other.in_port
            && self.dl_src == other.dl_src
            && self.dl_dst == other.dl_dst
            && self.dl_vlan == other.dl_vlan
            && self.dl_vlan_pcp == other.dl_vlan_pcp
            && self.dl_type == other.dl_type
            && self.nw_tos == other.nw_tos
            && self.nw_proto == other.nw_proto
            && normalized(&self.nw_src) == normalized(&other.nw_src)
            && normalized(&self.nw_dst) == normalized(&other.nw_dst)
            && self.tp_src == other.tp_src
            && self.tp_dst == other.tp_dst
    }
}

impl Eq for MatchSpec {}

impl MatchSpec {
    /// A match with every field wildcarded.
    pub fn match_all() -> MatchSpec {
        MatchSpec::default()
    }

    pub fn set_nw_src(&mut self, addr: Ipv4Addr, prefix: u8) {
        self.nw_src = ipv4_prefix(addr, prefix);
    }

    pub fn set_nw_dst(&mut self, addr: Ipv4Addr, prefix: u8) {
        self.nw_dst = ipv4_prefix(addr, prefix);
    }

    /// Derive the fully specified match of a decoded packet received on `in_port`.
    /// Fields the packet does not carry stay wildcarded.
    pub fn from_packet(packet: &Packet, in_port: u16) -> MatchSpec {
        let mut m = MatchSpec {
            in_port: Some(in_port),
            dl_src: Some(packet.dl_src),
            dl_dst: Some(packet.dl_dst),
            dl_vlan: Some(packet.dl_vlan),
            dl_vlan_pcp: Some(packet.dl_vlan_pcp),
            dl_type: Some(packet.dl_typ),
            ..MatchSpec::default()
        };
        match packet.nw {
            Some(Nw::Ip(ref ip)) => {
                m.nw_tos = Some(ip.tos);
                m.nw_proto = Some(ip.proto);
                m.set_nw_src(ip.src, 32);
                m.set_nw_dst(ip.dst, 32);
                if let Some(tp) = ip.tp {
                    let (src, dst) = tp.ports();
                    m.tp_src = Some(src);
                    m.tp_dst = Some(dst);
                }
            }
            Some(Nw::Arp(ref arp)) => {
                m.nw_proto = Some((arp.opcode & 0xff) as u8);
                m.set_nw_src(arp.spa, 32);
                m.set_nw_dst(arp.tpa, 32);
            }
            None => {}
        }
        m
    }

    /// Parse `frame` and derive its match.
    pub fn from_frame(frame: &[u8], in_port: u16) -> Result<MatchSpec, PacketError> {
        let packet = Packet::parse(frame)?;
        Ok(MatchSpec::from_packet(&packet, in_port))
    }

    /// Whether every packet matched by `other` is also matched by `self`.
    pub fn subsumes(&self, other: &MatchSpec) -> bool {
        covers(&self.in_port, &other.in_port)
            && covers(&self.dl_src, &other.dl_src)
            && covers(&self.dl_dst, &other.dl_dst)
            && covers(&self.dl_vlan, &other.dl_vlan)
            && covers(&self.dl_vlan_pcp, &other.dl_vlan_pcp)
            && covers(&self.dl_type, &other.dl_type)
            && covers(&self.nw_tos, &other.nw_tos)
            && covers(&self.nw_proto, &other.nw_proto)
            && ip_covers(&self.nw_src, &other.nw_src)
            && ip_covers(&self.nw_dst, &other.nw_dst)
            && covers(&self.tp_src, &other.tp_src)
            && covers(&self.tp_dst, &other.tp_dst)
    }

    /// Whether a packet, given as the match derived from it, is matched by `self`.
    pub fn matches(&self, packet: &MatchSpec) -> bool {
        self.subsumes(packet)
    }

    pub fn is_wildcarded(&self, field: MatchField) -> bool {
        match field {
            MatchField::InPort => self.in_port.is_none(),
            MatchField::DlSrc => self.dl_src.is_none(),
            MatchField::DlDst => self.dl_dst.is_none(),
            MatchField::DlVlan => self.dl_vlan.is_none(),
            MatchField::DlVlanPcp => self.dl_vlan_pcp.is_none(),
            MatchField::DlType => self.dl_type.is_none(),
            MatchField::NwTos => self.nw_tos.is_none(),
            MatchField::NwProto => self.nw_proto.is_none(),
            MatchField::NwSrc => normalized(&self.nw_src).is_none(),
            MatchField::NwDst => normalized(&self.nw_dst).is_none(),
            MatchField::TpSrc => self.tp_src.is_none(),
            MatchField::TpDst => self.tp_dst.is_none(),
        }
    }

    /// No field wildcarded and both IP fields constrained to a single address.
    pub fn is_exact(&self) -> bool {
        let w = self.wildcards();
        !(w.in_port
            || w.dl_vlan
            || w.dl_src
            || w.dl_dst
            || w.dl_type
            || w.nw_proto
            || w.tp_src
            || w.tp_dst
            || w.dl_vlan_pcp
            || w.nw_tos)
            && w.nw_src == 0
            && w.nw_dst == 0
    }

    /// Wire wildcard representation. IP fields count wildcarded low-order bits.
    pub fn wildcards(&self) -> Wildcards {
        let nw_bits = |net: &Option<Ipv4Network>| match normalized(net) {
            Some((_, prefix)) => 32 - u32::from(prefix),
            None => 32,
        };
        Wildcards {
            in_port: self.in_port.is_none(),
            dl_vlan: self.dl_vlan.is_none(),
            dl_src: self.dl_src.is_none(),
            dl_dst: self.dl_dst.is_none(),
            dl_type: self.dl_type.is_none(),
            nw_proto: self.nw_proto.is_none(),
            tp_src: self.tp_src.is_none(),
            tp_dst: self.tp_dst.is_none(),
            nw_src: nw_bits(&self.nw_src),
            nw_dst: nw_bits(&self.nw_dst),
            dl_vlan_pcp: self.dl_vlan_pcp.is_none(),
            nw_tos: self.nw_tos.is_none(),
        }
    }
}

impl fmt::Display for MatchSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut parts = vec![];
        if let Some(p) = self.in_port {
            parts.push(format!("in_port={}", p));
        }
        if let Some(mac) = self.dl_src {
            parts.push(format!("dl_src={}", format_mac(mac)));
        }
        if let Some(mac) = self.dl_dst {
            parts.push(format!("dl_dst={}", format_mac(mac)));
        }
        match self.dl_vlan {
            Some(Some(vlan)) => parts.push(format!("dl_vlan={}", vlan)),
            Some(None) => parts.push(format!("dl_vlan=0x{:04x}", OFP_VLAN_NONE)),
            None => {}
        }
        if let Some(pcp) = self.dl_vlan_pcp {
            parts.push(format!("dl_vlan_pcp={}", pcp));
        }
        if let Some(typ) = self.dl_type {
            parts.push(format!("dl_type=0x{:04x}", typ));
        }
        if let Some(tos) = self.nw_tos {
            parts.push(format!("nw_tos={}", tos));
        }
        if let Some(proto) = self.nw_proto {
            parts.push(format!("nw_proto={}", proto));
        }
        if let Some((addr, prefix)) = normalized(&self.nw_src) {
            parts.push(format!("nw_src={}/{}", addr, prefix));
        }
        if let Some((addr, prefix)) = normalized(&self.nw_dst) {
            parts.push(format!("nw_dst={}/{}", addr, prefix));
        }
        if let Some(port) = self.tp_src {
            parts.push(format!("tp_src={}", port));
        }
        if let Some(port) = self.tp_dst {
            parts.push(format!("tp_dst={}", port));
        }
        if parts.is_empty() {
            write!(f, "*")
        } else {
            write!(f, "{}", parts.join(","))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::test_frames::{arp_frame, tcp_frame};
    use crate::packet::{ETH_TYPE_ARP, ETH_TYPE_IP, IP_PROTO_TCP};

    fn ip(a: u8, b: u8, c: u8, d: u8) -> Ipv4Addr {
        Ipv4Addr::new(a, b, c, d)
    }

    #[test]
    fn test_zero_prefix_is_wildcard() {
        let mut m = MatchSpec::match_all();
        m.nw_src = Ipv4Network::new(ip(10, 0, 0, 1), 0).ok();
        assert_eq!(m, MatchSpec::match_all());
        assert!(m.is_wildcarded(MatchField::NwSrc));
        assert_eq!(ipv4_prefix(ip(10, 0, 0, 1), 0), None);
    }

    #[test]
    fn test_prefix_equality_ignores_host_bits() {
        let mut a = MatchSpec::match_all();
        a.set_nw_dst(ip(10, 1, 2, 3), 8);
        let mut b = MatchSpec::match_all();
        b.set_nw_dst(ip(10, 0, 0, 0), 8);
        assert_eq!(a, b);
        b.set_nw_dst(ip(10, 0, 0, 0), 16);
        assert_ne!(a, b);
    }

    #[test]
    fn test_subsumes() {
        let all = MatchSpec::match_all();
        let port1 = MatchSpec {
            in_port: Some(1),
            ..MatchSpec::default()
        };
        let mut port1_net = port1;
        port1_net.set_nw_src(ip(10, 0, 0, 0), 8);
        let mut port1_host = port1;
        port1_host.set_nw_src(ip(10, 1, 1, 1), 32);
        let mut port1_other_host = port1;
        port1_other_host.set_nw_src(ip(11, 1, 1, 1), 32);

        assert!(all.subsumes(&port1));
        assert!(!port1.subsumes(&all));
        assert!(port1.subsumes(&port1_net));
        assert!(port1_net.subsumes(&port1_host));
        assert!(!port1_host.subsumes(&port1_net));
        assert!(!port1_net.subsumes(&port1_other_host));
        assert!(port1_host.subsumes(&port1_host));
    }

    #[test]
    fn test_untagged_vlan_is_distinct() {
        let untagged = MatchSpec {
            dl_vlan: Some(None),
            ..MatchSpec::default()
        };
        let tagged = MatchSpec {
            dl_vlan: Some(Some(10)),
            ..MatchSpec::default()
        };
        assert!(!untagged.subsumes(&tagged));
        assert!(!tagged.subsumes(&untagged));
        assert!(MatchSpec::match_all().subsumes(&untagged));
    }

    #[test]
    fn test_from_tcp_frame() {
        let frame = tcp_frame(0x0a, 0x0b, [10, 0, 0, 1], [10, 0, 0, 2], 4000, 22);
        let m = MatchSpec::from_frame(&frame, 3).unwrap();
        assert!(m.is_exact());
        assert_eq!(m.in_port, Some(3));
        assert_eq!(m.dl_vlan, Some(None));
        assert_eq!(m.dl_vlan_pcp, Some(0));
        assert_eq!(m.dl_type, Some(ETH_TYPE_IP));
        assert_eq!(m.nw_proto, Some(IP_PROTO_TCP));
        assert_eq!(m.tp_src, Some(4000));
        assert_eq!(m.tp_dst, Some(22));

        let mut rule = MatchSpec {
            dl_type: Some(ETH_TYPE_IP),
            tp_dst: Some(22),
            ..MatchSpec::default()
        };
        rule.set_nw_dst(ip(10, 0, 0, 0), 24);
        assert!(rule.matches(&m));
        rule.tp_dst = Some(23);
        assert!(!rule.matches(&m));
    }

    #[test]
    fn test_from_arp_frame() {
        let frame = arp_frame(0x0a, 2, [10, 0, 0, 7], [10, 0, 0, 1]);
        let m = MatchSpec::from_frame(&frame, 1).unwrap();
        assert_eq!(m.dl_type, Some(ETH_TYPE_ARP));
        assert_eq!(m.nw_proto, Some(2));
        assert_eq!(normalized(&m.nw_src), Some((ip(10, 0, 0, 7), 32)));
        assert_eq!(m.tp_src, None);
        assert!(!m.is_exact());

        let tcp_rule = MatchSpec {
            tp_dst: Some(80),
            ..MatchSpec::default()
        };
        assert!(!tcp_rule.matches(&m));
    }

    #[test]
    fn test_wildcards() {
        let mut m = MatchSpec {
            in_port: Some(1),
            ..MatchSpec::default()
        };
        m.set_nw_src(ip(192, 168, 0, 0), 16);
        let w = m.wildcards();
        assert!(!w.in_port);
        assert!(w.dl_src);
        assert_eq!(w.nw_src, 16);
        assert_eq!(w.nw_dst, 32);
    }

    #[test]
    fn test_display() {
        assert_eq!(MatchSpec::match_all().to_string(), "*");
        let mut m = MatchSpec {
            in_port: Some(2),
            dl_src: Some(0x0a),
            ..MatchSpec::default()
        };
        m.set_nw_dst(ip(10, 9, 9, 9), 8);
        assert_eq!(m.to_string(), "in_port=2,dl_src=00:00:00:00:00:0a,nw_dst=10.0.0.0/8");
    }
}
