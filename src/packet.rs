use std::io;
use std::io::Cursor;
use std::net::Ipv4Addr;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};

use crate::message::Action;

pub const ETH_HEADER_LENGTH: usize = 14;
pub const VLAN_TAG_LENGTH: usize = 4;

pub const ETH_TYPE_IP: u16 = 0x0800;
pub const ETH_TYPE_ARP: u16 = 0x0806;
pub const ETH_TYPE_VLAN: u16 = 0x8100;

pub const IP_PROTO_ICMP: u8 = 1;
pub const IP_PROTO_TCP: u8 = 6;
pub const IP_PROTO_UDP: u8 = 17;

#[derive(Debug, Fail)]
pub enum PacketError {
    #[fail(display = "Truncated packet: {}", error)]
    Truncated { error: io::Error },
    #[fail(display = "Malformed {} header: {}", layer, message)]
    Malformed { layer: &'static str, message: String },
}

impl From<io::Error> for PacketError {
    fn from(error: io::Error) -> Self {
        PacketError::Truncated { error }
    }
}

pub fn bytes_of_mac(addr: u64) -> [u8; 6] {
    let mut arr = [0u8; 6];
    for (i, byte) in arr.iter_mut().enumerate() {
        *byte = ((addr >> (8 * (5 - i))) & 0xff) as u8;
    }
    arr
}

pub fn mac_of_bytes(addr: [u8; 6]) -> u64 {
    addr.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

pub fn format_mac(addr: u64) -> String {
    let b = bytes_of_mac(addr);
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        b[0], b[1], b[2], b[3], b[4], b[5]
    )
}

/// Transport-layer fields, ICMP type and code included.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    Tcp { src: u16, dst: u16 },
    Udp { src: u16, dst: u16 },
    Icmp { typ: u8, code: u8 },
}

impl Transport {
    /// The pair OpenFlow matches as `tp_src` / `tp_dst`.
    pub fn ports(&self) -> (u16, u16) {
        match *self {
            Transport::Tcp { src, dst } | Transport::Udp { src, dst } => (src, dst),
            Transport::Icmp { typ, code } => (u16::from(typ), u16::from(code)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ip {
    pub tos: u8,
    pub proto: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    /// Offset of the transport header within the frame.
    pub l4_offset: usize,
    /// `None` for non-first fragments and unknown protocols.
    pub tp: Option<Transport>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Arp {
    pub opcode: u16,
    pub spa: Ipv4Addr,
    pub tpa: Ipv4Addr,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Nw {
    Ip(Ip),
    Arp(Arp),
}

/// Decoded headers of an Ethernet frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub dl_src: u64,
    pub dl_dst: u64,
    pub dl_vlan: Option<u16>,
    pub dl_vlan_pcp: u8,
    pub dl_typ: u16,
    /// Offset of the network header within the frame.
    pub l3_offset: usize,
    pub nw: Option<Nw>,
}

fn read_mac(bytes: &mut Cursor<&[u8]>) -> Result<u64, PacketError> {
    let mut arr = [0u8; 6];
    for byte in arr.iter_mut() {
        *byte = bytes.read_u8()?;
    }
    Ok(mac_of_bytes(arr))
}

impl Packet {
    pub fn parse(frame: &[u8]) -> Result<Packet, PacketError> {
        let mut bytes = Cursor::new(frame);
        let dl_dst = read_mac(&mut bytes)?;
        let dl_src = read_mac(&mut bytes)?;
        let mut dl_typ = bytes.read_u16::<BigEndian>()?;
        let mut dl_vlan = None;
        let mut dl_vlan_pcp = 0;
        if dl_typ == ETH_TYPE_VLAN {
            let tci = bytes.read_u16::<BigEndian>()?;
            dl_vlan = Some(tci & 0x0fff);
            dl_vlan_pcp = (tci >> 13) as u8;
            dl_typ = bytes.read_u16::<BigEndian>()?;
        }
        let l3_offset = bytes.position() as usize;
        let nw = match dl_typ {
            ETH_TYPE_IP => Some(Nw::Ip(Packet::parse_ip(&frame[l3_offset..], l3_offset)?)),
            ETH_TYPE_ARP => Some(Nw::Arp(Packet::parse_arp(&frame[l3_offset..])?)),
            _ => None,
        };
        Ok(Packet {
            dl_src,
            dl_dst,
            dl_vlan,
            dl_vlan_pcp,
            dl_typ,
            l3_offset,
            nw,
        })
    }

    fn parse_ip(buf: &[u8], l3_offset: usize) -> Result<Ip, PacketError> {
        let mut bytes = Cursor::new(buf);
        let vhl = bytes.read_u8()?;
        if vhl >> 4 != 4 {
            return Err(PacketError::Malformed {
                layer: "ipv4",
                message: format!("version {}", vhl >> 4),
            });
        }
        let ihl = usize::from(vhl & 0x0f) * 4;
        if ihl < 20 || buf.len() < ihl {
            return Err(PacketError::Malformed {
                layer: "ipv4",
                message: format!("header length {}", ihl),
            });
        }
        let tos = bytes.read_u8()?;
        let _total_len = bytes.read_u16::<BigEndian>()?;
        let _ident = bytes.read_u16::<BigEndian>()?;
        let frag = bytes.read_u16::<BigEndian>()?;
        let _ttl = bytes.read_u8()?;
        let proto = bytes.read_u8()?;
        let _csum = bytes.read_u16::<BigEndian>()?;
        let src = Ipv4Addr::from(bytes.read_u32::<BigEndian>()?);
        let dst = Ipv4Addr::from(bytes.read_u32::<BigEndian>()?);

        let first_fragment = frag & 0x1fff == 0;
        let mut l4 = Cursor::new(&buf[ihl..]);
        let tp = if !first_fragment {
            None
        } else {
            match proto {
                IP_PROTO_TCP | IP_PROTO_UDP => {
                    let src = l4.read_u16::<BigEndian>()?;
                    let dst = l4.read_u16::<BigEndian>()?;
                    if proto == IP_PROTO_TCP {
                        Some(Transport::Tcp { src, dst })
                    } else {
                        Some(Transport::Udp { src, dst })
                    }
                }
                IP_PROTO_ICMP => Some(Transport::Icmp {
                    typ: l4.read_u8()?,
                    code: l4.read_u8()?,
                }),
                _ => None,
            }
        };
        Ok(Ip {
            tos,
            proto,
            src,
            dst,
            l4_offset: l3_offset + ihl,
            tp,
        })
    }

    fn parse_arp(buf: &[u8]) -> Result<Arp, PacketError> {
        let mut bytes = Cursor::new(buf);
        let _htype = bytes.read_u16::<BigEndian>()?;
        let ptype = bytes.read_u16::<BigEndian>()?;
        let hlen = bytes.read_u8()?;
        let plen = bytes.read_u8()?;
        if ptype != ETH_TYPE_IP || hlen != 6 || plen != 4 {
            return Err(PacketError::Malformed {
                layer: "arp",
                message: format!("ptype 0x{:x} hlen {} plen {}", ptype, hlen, plen),
            });
        }
        let opcode = bytes.read_u16::<BigEndian>()?;
        let _sha = read_mac(&mut bytes)?;
        let spa = Ipv4Addr::from(bytes.read_u32::<BigEndian>()?);
        let _tha = read_mac(&mut bytes)?;
        let tpa = Ipv4Addr::from(bytes.read_u32::<BigEndian>()?);
        Ok(Arp { opcode, spa, tpa })
    }

    pub fn ip(&self) -> Option<&Ip> {
        match self.nw {
            Some(Nw::Ip(ref ip)) => Some(ip),
            _ => None,
        }
    }
}

/// RFC 1624 incremental update of a ones-complement checksum after one 16-bit word
/// changed from `old` to `new`.
pub fn checksum_adjust(checksum: u16, old: u16, new: u16) -> u16 {
    let mut sum = u32::from(!checksum) + u32::from(!old) + u32::from(new);
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Ones-complement checksum of `buf`, as used by the IPv4 header.
pub fn checksum(buf: &[u8]) -> u16 {
    let mut sum = 0u32;
    for chunk in buf.chunks(2) {
        let word = if chunk.len() == 2 {
            BigEndian::read_u16(chunk)
        } else {
            u16::from(chunk[0]) << 8
        };
        sum += u32::from(word);
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn recompute_ip_checksum(frame: &mut [u8], l3: usize, l4: usize) {
    frame[l3 + 10] = 0;
    frame[l3 + 11] = 0;
    let csum = checksum(&frame[l3..l4]);
    BigEndian::write_u16(&mut frame[l3 + 10..l3 + 12], csum);
}

/// Offset of the transport checksum in `frame`, if the packet carries one that must be
/// kept consistent.
fn transport_checksum_offset(frame: &[u8], ip: &Ip) -> Option<usize> {
    let offset = match ip.tp {
        Some(Transport::Tcp { .. }) => ip.l4_offset + 16,
        Some(Transport::Udp { .. }) => ip.l4_offset + 6,
        _ => return None,
    };
    if frame.len() < offset + 2 {
        return None;
    }
    if let Some(Transport::Udp { .. }) = ip.tp {
        // zero means the sender did not compute one
        if BigEndian::read_u16(&frame[offset..offset + 2]) == 0 {
            return None;
        }
    }
    Some(offset)
}

fn adjust_transport_checksum(frame: &mut [u8], ip: &Ip, old: u16, new: u16) {
    if let Some(offset) = transport_checksum_offset(frame, ip) {
        let csum = BigEndian::read_u16(&frame[offset..offset + 2]);
        let mut adjusted = checksum_adjust(csum, old, new);
        if adjusted == 0 {
            if let Some(Transport::Udp { .. }) = ip.tp {
                adjusted = 0xffff;
            }
        }
        BigEndian::write_u16(&mut frame[offset..offset + 2], adjusted);
    }
}

fn rewrite_nw_addr(frame: &mut [u8], ip: &Ip, l3: usize, offset: usize, addr: u32) {
    let old_hi = BigEndian::read_u16(&frame[offset..offset + 2]);
    let old_lo = BigEndian::read_u16(&frame[offset + 2..offset + 4]);
    BigEndian::write_u32(&mut frame[offset..offset + 4], addr);
    // addresses are part of the TCP/UDP pseudo-header
    adjust_transport_checksum(frame, ip, old_hi, (addr >> 16) as u16);
    adjust_transport_checksum(frame, ip, old_lo, (addr & 0xffff) as u16);
    recompute_ip_checksum(frame, l3, ip.l4_offset);
}

fn rewrite_tp_port(frame: &mut [u8], ip: &Ip, offset: usize, port: u16) {
    if frame.len() < offset + 2 {
        return;
    }
    let old = BigEndian::read_u16(&frame[offset..offset + 2]);
    BigEndian::write_u16(&mut frame[offset..offset + 2], port);
    adjust_transport_checksum(frame, ip, old, port);
}

fn set_vlan_tci(frame: &mut Vec<u8>, tagged: bool, keep_mask: u16, bits: u16) {
    if tagged {
        let tci = BigEndian::read_u16(&frame[14..16]);
        BigEndian::write_u16(&mut frame[14..16], (tci & keep_mask) | bits);
    } else {
        let mut tag = [0u8; VLAN_TAG_LENGTH];
        BigEndian::write_u16(&mut tag[0..2], ETH_TYPE_VLAN);
        BigEndian::write_u16(&mut tag[2..4], bits);
        frame.splice(12..12, tag.iter().cloned());
    }
}

/// Apply a header-rewriting action to `frame` in place. Output actions and rewrites of
/// headers the frame does not carry leave it unchanged.
pub fn rewrite(frame: &mut Vec<u8>, action: &Action) -> Result<(), PacketError> {
    let packet = Packet::parse(frame)?;
    let tagged = packet.dl_vlan.is_some();
    match *action {
        Action::Output(_) | Action::Enqueue(_, _) => {}
        Action::SetDlVlan(Some(vid)) => set_vlan_tci(frame, tagged, 0xf000, vid & 0x0fff),
        Action::SetDlVlan(None) => {
            if tagged {
                frame.drain(12..12 + VLAN_TAG_LENGTH);
            }
        }
        Action::SetDlVlanPcp(pcp) => {
            set_vlan_tci(frame, tagged, 0x0fff, u16::from(pcp & 0x07) << 13)
        }
        Action::SetDlSrc(mac) => frame[6..12].copy_from_slice(&bytes_of_mac(mac)),
        Action::SetDlDst(mac) => frame[0..6].copy_from_slice(&bytes_of_mac(mac)),
        Action::SetNwSrc(addr) => {
            if let Some(ip) = packet.ip() {
                rewrite_nw_addr(frame, ip, packet.l3_offset, packet.l3_offset + 12, addr);
            }
        }
        Action::SetNwDst(addr) => {
            if let Some(ip) = packet.ip() {
                rewrite_nw_addr(frame, ip, packet.l3_offset, packet.l3_offset + 16, addr);
            }
        }
        Action::SetNwTos(tos) => {
            if let Some(ip) = packet.ip() {
                let l3 = packet.l3_offset;
                frame[l3 + 1] = (frame[l3 + 1] & 0x03) | (tos & 0xfc);
                recompute_ip_checksum(frame, l3, ip.l4_offset);
            }
        }
        Action::SetTpSrc(port) | Action::SetTpDst(port) => {
            if let Some(ip) = packet.ip() {
                match ip.tp {
                    Some(Transport::Tcp { .. }) | Some(Transport::Udp { .. }) => {
                        let offset = match *action {
                            Action::SetTpSrc(_) => ip.l4_offset,
                            _ => ip.l4_offset + 2,
                        };
                        rewrite_tp_port(frame, ip, offset, port);
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_frames::*;
    use super::*;

    fn tcp_checksum_ok(frame: &[u8]) -> bool {
        let packet = Packet::parse(frame).unwrap();
        let ip = packet.ip().unwrap();
        let l3 = packet.l3_offset;
        let mut src = [0u8; 4];
        let mut dst = [0u8; 4];
        src.copy_from_slice(&frame[l3 + 12..l3 + 16]);
        dst.copy_from_slice(&frame[l3 + 16..l3 + 20]);
        checksum(&frame[l3..ip.l4_offset]) == 0
            && tcp_checksum(&src, &dst, &frame[ip.l4_offset..]) == 0
    }

    #[test]
    fn test_mac_conversion() {
        let mac = 0x0102_0304_0506;
        assert_eq!(bytes_of_mac(mac), [1, 2, 3, 4, 5, 6]);
        assert_eq!(mac_of_bytes([1, 2, 3, 4, 5, 6]), mac);
        assert_eq!(format_mac(mac), "01:02:03:04:05:06");
    }

    #[test]
    fn test_parse_tcp() {
        let frame = tcp_frame(1, 2, [10, 0, 0, 1], [10, 0, 0, 2], 1234, 80);
        let packet = Packet::parse(&frame).unwrap();
        assert_eq!(packet.dl_src, 1);
        assert_eq!(packet.dl_dst, 2);
        assert_eq!(packet.dl_vlan, None);
        assert_eq!(packet.dl_typ, ETH_TYPE_IP);
        let ip = packet.ip().unwrap();
        assert_eq!(ip.src, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(ip.proto, IP_PROTO_TCP);
        assert_eq!(ip.tos, 0x10);
        assert_eq!(ip.tp, Some(Transport::Tcp { src: 1234, dst: 80 }));
        assert!(tcp_checksum_ok(&frame));
    }

    #[test]
    fn test_parse_arp() {
        let frame = arp_frame(7, 1, [10, 0, 0, 7], [10, 0, 0, 1]);
        let packet = Packet::parse(&frame).unwrap();
        assert_eq!(
            packet.nw,
            Some(Nw::Arp(Arp {
                opcode: 1,
                spa: Ipv4Addr::new(10, 0, 0, 7),
                tpa: Ipv4Addr::new(10, 0, 0, 1),
            }))
        );
    }

    #[test]
    fn test_parse_truncated() {
        assert!(Packet::parse(&[0u8; 10]).is_err());
        let frame = tcp_frame(1, 2, [10, 0, 0, 1], [10, 0, 0, 2], 1234, 80);
        assert!(Packet::parse(&frame[..30]).is_err());
    }

    #[test]
    fn test_vlan_push_pop() {
        let original = tcp_frame(1, 2, [10, 0, 0, 1], [10, 0, 0, 2], 1234, 80);
        let mut frame = original.clone();
        rewrite(&mut frame, &Action::SetDlVlan(Some(42))).unwrap();
        assert_eq!(frame.len(), original.len() + VLAN_TAG_LENGTH);
        let packet = Packet::parse(&frame).unwrap();
        assert_eq!(packet.dl_vlan, Some(42));
        assert_eq!(packet.dl_typ, ETH_TYPE_IP);

        rewrite(&mut frame, &Action::SetDlVlanPcp(5)).unwrap();
        let packet = Packet::parse(&frame).unwrap();
        assert_eq!(packet.dl_vlan, Some(42));
        assert_eq!(packet.dl_vlan_pcp, 5);

        rewrite(&mut frame, &Action::SetDlVlan(None)).unwrap();
        assert_eq!(frame, original);
    }

    #[test]
    fn test_rewrite_keeps_checksums_valid() {
        let mut frame = tcp_frame(1, 2, [10, 0, 0, 1], [10, 0, 0, 2], 1234, 80);
        rewrite(&mut frame, &Action::SetNwSrc(0xc0a8_0101)).unwrap();
        rewrite(&mut frame, &Action::SetNwDst(0xc0a8_0102)).unwrap();
        rewrite(&mut frame, &Action::SetTpDst(8080)).unwrap();
        rewrite(&mut frame, &Action::SetNwTos(0xb8)).unwrap();
        let packet = Packet::parse(&frame).unwrap();
        let ip = packet.ip().unwrap();
        assert_eq!(ip.src, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(ip.dst, Ipv4Addr::new(192, 168, 1, 2));
        assert_eq!(ip.tos, 0xb8);
        assert_eq!(ip.tp, Some(Transport::Tcp { src: 1234, dst: 8080 }));
        assert!(tcp_checksum_ok(&frame));
    }

    #[test]
    fn test_rewrite_ip_on_arp_is_noop() {
        let original = arp_frame(7, 1, [10, 0, 0, 7], [10, 0, 0, 1]);
        let mut frame = original.clone();
        rewrite(&mut frame, &Action::SetNwSrc(1)).unwrap();
        rewrite(&mut frame, &Action::SetTpSrc(1)).unwrap();
        assert_eq!(frame, original);
        rewrite(&mut frame, &Action::SetDlSrc(0x0a)).unwrap();
        assert_eq!(Packet::parse(&frame).unwrap().dl_src, 0x0a);
    }
}
