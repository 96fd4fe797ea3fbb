use std::fmt;
use std::io;
use std::sync::Arc;

use bytes::BytesMut;

use crate::message::{Message, StatsReply, StatsReqType};
use crate::ofp_header::{OfpHeader, Xid, OFP_HEADER_LENGTH, OPENFLOW_0_01_VERSION};
use crate::ofp_message::{OfpMessage, OfpSerializationError};
use crate::ofp_transport::{DeferredSender, Transport};

/// Identity of one transport-level connection. Never reused within a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Datapath id of a switch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let bytes = self.0.to_be_bytes();
        let parts: Vec<String> = bytes[2..].iter().map(|b| format!("{:02x}", b)).collect();
        write!(f, "{}", parts.join("-"))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Handshake,
    Operational,
    Disconnected,
}

#[derive(Debug, Fail)]
pub enum ConnectionError {
    #[fail(display = "Unsupported OpenFlow version {}", version)]
    BadVersion { version: u8 },
    #[fail(display = "Declared message length {} is shorter than a header", length)]
    BadLength { length: usize },
    #[fail(display = "IO Error: {}", error)]
    Io { error: io::Error },
    #[fail(display = "Connection is disconnected")]
    Disconnected,
    #[fail(display = "Serialization error: {}", error)]
    Serialization { error: OfpSerializationError },
}

impl From<io::Error> for ConnectionError {
    fn from(error: io::Error) -> Self {
        ConnectionError::Io { error }
    }
}

impl From<OfpSerializationError> for ConnectionError {
    fn from(error: OfpSerializationError) -> Self {
        ConnectionError::Serialization { error }
    }
}

#[derive(Debug)]
struct StatsAccumulator {
    xid: Xid,
    req_type: StatsReqType,
    body: Vec<u8>,
}

/// One OpenFlow connection, usable from either end.
///
/// Incoming bytes are framed into messages by `feed`. Outgoing messages are written
/// straight to the transport when it accepts them, the rest goes through the
/// `DeferredSender` so that later messages never overtake earlier ones.
pub struct Connection {
    id: ConnectionId,
    state: ConnectionState,
    dpid: Option<DeviceId>,
    recv_buffer: BytesMut,
    stats: Option<StatsAccumulator>,
    transport: Arc<dyn Transport>,
    sender: Arc<DeferredSender>,
    next_xid: Xid,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("dpid", &self.dpid)
            .finish()
    }
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        transport: Arc<dyn Transport>,
        sender: Arc<DeferredSender>,
    ) -> Connection {
        Connection {
            id,
            state: ConnectionState::Handshake,
            dpid: None,
            recv_buffer: BytesMut::new(),
            stats: None,
            transport,
            sender,
            next_xid: 1,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn dpid(&self) -> Option<DeviceId> {
        self.dpid
    }

    pub fn is_operational(&self) -> bool {
        self.state == ConnectionState::Operational
    }

    /// Bind the connection to the switch `dpid` and mark it operational.
    pub fn bind(&mut self, dpid: DeviceId) {
        self.dpid = Some(dpid);
        self.state = ConnectionState::Operational;
    }

    /// A fresh transaction id. Zero is never handed out.
    pub fn next_xid(&mut self) -> Xid {
        let xid = self.next_xid;
        self.next_xid = self.next_xid.wrapping_add(1).max(1);
        xid
    }

    /// Bytes queued behind the transport.
    pub fn pending_bytes(&self) -> usize {
        self.sender.pending_bytes(self.id)
    }

    /// Append `data` to the receive buffer and return every complete message in it.
    ///
    /// Partial trailing data stays buffered. A message that fails to decode is skipped.
    /// A bad version or an impossible length disconnects.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<(Xid, Message)>, ConnectionError> {
        if self.state == ConnectionState::Disconnected {
            return Err(ConnectionError::Disconnected);
        }
        self.recv_buffer.extend_from_slice(data);

        let mut messages = vec![];
        while self.recv_buffer.len() >= OFP_HEADER_LENGTH {
            let header = OfpHeader::parse(&self.recv_buffer[..OFP_HEADER_LENGTH])?;
            if header.length() < OFP_HEADER_LENGTH {
                error!("Connection {}: bad message length {}", self.id, header.length());
                self.disconnect();
                return Err(ConnectionError::BadLength {
                    length: header.length(),
                });
            }
            if header.version() != OPENFLOW_0_01_VERSION && !header.is_hello() {
                error!("Connection {}: unsupported OpenFlow version {}", self.id, header.version());
                self.disconnect();
                return Err(ConnectionError::BadVersion {
                    version: header.version(),
                });
            }
            if self.recv_buffer.len() < header.length() {
                break;
            }

            let frame = self.recv_buffer.split_to(header.length());
            match Message::parse(&header, &frame[OFP_HEADER_LENGTH..]) {
                Ok(message) => messages.push(message),
                Err(e) => warn!(
                    "Connection {}: skipping message of type {} xid {}: {}",
                    self.id,
                    header.typ(),
                    header.xid(),
                    e
                ),
            }
        }
        Ok(messages)
    }

    pub fn send(&mut self, xid: Xid, message: &Message) -> Result<(), ConnectionError> {
        let bytes = message.marshal(xid)?;
        trace!("Connection {}: sending {:?} xid {}", self.id, message, xid);
        self.send_raw(&bytes)
    }

    /// Write `data`, handing whatever the transport does not take to the deferred sender.
    pub fn send_raw(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        if self.state == ConnectionState::Disconnected {
            return Err(ConnectionError::Disconnected);
        }
        if self.sender.is_sending(self.id) {
            self.sender.send(self.id, &self.transport, data);
            return Ok(());
        }

        let mut written = 0;
        while written < data.len() {
            match self.transport.try_write(&data[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("Connection {}: write failed: {}", self.id, e);
                    self.disconnect();
                    return Err(e.into());
                }
            }
        }
        if written < data.len() {
            debug!(
                "Connection {}: deferring {} of {} bytes",
                self.id,
                data.len() - written,
                data.len()
            );
            self.sender.send(self.id, &self.transport, &data[written..]);
        }
        Ok(())
    }

    /// Collect one part of a stats reply. Returns the type and the concatenated body of
    /// every part once the last one has arrived.
    pub fn accumulate_stats(
        &mut self,
        xid: Xid,
        reply: StatsReply,
    ) -> Option<(Xid, StatsReqType, Vec<u8>)> {
        if reply.more() && !reply.req_type.is_multipart() {
            error!(
                "Connection {}: cannot aggregate stats of type {:?}",
                self.id, reply.req_type
            );
            self.stats = None;
            return None;
        }

        let mismatch = match self.stats {
            Some(ref acc) => acc.xid != xid || acc.req_type != reply.req_type,
            None => false,
        };
        if mismatch {
            if let Some(acc) = self.stats.take() {
                error!(
                    "Connection {}: was expecting continued stats of type {:?} with xid {}, but got type {:?} with xid {}",
                    self.id, acc.req_type, acc.xid, reply.req_type, xid
                );
            }
        }

        let more = reply.more();
        match self.stats {
            Some(ref mut acc) => acc.body.extend_from_slice(&reply.body),
            None => {
                self.stats = Some(StatsAccumulator {
                    xid,
                    req_type: reply.req_type,
                    body: reply.body,
                })
            }
        }

        if more {
            None
        } else {
            self.stats.take().map(|acc| (acc.xid, acc.req_type, acc.body))
        }
    }

    /// Close the connection and drop anything still queued for it.
    pub fn disconnect(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        info!("Connection {} disconnected", self.id);
        self.state = ConnectionState::Disconnected;
        self.stats = None;
        self.recv_buffer.clear();
        self.sender.kill(self.id);
        self.transport.shutdown();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::message::OFPSF_REPLY_MORE;
    use crate::ofp_transport::MemoryTransport;

    pub fn connection(id: u64) -> (Connection, MemoryTransport) {
        let memory = MemoryTransport::new();
        let sender = Arc::new(DeferredSender::new().unwrap());
        (Connection::new(ConnectionId(id), Arc::new(memory.clone()), sender), memory)
    }

    /// Decode everything written to `memory`.
    pub fn written(memory: &MemoryTransport) -> Vec<(Xid, Message)> {
        let (mut reader, _) = connection(0);
        reader.feed(&memory.take()).unwrap()
    }

    fn part(req_type: StatsReqType, more: bool, body: &[u8]) -> StatsReply {
        StatsReply {
            req_type,
            flags: if more { OFPSF_REPLY_MORE } else { 0 },
            body: body.to_vec(),
        }
    }

    #[test]
    fn test_device_id_display() {
        assert_eq!(DeviceId(1).to_string(), "00-00-00-00-00-01");
        assert_eq!(DeviceId(0xaabb_ccdd_eeff).to_string(), "aa-bb-cc-dd-ee-ff");
    }

    #[test]
    fn test_feed_frames_messages() {
        let (mut conn, _) = connection(1);
        let mut bytes = Message::Hello.marshal(1).unwrap();
        bytes.extend(Message::EchoRequest(vec![1, 2, 3]).marshal(2).unwrap());
        let barrier = Message::BarrierRequest.marshal(3).unwrap();
        bytes.extend_from_slice(&barrier[..5]);

        let messages = conn.feed(&bytes).unwrap();
        assert_eq!(
            messages,
            vec![(1, Message::Hello), (2, Message::EchoRequest(vec![1, 2, 3]))]
        );

        // the partial barrier completes with the next read
        assert!(conn.feed(&[]).unwrap().is_empty());
        let messages = conn.feed(&barrier[5..]).unwrap();
        assert_eq!(messages, vec![(3, Message::BarrierRequest)]);
    }

    #[test]
    fn test_feed_byte_at_a_time() {
        let (mut conn, _) = connection(1);
        let bytes = Message::EchoReply(vec![9; 20]).marshal(42).unwrap();
        let mut messages = vec![];
        for b in bytes {
            messages.extend(conn.feed(&[b]).unwrap());
        }
        assert_eq!(messages, vec![(42, Message::EchoReply(vec![9; 20]))]);
    }

    #[test]
    fn test_bad_version_disconnects() {
        let (mut conn, memory) = connection(1);
        let mut bytes = Message::BarrierRequest.marshal(3).unwrap();
        bytes[0] = 4;
        match conn.feed(&bytes) {
            Err(ConnectionError::BadVersion { version: 4 }) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(memory.is_shut_down());
        assert!(conn.send(1, &Message::Hello).is_err());
    }

    #[test]
    fn test_hello_of_other_version_is_accepted() {
        let (mut conn, _) = connection(1);
        let mut bytes = Message::Hello.marshal(3).unwrap();
        bytes[0] = 4;
        assert_eq!(conn.feed(&bytes).unwrap(), vec![(3, Message::Hello)]);
    }

    #[test]
    fn test_bad_length_disconnects() {
        let (mut conn, _) = connection(1);
        match conn.feed(&[1, 0, 0, 4, 0, 0, 0, 1]) {
            Err(ConnectionError::BadLength { length: 4 }) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_undecodable_message_is_skipped() {
        let (mut conn, _) = connection(1);
        // a features reply too short for its fixed part
        let mut bytes = vec![1, 6, 0, 12, 0, 0, 0, 5, 0, 0, 0, 0];
        bytes.extend(Message::BarrierReply.marshal(6).unwrap());
        assert_eq!(conn.feed(&bytes).unwrap(), vec![(6, Message::BarrierReply)]);
        assert_eq!(conn.state(), ConnectionState::Handshake);
    }

    #[test]
    fn test_send_writes_through() {
        let (mut conn, memory) = connection(1);
        conn.send(7, &Message::BarrierRequest).unwrap();
        assert_eq!(written(&memory), vec![(7, Message::BarrierRequest)]);
    }

    #[test]
    fn test_blocked_send_is_deferred_in_order() {
        let memory = MemoryTransport::with_limit(10);
        let sender = Arc::new(DeferredSender::new().unwrap());
        let mut conn = Connection::new(ConnectionId(1), Arc::new(memory.clone()), sender);

        conn.send(1, &Message::EchoRequest(vec![0; 8])).unwrap();
        conn.send(2, &Message::BarrierRequest).unwrap();

        let mut received = vec![];
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while received.len() < 24 && std::time::Instant::now() < deadline {
            received.extend(memory.take());
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        let (mut reader, _) = connection(0);
        assert_eq!(
            reader.feed(&received).unwrap(),
            vec![(1, Message::EchoRequest(vec![0; 8])), (2, Message::BarrierRequest)]
        );
    }

    #[test]
    fn test_write_error_disconnects() {
        let (mut conn, memory) = connection(1);
        memory.fail();
        assert!(conn.send(1, &Message::Hello).is_err());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_xids_skip_zero() {
        let (mut conn, _) = connection(1);
        conn.next_xid = u32::max_value();
        assert_eq!(conn.next_xid(), u32::max_value());
        assert_eq!(conn.next_xid(), 1);
    }

    #[test]
    fn test_stats_reassembly() {
        let (mut conn, _) = connection(1);
        assert!(conn.accumulate_stats(5, part(StatsReqType::Flow, true, &[1, 2])).is_none());
        assert!(conn.accumulate_stats(5, part(StatsReqType::Flow, true, &[3])).is_none());
        assert_eq!(
            conn.accumulate_stats(5, part(StatsReqType::Flow, false, &[4])),
            Some((5, StatsReqType::Flow, vec![1, 2, 3, 4]))
        );
    }

    #[test]
    fn test_single_part_stats() {
        let (mut conn, _) = connection(1);
        assert_eq!(
            conn.accumulate_stats(9, part(StatsReqType::Desc, false, &[7])),
            Some((9, StatsReqType::Desc, vec![7]))
        );
    }

    #[test]
    fn test_stats_mismatch_restarts() {
        let (mut conn, _) = connection(1);
        assert!(conn.accumulate_stats(5, part(StatsReqType::Flow, true, &[1])).is_none());
        assert!(conn.accumulate_stats(6, part(StatsReqType::Port, true, &[2])).is_none());
        assert_eq!(
            conn.accumulate_stats(6, part(StatsReqType::Port, false, &[3])),
            Some((6, StatsReqType::Port, vec![2, 3]))
        );
    }

    #[test]
    fn test_more_flag_on_single_part_type_is_dropped() {
        let (mut conn, _) = connection(1);
        assert!(conn.accumulate_stats(5, part(StatsReqType::Desc, true, &[1])).is_none());
        assert_eq!(
            conn.accumulate_stats(5, part(StatsReqType::Aggregate, false, &[2])),
            Some((5, StatsReqType::Aggregate, vec![2]))
        );
    }
}
