use crate::match_spec::MatchSpec;

/// Port number meaning "no port" in OpenFlow 1.0.
pub const OFPP_NONE: u16 = 0xffff;
/// Highest port number usable for a physical port.
pub const OFPP_MAX: u16 = 0xff00;
/// Buffer id meaning "not buffered".
pub const NO_BUFFER: u32 = 0xffff_ffff;
pub const ALL_TABLES: u8 = 0xff;
pub const OFP_DEFAULT_PRIORITY: u16 = 0x8000;
pub const OFP_DEFAULT_MISS_SEND_LEN: u16 = 128;

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Wildcards {
    pub in_port: bool,
    pub dl_vlan: bool,
    pub dl_src: bool,
    pub dl_dst: bool,
    pub dl_type: bool,
    pub nw_proto: bool,
    pub tp_src: bool,
    pub tp_dst: bool,
    pub nw_src: u32,
    pub nw_dst: u32,
    pub dl_vlan_pcp: bool,
    pub nw_tos: bool,
}

impl Wildcards {
    /// Every field wildcarded.
    pub fn all() -> Wildcards {
        Wildcards {
            in_port: true,
            dl_vlan: true,
            dl_src: true,
            dl_dst: true,
            dl_type: true,
            nw_proto: true,
            tp_src: true,
            tp_dst: true,
            nw_src: 32,
            nw_dst: 32,
            dl_vlan_pcp: true,
            nw_tos: true,
        }
    }
}

/// How long before a flow entry expires.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash)]
pub enum Timeout {
    Permanent,
    ExpiresAfter(u16),
}

impl Timeout {
    pub fn of_int(tm: u16) -> Timeout {
        match tm {
            0 => Timeout::Permanent,
            d => Timeout::ExpiresAfter(d),
        }
    }

    pub fn to_int(tm: Timeout) -> u16 {
        match tm {
            Timeout::Permanent => 0,
            Timeout::ExpiresAfter(d) => d,
        }
    }
}

impl Default for Timeout {
    fn default() -> Self {
        Timeout::Permanent
    }
}

/// Capabilities supported by the datapath.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Capabilities {
    pub flow_stats: bool,
    pub table_stats: bool,
    pub port_stats: bool,
    pub stp: bool,
    pub ip_reasm: bool,
    pub queue_stats: bool,
    pub arp_match_ip: bool,
}

/// Actions supported by the datapath.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SupportedActions {
    pub output: bool,
    pub set_vlan_id: bool,
    pub set_vlan_pcp: bool,
    pub strip_vlan: bool,
    pub set_dl_src: bool,
    pub set_dl_dst: bool,
    pub set_nw_src: bool,
    pub set_nw_dst: bool,
    pub set_nw_tos: bool,
    pub set_tp_src: bool,
    pub set_tp_dst: bool,
    pub enqueue: bool,
    pub vendor: bool,
}

/// Switch features.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SwitchFeatures {
    pub datapath_id: u64,
    pub num_buffers: u32,
    pub num_tables: u8,
    pub supported_capabilities: Capabilities,
    pub supported_actions: SupportedActions,
    pub ports: Vec<PortDesc>,
}

/// Switch configuration, as carried by get_config replies and set_config.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SwitchConfig {
    pub flags: u16,
    pub miss_send_len: u16,
}

/// Port behavior.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PseudoPort {
    PhysicalPort(u16),
    InPort,
    Table,
    Normal,
    Flood,
    AllPorts,
    /// Send to the controller, with at most this many bytes of the packet.
    Controller(u16),
    Local,
}

impl PseudoPort {
    /// Whether two ports name the same destination, ignoring the controller byte limit.
    pub fn same_destination(&self, other: &PseudoPort) -> bool {
        match (self, other) {
            (PseudoPort::Controller(_), PseudoPort::Controller(_)) => true,
            (a, b) => a == b,
        }
    }
}

code_enum! {
    /// Type of modification to perform on a flow table.
    u16, FlowModCmd {
        AddFlow = 0,
        ModFlow = 1,
        ModStrictFlow = 2,
        DeleteFlow = 3,
        DeleteStrictFlow = 4,
    }
}

impl FlowModCmd {
    pub fn is_strict(self) -> bool {
        match self {
            FlowModCmd::ModStrictFlow | FlowModCmd::DeleteStrictFlow => true,
            _ => false,
        }
    }
}

/// Represents modifications to a flow table from the controller.
#[derive(Clone, Debug, PartialEq)]
pub struct FlowMod {
    pub command: FlowModCmd,
    pub match_spec: MatchSpec,
    pub priority: u16,
    pub actions: Vec<Action>,
    pub cookie: u64,
    pub idle_timeout: Timeout,
    pub hard_timeout: Timeout,
    pub notify_when_removed: bool,
    pub buffer_id: Option<u32>,
    pub out_port: Option<PseudoPort>,
    pub check_overlap: bool,
}

impl FlowMod {
    /// A flow mod for `command` with every optional field at its default.
    pub fn new(command: FlowModCmd, match_spec: MatchSpec, priority: u16) -> FlowMod {
        FlowMod {
            command,
            match_spec,
            priority,
            actions: vec![],
            cookie: 0,
            idle_timeout: Timeout::Permanent,
            hard_timeout: Timeout::Permanent,
            notify_when_removed: false,
            buffer_id: None,
            out_port: None,
            check_overlap: false,
        }
    }
}

/// Return a `FlowMod` adding a flow parameterized by the given `priority`, `match_spec`,
/// and `actions`.
pub fn add_flow(priority: u16, match_spec: MatchSpec, actions: Vec<Action>) -> FlowMod {
    FlowMod {
        actions,
        ..FlowMod::new(FlowModCmd::AddFlow, match_spec, priority)
    }
}

/// Actions associated with flows and packets.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    Output(PseudoPort),
    SetDlVlan(Option<u16>),
    SetDlVlanPcp(u8),
    SetDlSrc(u64),
    SetDlDst(u64),
    SetNwSrc(u32),
    SetNwDst(u32),
    SetNwTos(u8),
    SetTpSrc(u16),
    SetTpDst(u16),
    Enqueue(PseudoPort, u32),
}

impl Action {
    /// The port this action sends the packet to, if it is an output action.
    pub fn output_port(&self) -> Option<&PseudoPort> {
        match self {
            Action::Output(port) | Action::Enqueue(port, _) => Some(port),
            _ => None,
        }
    }
}

/// The data associated with a packet received by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Buffered(u32, Vec<u8>),
    NotBuffered(Vec<u8>),
}

impl Payload {
    pub fn size_of(payload: &Payload) -> usize {
        payload.data().len()
    }

    pub fn data(&self) -> &[u8] {
        match *self {
            Payload::Buffered(_, ref buf) | Payload::NotBuffered(ref buf) => buf,
        }
    }

    pub fn buffer_id(&self) -> Option<u32> {
        match *self {
            Payload::Buffered(id, _) => Some(id),
            Payload::NotBuffered(_) => None,
        }
    }
}

code_enum! {
    /// The reason a packet arrives at the controller.
    u8, PacketInReason {
        NoMatch = 0,
        Action = 1,
    }
}

/// Represents packets received by the datapath and sent to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketIn {
    pub input_payload: Payload,
    pub total_len: u16,
    pub port: u16,
    pub reason: PacketInReason,
}

impl PacketIn {
    pub fn clone_payload(&self) -> Payload {
        self.input_payload.clone()
    }
}

/// Represents packets sent from the controller.
#[derive(Clone, Debug, PartialEq)]
pub struct PacketOut {
    pub output_payload: Payload,
    pub port_id: Option<u16>,
    pub apply_actions: Vec<Action>,
}

code_enum! {
    /// Reason a flow was removed from a switch
    u8, FlowRemovedReason {
        IdleTimeout = 0,
        HardTimeout = 1,
        Delete = 2,
    }
}

/// Flow removed (datapath -> controller)
#[derive(Clone, Debug, PartialEq)]
pub struct FlowRemoved {
    pub match_spec: MatchSpec,
    pub cookie: u64,
    pub priority: u16,
    pub reason: FlowRemovedReason,
    pub duration_sec: u32,
    pub duration_nsec: u32,
    pub idle_timeout: Timeout,
    pub packet_count: u64,
    pub byte_count: u64,
}

code_enum! {
    /// STP state of a port.
    u32, StpState {
        Listen = 0,
        Learn = 1,
        Forward = 2,
        Block = 3,
    }
}

/// Current state of a physical port. Not configurable by the controller.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PortState {
    pub down: bool,
    pub stp_state: StpState,
}

/// Features of physical ports available in a datapath.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PortFeatures {
    pub f_10mbhd: bool,
    pub f_10mbfd: bool,
    pub f_100mbhd: bool,
    pub f_100mbfd: bool,
    pub f_1gbhd: bool,
    pub f_1gbfd: bool,
    pub f_10gbfd: bool,
    pub copper: bool,
    pub fiber: bool,
    pub autoneg: bool,
    pub pause: bool,
    pub pause_asym: bool,
}

/// Flags to indicate behavior of the physical port.
///
/// These flags are used both to describe the current configuration of a physical port,
/// and to configure a port's behavior.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PortConfig {
    pub down: bool,
    pub no_stp: bool,
    pub no_recv: bool,
    pub no_recv_stp: bool,
    pub no_flood: bool,
    pub no_fwd: bool,
    pub no_packet_in: bool,
}

/// Bit of `PortConfig::down` in the wire representation.
pub const OFPPC_PORT_DOWN: u32 = 1 << 0;
/// Bit of `PortConfig::no_flood` in the wire representation.
pub const OFPPC_NO_FLOOD: u32 = 1 << 4;

/// Description of a physical port.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PortDesc {
    pub port_no: u16,
    pub hw_addr: u64,
    pub name: String,
    pub config: PortConfig,
    pub state: PortState,
    pub curr: PortFeatures,
    pub advertised: PortFeatures,
    pub supported: PortFeatures,
    pub peer: PortFeatures,
}

impl PortDesc {
    /// An up, copper, 1Gb port.
    pub fn new(port_no: u16, hw_addr: u64, name: &str) -> PortDesc {
        let features = PortFeatures {
            f_1gbfd: true,
            copper: true,
            ..PortFeatures::default()
        };
        PortDesc {
            port_no,
            hw_addr,
            name: name.to_string(),
            config: PortConfig::default(),
            state: PortState {
                down: false,
                stp_state: StpState::Listen,
            },
            curr: features,
            advertised: features,
            supported: features,
            peer: PortFeatures::default(),
        }
    }
}

/// Port configuration request from the controller. `config` and `mask` are raw
/// `OFPPC_*` bit sets.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PortMod {
    pub port_no: u16,
    pub hw_addr: u64,
    pub config: u32,
    pub mask: u32,
    pub advertise: u32,
}

code_enum! {
    /// Type of stats request.
    u16, StatsReqType {
        Desc = 0,
        Flow = 1,
        Aggregate = 2,
        Table = 3,
        Port = 4,
        Queue = 5,
        Vendor = 0xffff,
    }
}

impl StatsReqType {
    /// Whether replies of this type may be split over several messages.
    pub fn is_multipart(self) -> bool {
        match self {
            StatsReqType::Flow | StatsReqType::Table | StatsReqType::Port | StatsReqType::Queue => {
                true
            }
            _ => false,
        }
    }
}

/// Type of Body for Stats Requests
#[derive(Clone, Debug, PartialEq)]
pub enum StatsReqBody {
    DescBody,
    FlowStatsBody {
        // Also used for aggregate stats
        match_spec: MatchSpec,
        table_id: u8,
        out_port: u16,
    },
    TableBody,
    PortBody {
        port_no: u16,
    },
    QueueBody {
        port_no: u16,
        queue_id: u32,
    },
    VendorBody(Vec<u8>),
}

/// Represents stats request from the controller.
#[derive(Clone, Debug, PartialEq)]
pub struct StatsReq {
    pub req_type: StatsReqType,
    pub flags: u16,
    pub body: StatsReqBody,
}

impl StatsReq {
    pub fn flow(match_spec: MatchSpec, out_port: u16) -> StatsReq {
        StatsReq {
            req_type: StatsReqType::Flow,
            flags: 0,
            body: StatsReqBody::FlowStatsBody {
                match_spec,
                table_id: ALL_TABLES,
                out_port,
            },
        }
    }

    pub fn port(port_no: u16) -> StatsReq {
        StatsReq {
            req_type: StatsReqType::Port,
            flags: 0,
            body: StatsReqBody::PortBody { port_no },
        }
    }
}

/// Flag of a stats reply announcing that more parts follow.
pub const OFPSF_REPLY_MORE: u16 = 1;

/// One part of a stats reply as it arrives on the wire. The body is decoded into a
/// `StatsRespBody` once every part has been collected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatsReply {
    pub req_type: StatsReqType,
    pub flags: u16,
    pub body: Vec<u8>,
}

impl StatsReply {
    pub fn more(&self) -> bool {
        self.flags & OFPSF_REPLY_MORE != 0
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FlowStats {
    pub table_id: u8,
    pub match_spec: MatchSpec,
    pub duration_sec: u32,
    pub duration_nsec: u32,
    pub priority: u16,
    pub idle_timeout: u16,
    pub hard_timeout: u16,
    pub cookie: u64,
    pub packet_count: u64,
    pub byte_count: u64,
    pub actions: Vec<Action>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AggregateStats {
    pub packet_count: u64,
    pub byte_count: u64,
    pub flow_count: u32,
}

#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct TransmissionCounter {
    pub rx: u64,
    pub tx: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PortStats {
    pub port_no: u16,
    pub packets: TransmissionCounter,
    pub bytes: TransmissionCounter,
    pub dropped: TransmissionCounter,
    pub errors: TransmissionCounter,
    pub rx_frame_errors: u64,
    pub rx_over_errors: u64,
    pub rx_crc_errors: u64,
    pub collisions: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueStats {
    pub port_no: u16,
    pub queue_id: u32,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub tx_errors: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableStats {
    pub table_id: u8,
    pub name: String,
    pub wildcards: Wildcards,
    pub max_entries: u32,
    pub active_count: u32,
    pub lookup_count: u64,
    pub matched_count: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SwitchDesc {
    pub manufacturer_desc: String,
    pub hardware_desc: String,
    pub software_desc: String,
    pub serial_number: String,
    pub datapath_desc: String,
}

/// Type of Body for Stats Response
#[derive(Clone, Debug, PartialEq)]
pub enum StatsRespBody {
    DescBody(SwitchDesc),
    FlowStatsBody { flow_stats: Vec<FlowStats> },
    AggregateStatsBody(AggregateStats),
    TableBody { table_stats: Vec<TableStats> },
    PortBody { port_stats: Vec<PortStats> },
    QueueBody { queue_stats: Vec<QueueStats> },
    VendorBody(Vec<u8>),
}

impl StatsRespBody {
    pub fn req_type(&self) -> StatsReqType {
        match self {
            StatsRespBody::DescBody(_) => StatsReqType::Desc,
            StatsRespBody::FlowStatsBody { .. } => StatsReqType::Flow,
            StatsRespBody::AggregateStatsBody(_) => StatsReqType::Aggregate,
            StatsRespBody::TableBody { .. } => StatsReqType::Table,
            StatsRespBody::PortBody { .. } => StatsReqType::Port,
            StatsRespBody::QueueBody { .. } => StatsReqType::Queue,
            StatsRespBody::VendorBody(_) => StatsReqType::Vendor,
        }
    }
}

code_enum! {
    /// What changed about a physical port.
    u8, PortReason {
        PortAdd = 0,
        PortDelete = 1,
        PortModify = 2,
    }
}

/// A physical port has changed in the datapath.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortStatus {
    pub reason: PortReason,
    pub desc: PortDesc,
}

code_enum! {
    /// Reason Hello failed.
    u16, HelloFailed {
        Incompatible = 0,
        EPerm = 1,
    }
}

code_enum! {
    /// Reason the controller made a bad request to a switch.
    u16, BadRequest {
        BadVersion = 0,
        BadType = 1,
        BadStat = 2,
        BadVendor = 3,
        BadSubType = 4,
        EPerm = 5,
        BadLen = 6,
        BufferEmpty = 7,
        BufferUnknown = 8,
    }
}

code_enum! {
    /// Reason the controller action failed.
    u16, BadAction {
        BadType = 0,
        BadLen = 1,
        BadVendor = 2,
        BadVendorType = 3,
        BadOutPort = 4,
        BadArgument = 5,
        EPerm = 6,
        TooMany = 7,
        BadQueue = 8,
    }
}

code_enum! {
    /// Reason a FlowMod from the controller failed.
    u16, FlowModFailed {
        AllTablesFull = 0,
        Overlap = 1,
        EPerm = 2,
        BadEmergTimeout = 3,
        BadCommand = 4,
        Unsupported = 5,
    }
}

code_enum! {
    /// Reason a PortMod from the controller failed.
    u16, PortModFailed {
        BadPort = 0,
        BadHwAddr = 1,
    }
}

code_enum! {
    /// Reason a queue operation from the controller failed.
    u16, QueueOpFailed {
        BadPort = 0,
        BadQueue = 1,
        EPerm = 2,
    }
}

/// High-level type of OpenFlow error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorType {
    HelloFailed(HelloFailed),
    BadRequest(BadRequest),
    BadAction(BadAction),
    FlowModFailed(FlowModFailed),
    PortModFailed(PortModFailed),
    QueueOpFailed(QueueOpFailed),
}

/// Error message (datapath -> controller)
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    Error(ErrorType, Vec<u8>),
}

/// Abstractions of OpenFlow 1.0 messages mapping to message codes.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Hello,
    Error(Error),
    EchoRequest(Vec<u8>),
    EchoReply(Vec<u8>),
    Vendor(Vec<u8>),
    FeaturesReq,
    FeaturesReply(SwitchFeatures),
    GetConfigRequest,
    GetConfigReply(SwitchConfig),
    SetConfig(SwitchConfig),
    FlowMod(FlowMod),
    PacketIn(PacketIn),
    FlowRemoved(FlowRemoved),
    PortStatus(PortStatus),
    PacketOut(PacketOut),
    PortMod(PortMod),
    BarrierRequest,
    BarrierReply,
    StatsRequest(StatsReq),
    StatsReply(StatsReply),
}
