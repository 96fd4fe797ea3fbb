use std::convert::TryFrom;
use std::fmt::{Display, Error, Formatter};

/// OpenFlow message type codes, used by headers to identify meaning of the rest of a message.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MsgCode {
    Hello = 0,
    Error = 1,
    EchoReq = 2,
    EchoResp = 3,
    Vendor = 4,
    FeaturesReq = 5,
    FeaturesResp = 6,
    GetConfigReq = 7,
    GetConfigResp = 8,
    SetConfig = 9,
    PacketIn = 10,
    FlowRemoved = 11,
    PortStatus = 12,
    PacketOut = 13,
    FlowMod = 14,
    PortMod = 15,
    StatsReq = 16,
    StatsResp = 17,
    BarrierReq = 18,
    BarrierResp = 19,
    QueueGetConfigReq = 20,
    QueueGetConfigResp = 21,
}

impl TryFrom<u8> for MsgCode {
    type Error = u8;

    fn try_from(code: u8) -> Result<MsgCode, u8> {
        let msg_code = match code {
            0 => MsgCode::Hello,
            1 => MsgCode::Error,
            2 => MsgCode::EchoReq,
            3 => MsgCode::EchoResp,
            4 => MsgCode::Vendor,
            5 => MsgCode::FeaturesReq,
            6 => MsgCode::FeaturesResp,
            7 => MsgCode::GetConfigReq,
            8 => MsgCode::GetConfigResp,
            9 => MsgCode::SetConfig,
            10 => MsgCode::PacketIn,
            11 => MsgCode::FlowRemoved,
            12 => MsgCode::PortStatus,
            13 => MsgCode::PacketOut,
            14 => MsgCode::FlowMod,
            15 => MsgCode::PortMod,
            16 => MsgCode::StatsReq,
            17 => MsgCode::StatsResp,
            18 => MsgCode::BarrierReq,
            19 => MsgCode::BarrierResp,
            20 => MsgCode::QueueGetConfigReq,
            21 => MsgCode::QueueGetConfigResp,
            unknown => return Err(unknown),
        };
        Ok(msg_code)
    }
}

impl Display for MsgCode {
    fn fmt(&self, f: &mut Formatter) -> Result<(), Error> {
        std::fmt::Debug::fmt(self, f)
    }
}
