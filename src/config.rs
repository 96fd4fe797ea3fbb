use std::time::Duration;

use crate::message::{PortDesc, OFP_DEFAULT_MISS_SEND_LEN};

pub const DEFAULT_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 6633;

/// Runtime settings of the controller.
#[derive(Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    pub address: String,
    pub port: u16,
    /// Keep a barrier-synchronized mirror of every switch flow table.
    pub sync_flow_tables: bool,
    /// Delete every flow of a switch when it connects. Mirrored tables always do.
    pub clear_flows_on_connect: bool,
    /// Re-send flow table updates whose barrier reply is overdue. `None` waits forever.
    pub barrier_timeout: Option<Duration>,
    /// Idle time after which a switch is probed with an echo request.
    pub echo_interval: Duration,
    pub tick_interval: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            address: DEFAULT_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            sync_flow_tables: true,
            clear_flows_on_connect: true,
            barrier_timeout: None,
            echo_interval: Duration::from_secs(20),
            tick_interval: Duration::from_secs(1),
        }
    }
}

/// Settings of a software switch.
#[derive(Clone, Debug, PartialEq)]
pub struct DatapathConfig {
    pub dpid: u64,
    /// Defaults to the dpid when absent.
    pub name: Option<String>,
    pub n_buffers: usize,
    pub n_tables: u8,
    pub miss_send_len: u16,
    /// Number of ports, numbered from 1.
    pub ports: u16,
}

impl DatapathConfig {
    pub fn new(dpid: u64) -> DatapathConfig {
        DatapathConfig {
            dpid,
            ..DatapathConfig::default()
        }
    }

    pub fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.dpid.to_string())
    }

    /// Ports `1..=ports` with hardware addresses 00:00:00:00:dd:pp, where dd is the dpid
    /// modulo 255 and pp the port number.
    pub fn port_list(&self) -> Vec<PortDesc> {
        let prefix = self.dpid % 255;
        (1..=self.ports)
            .map(|i| PortDesc::new(i, (prefix << 8) | u64::from(i), &format!("eth{}", i)))
            .collect()
    }
}

impl Default for DatapathConfig {
    fn default() -> Self {
        DatapathConfig {
            dpid: 1,
            name: None,
            n_buffers: 100,
            n_tables: 1,
            miss_send_len: OFP_DEFAULT_MISS_SEND_LEN,
            ports: 4,
        }
    }
}
