use crate::event::EventResult;
use crate::message::*;
use crate::ofp_connection::DeviceId;
use crate::ofp_controller::{ControllerContext, DeviceControllerApp, DeviceControllerEvent};

/// Logs what happens to the connected switches.
#[derive(Debug, Default)]
pub struct EventLogger;

impl DeviceControllerApp for EventLogger {
    fn event(
        &mut self,
        event: &DeviceControllerEvent,
        _ctx: &mut dyn ControllerContext,
    ) -> EventResult {
        match *event {
            DeviceControllerEvent::ConnectionUp(dpid, ref features) => {
                info!(
                    "Switch {} up: {} ports, {} buffers, {} tables",
                    dpid,
                    features.ports.len(),
                    features.num_buffers,
                    features.num_tables
                );
            }
            DeviceControllerEvent::ConnectionDown(dpid) => info!("Switch {} down", dpid),
            DeviceControllerEvent::PortStatus(dpid, ref status) => {
                info!("Switch {}: port {} {:?}", dpid, status.desc.port_no, status.reason);
            }
            DeviceControllerEvent::ErrorIn(dpid, xid, ref error) => {
                warn!("Switch {}: error for xid {}: {:?}", dpid, xid, error);
            }
            DeviceControllerEvent::FlowRemoved(dpid, ref removed) => {
                debug!(
                    "Switch {}: flow {} removed ({:?})",
                    dpid,
                    removed.match_spec,
                    removed.reason
                );
            }
            DeviceControllerEvent::FlowTableModification(dpid, ref modification) => {
                debug!(
                    "Switch {}: flow table +{} -{}",
                    dpid,
                    modification.added.len(),
                    modification.removed.len()
                );
            }
            DeviceControllerEvent::SwitchDescReceived(dpid, _, ref desc) => {
                info!(
                    "Switch {}: {} {} {}",
                    dpid, desc.manufacturer_desc, desc.hardware_desc, desc.software_desc
                );
            }
            _ => {}
        }
        EventResult::Continue
    }
}

/// Periodically requests port and flow stats from every switch and logs the replies.
pub struct StatsProbing {
    interval_ticks: u32,
    ticks: u32,
}

impl StatsProbing {
    /// Probe every `interval_ticks` controller ticks. Zero disables probing.
    pub fn new(interval_ticks: u32) -> StatsProbing {
        StatsProbing {
            interval_ticks,
            ticks: 0,
        }
    }

    fn request_stats(&self, ctx: &mut dyn ControllerContext, device: DeviceId) {
        debug!("Requesting port and flow stats for {}", device);
        let requests = vec![
            StatsReq::port(OFPP_NONE),
            StatsReq::flow(crate::match_spec::MatchSpec::match_all(), OFPP_NONE),
        ];
        for req in requests {
            if let Err(e) = ctx.send_message(device, Message::StatsRequest(req)) {
                warn!("Could not request stats: {}", e);
            }
        }
    }

    fn print_port_stats(&self, device_id: DeviceId, port_stats: &[PortStats]) {
        for port in port_stats {
            info!(
                "Port stats {}:{} tx:{} tx_packets:{} rx:{} rx_packets:{}",
                device_id,
                port.port_no,
                port.bytes.tx,
                port.packets.tx,
                port.bytes.rx,
                port.packets.rx
            );
        }
    }

    fn print_flow_stats(&self, device_id: DeviceId, flow_stats: &[FlowStats]) {
        for flow in flow_stats {
            info!(
                "Flow stats {}: cookie:{} priority:{} match:{} duration:{}.{:09} packets:{} bytes:{} actions:{:?}",
                device_id,
                flow.cookie,
                flow.priority,
                flow.match_spec,
                flow.duration_sec,
                flow.duration_nsec,
                flow.packet_count,
                flow.byte_count,
                flow.actions
            );
        }
    }
}

impl DeviceControllerApp for StatsProbing {
    fn event(
        &mut self,
        event: &DeviceControllerEvent,
        _ctx: &mut dyn ControllerContext,
    ) -> EventResult {
        match *event {
            DeviceControllerEvent::PortStatsReceived(device_id, _, ref port_stats) => {
                self.print_port_stats(device_id, port_stats);
            }
            DeviceControllerEvent::FlowStatsReceived(device_id, _, ref flow_stats) => {
                self.print_flow_stats(device_id, flow_stats);
            }
            _ => {}
        }
        EventResult::Continue
    }

    fn start(&mut self) {
        info!("Starting stats probing every {} ticks", self.interval_ticks);
    }

    fn tick(&mut self, ctx: &mut dyn ControllerContext) {
        if self.interval_ticks == 0 {
            return;
        }
        self.ticks += 1;
        if self.ticks < self.interval_ticks {
            return;
        }
        self.ticks = 0;
        for device in ctx.connected_devices() {
            self.request_stats(ctx, device);
        }
    }
}
