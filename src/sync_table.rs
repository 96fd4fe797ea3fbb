//! Controller-side mirror of a switch flow table.
//!
//! Changes are sent as flow mods followed by a barrier request carrying the same xid, and
//! only become visible once the barrier reply for that xid comes back on the connection
//! they were sent on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::event::{EventResult, ListenerId, Listeners};
use crate::flow_table::{FlowTable, FlowTableModification, TableEntry};
use crate::match_spec::MatchSpec;
use crate::message::{FlowMod, FlowModCmd, FlowRemoved, FlowRemovedReason, Message};
use crate::ofp_connection::{Connection, ConnectionId};
use crate::ofp_header::Xid;

/// A change requested on the mirrored table.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncOperation {
    Install(TableEntry),
    RemoveStrict(TableEntry),
    /// Non-strict removal of every entry the match subsumes.
    Remove(MatchSpec),
}

impl SyncOperation {
    fn to_flow_mod(&self) -> FlowMod {
        match *self {
            SyncOperation::Install(ref entry) => FlowMod {
                notify_when_removed: true,
                ..entry.to_flow_mod(FlowModCmd::AddFlow)
            },
            SyncOperation::RemoveStrict(ref entry) => FlowMod {
                actions: vec![],
                ..entry.to_flow_mod(FlowModCmd::DeleteStrictFlow)
            },
            SyncOperation::Remove(match_spec) => {
                FlowMod::new(FlowModCmd::DeleteFlow, match_spec, 0)
            }
        }
    }

    /// Whether `self` is a pending install that the removal `other` makes pointless.
    fn is_cancelled_by(&self, other: &SyncOperation) -> bool {
        match (self, other) {
            (SyncOperation::Install(entry), SyncOperation::Remove(query)) => {
                query.subsumes(&entry.match_spec)
            }
            (SyncOperation::Install(entry), SyncOperation::RemoveStrict(removed)) => {
                entry.match_spec == removed.match_spec && entry.priority == removed.priority
            }
            _ => false,
        }
    }
}

/// The switch end a sync table talks to.
pub trait SwitchSender {
    /// The connection messages currently go to, `None` while the switch is not connected.
    fn connection(&self) -> Option<ConnectionId>;

    fn next_xid(&mut self) -> Xid;

    /// Send `message`, returning whether it was handed to the connection.
    fn send(&mut self, xid: Xid, message: Message) -> bool;
}

impl SwitchSender for Connection {
    fn connection(&self) -> Option<ConnectionId> {
        if self.is_operational() {
            Some(self.id())
        } else {
            None
        }
    }

    fn next_xid(&mut self) -> Xid {
        Connection::next_xid(self)
    }

    fn send(&mut self, xid: Xid, message: Message) -> bool {
        match Connection::send(self, xid, &message) {
            Ok(()) => true,
            Err(e) => {
                warn!("Connection {}: could not send flow table update: {}", self.id(), e);
                false
            }
        }
    }
}

type OperationId = u64;

#[derive(Debug)]
struct PendingBatch {
    epoch: ConnectionId,
    operations: Vec<OperationId>,
    issued_at: Duration,
}

/// A flow table kept in step with a switch.
pub struct OfSyncFlowTable {
    table: FlowTable,
    /// Operations not committed yet, in request order.
    pending: Vec<(OperationId, SyncOperation)>,
    in_flight: HashMap<Xid, PendingBatch>,
    next_operation: OperationId,
    clock: Arc<dyn Clock>,
    barrier_timeout: Option<Duration>,
    listeners: Listeners<FlowTableModification>,
}

impl OfSyncFlowTable {
    pub fn new(clock: Arc<dyn Clock>, barrier_timeout: Option<Duration>) -> OfSyncFlowTable {
        OfSyncFlowTable {
            table: FlowTable::new(),
            pending: vec![],
            in_flight: HashMap::new(),
            next_operation: 0,
            clock,
            barrier_timeout,
            listeners: Listeners::new(),
        }
    }

    /// Committed entries.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TableEntry> {
        self.table.iter()
    }

    pub fn entries(&self) -> &[TableEntry] {
        self.table.entries()
    }

    /// Operations waiting for a barrier reply.
    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    pub fn matching_entries(
        &self,
        query: &MatchSpec,
        priority: u16,
        strict: bool,
    ) -> Vec<&TableEntry> {
        self.table.matching_entries(query, priority, strict, None)
    }

    pub fn add_listener<F>(&mut self, handler: F) -> ListenerId
    where
        F: FnMut(&FlowTableModification) -> EventResult + Send + 'static,
    {
        self.listeners.add(handler)
    }

    pub fn install<S: SwitchSender + ?Sized>(&mut self, sender: &mut S, entry: TableEntry) {
        self.install_all(sender, vec![entry]);
    }

    pub fn install_all<S: SwitchSender + ?Sized>(
        &mut self,
        sender: &mut S,
        entries: Vec<TableEntry>,
    ) {
        self.request(sender, entries.into_iter().map(SyncOperation::Install).collect());
    }

    pub fn remove_strict<S: SwitchSender + ?Sized>(&mut self, sender: &mut S, entry: TableEntry) {
        self.request(sender, vec![SyncOperation::RemoveStrict(entry)]);
    }

    pub fn remove_with_wildcards<S: SwitchSender + ?Sized>(
        &mut self,
        sender: &mut S,
        match_spec: MatchSpec,
    ) {
        self.request(sender, vec![SyncOperation::Remove(match_spec)]);
    }

    fn request<S: SwitchSender + ?Sized>(
        &mut self,
        sender: &mut S,
        operations: Vec<SyncOperation>,
    ) {
        let mut ids = Vec::with_capacity(operations.len());
        for op in operations {
            self.pending.retain(|(_, pending)| !pending.is_cancelled_by(&op));
            let id = self.next_operation;
            self.next_operation += 1;
            self.pending.push((id, op));
            ids.push(id);
        }

        match sender.connection() {
            Some(epoch) => {
                let xid = sender.next_xid();
                self.send_batch(sender, epoch, xid, ids, &[]);
            }
            None => debug!(
                "Switch not connected, {} flow table operations queued",
                self.pending.len()
            ),
        }
    }

    /// Send `leading` flow mods, then the flow mods of the pending operations `ids`, then a
    /// barrier, all under `xid`.
    fn send_batch<S: SwitchSender + ?Sized>(
        &mut self,
        sender: &mut S,
        epoch: ConnectionId,
        xid: Xid,
        ids: Vec<OperationId>,
        leading: &[FlowMod],
    ) {
        for flow_mod in leading {
            sender.send(xid, Message::FlowMod(flow_mod.clone()));
        }
        let mut operations = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, op)) = self.pending.iter().find(|(p, _)| *p == id) {
                sender.send(xid, Message::FlowMod(op.to_flow_mod()));
                operations.push(id);
            }
        }
        sender.send(xid, Message::BarrierRequest);
        self.in_flight.insert(
            xid,
            PendingBatch {
                epoch,
                operations,
                issued_at: self.clock.now(),
            },
        );
    }

    /// Bring a (re)connected switch in line with the mirror: clear its table, then install
    /// every committed entry and replay the pending operations.
    pub fn handle_connection_up<S: SwitchSender + ?Sized>(&mut self, sender: &mut S) {
        self.in_flight.clear();
        let epoch = match sender.connection() {
            Some(epoch) => epoch,
            None => {
                warn!("Connection up without an operational connection");
                return;
            }
        };
        info!(
            "Resynchronizing flow table on connection {}: {} entries, {} pending",
            epoch,
            self.table.len(),
            self.pending.len()
        );

        let clear_xid = sender.next_xid();
        let clear = FlowMod::new(FlowModCmd::DeleteFlow, MatchSpec::match_all(), 0);
        self.send_batch(sender, epoch, clear_xid, vec![], &[clear]);

        let reinstall: Vec<FlowMod> = self
            .table
            .iter()
            .map(|e| SyncOperation::Install(e.clone()).to_flow_mod())
            .collect();
        let ids = self.pending.iter().map(|(id, _)| *id).collect();
        let xid = sender.next_xid();
        self.send_batch(sender, epoch, xid, ids, &reinstall);
    }

    /// Forget every barrier in flight. Pending operations are replayed on the next
    /// connection.
    pub fn handle_connection_down(&mut self) {
        self.in_flight.clear();
    }

    /// Commit the batch `xid` sent on `connection`. Returns `Halt` when the barrier belonged
    /// to this table.
    pub fn handle_barrier_reply(&mut self, connection: ConnectionId, xid: Xid) -> EventResult {
        match self.in_flight.get(&xid) {
            Some(batch) if batch.epoch == connection => {}
            Some(_) => {
                debug!("Ignoring barrier {} from a previous connection", xid);
                return EventResult::Continue;
            }
            None => return EventResult::Continue,
        }
        let batch = match self.in_flight.remove(&xid) {
            Some(batch) => batch,
            None => return EventResult::Continue,
        };

        let mut modification = FlowTableModification::default();
        for id in batch.operations {
            let pos = match self.pending.iter().position(|(p, _)| *p == id) {
                Some(pos) => pos,
                None => continue,
            };
            let (_, op) = self.pending.remove(pos);
            match op {
                SyncOperation::Install(entry) => {
                    self.table.add_entry(entry.clone());
                    modification.added.push(entry);
                }
                SyncOperation::RemoveStrict(entry) => {
                    let removed = self.table.remove_matching_entries(
                        &entry.match_spec,
                        entry.priority,
                        true,
                    );
                    modification.removed.extend(removed);
                }
                SyncOperation::Remove(query) => {
                    let removed = self.table.remove_matching_entries(&query, 0, false);
                    modification.removed.extend(removed);
                }
            }
        }

        if !modification.is_empty() {
            self.listeners.publish(&modification);
        }
        EventResult::Halt
    }

    /// Drop the committed entry a switch reports as expired. Unknown entries are ignored,
    /// and so are deletions: those were requested through this table and are committed on
    /// their barrier reply.
    pub fn handle_flow_removed(&mut self, flow_removed: &FlowRemoved) -> Option<TableEntry> {
        if flow_removed.reason == FlowRemovedReason::Delete {
            trace!("Ignoring flow removed for a deletion: {}", flow_removed.match_spec);
            return None;
        }
        let entry = self
            .table
            .remove_entry(flow_removed.cookie, &flow_removed.match_spec, flow_removed.priority)?;
        self.listeners.publish(&FlowTableModification {
            added: vec![],
            removed: vec![entry.clone()],
            reason: Some(flow_removed.reason),
        });
        Some(entry)
    }

    /// Re-issue batches whose barrier reply is overdue. Does nothing unless a barrier
    /// timeout is configured. Returns the number of batches re-issued.
    pub fn retry_stale<S: SwitchSender + ?Sized>(&mut self, sender: &mut S) -> usize {
        let timeout = match self.barrier_timeout {
            Some(timeout) => timeout,
            None => return 0,
        };
        let epoch = match sender.connection() {
            Some(epoch) => epoch,
            None => return 0,
        };
        let now = self.clock.now();
        let mut stale: Vec<Xid> = self
            .in_flight
            .iter()
            .filter(|(_, b)| b.epoch == epoch && now > b.issued_at + timeout)
            .map(|(xid, _)| *xid)
            .collect();
        stale.sort_unstable();

        for old_xid in stale.iter() {
            if let Some(batch) = self.in_flight.remove(old_xid) {
                warn!(
                    "Barrier {} unanswered after {:?}, re-sending {} operations",
                    old_xid,
                    timeout,
                    batch.operations.len()
                );
                let xid = sender.next_xid();
                self.send_batch(sender, epoch, xid, batch.operations, &[]);
            }
        }
        stale.len()
    }
}
