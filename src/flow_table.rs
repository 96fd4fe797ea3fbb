use std::time::Duration;

use crate::match_spec::MatchSpec;
use crate::message::{
    Action, AggregateStats, FlowMod, FlowModCmd, FlowRemoved, FlowRemovedReason, FlowStats,
    PseudoPort, Timeout, OFP_DEFAULT_PRIORITY,
};

fn timeout_elapsed(timeout: Timeout, since: Duration, now: Duration) -> bool {
    match timeout {
        Timeout::Permanent => false,
        Timeout::ExpiresAfter(secs) => now > since + Duration::from_secs(u64::from(secs)),
    }
}

/// One flow rule: a match, its priority and cookie, what to do with matching packets,
/// and the bookkeeping needed for expiration and statistics.
#[derive(Clone, Debug, PartialEq)]
pub struct TableEntry {
    pub priority: u16,
    pub cookie: u64,
    pub match_spec: MatchSpec,
    pub actions: Vec<Action>,
    pub idle_timeout: Timeout,
    pub hard_timeout: Timeout,
    pub notify_when_removed: bool,
    pub created_at: Duration,
    pub last_touched_at: Duration,
    pub packet_count: u64,
    pub byte_count: u64,
}

impl Default for TableEntry {
    fn default() -> Self {
        TableEntry::new(MatchSpec::match_all(), OFP_DEFAULT_PRIORITY, vec![])
    }
}

impl TableEntry {
    /// A permanent entry created at time zero.
    pub fn new(match_spec: MatchSpec, priority: u16, actions: Vec<Action>) -> TableEntry {
        TableEntry {
            priority,
            cookie: 0,
            match_spec,
            actions,
            idle_timeout: Timeout::Permanent,
            hard_timeout: Timeout::Permanent,
            notify_when_removed: false,
            created_at: Duration::default(),
            last_touched_at: Duration::default(),
            packet_count: 0,
            byte_count: 0,
        }
    }

    pub fn from_flow_mod(flow_mod: &FlowMod, now: Duration) -> TableEntry {
        TableEntry {
            priority: flow_mod.priority,
            cookie: flow_mod.cookie,
            match_spec: flow_mod.match_spec,
            actions: flow_mod.actions.clone(),
            idle_timeout: flow_mod.idle_timeout,
            hard_timeout: flow_mod.hard_timeout,
            notify_when_removed: flow_mod.notify_when_removed,
            created_at: now,
            last_touched_at: now,
            packet_count: 0,
            byte_count: 0,
        }
    }

    pub fn to_flow_mod(&self, command: FlowModCmd) -> FlowMod {
        FlowMod {
            command,
            match_spec: self.match_spec,
            priority: self.priority,
            actions: self.actions.clone(),
            cookie: self.cookie,
            idle_timeout: self.idle_timeout,
            hard_timeout: self.hard_timeout,
            notify_when_removed: self.notify_when_removed,
            buffer_id: None,
            out_port: None,
            check_overlap: false,
        }
    }

    pub fn to_flow_removed(&self, reason: FlowRemovedReason, now: Duration) -> FlowRemoved {
        let age = now.checked_sub(self.created_at).unwrap_or_default();
        FlowRemoved {
            match_spec: self.match_spec,
            cookie: self.cookie,
            priority: self.priority,
            reason,
            duration_sec: age.as_secs() as u32,
            duration_nsec: age.subsec_nanos(),
            idle_timeout: self.idle_timeout,
            packet_count: self.packet_count,
            byte_count: self.byte_count,
        }
    }

    pub fn flow_stats(&self, now: Duration) -> FlowStats {
        let age = now.checked_sub(self.created_at).unwrap_or_default();
        FlowStats {
            table_id: 0,
            match_spec: self.match_spec,
            duration_sec: age.as_secs() as u32,
            duration_nsec: age.subsec_nanos(),
            priority: self.priority,
            idle_timeout: Timeout::to_int(self.idle_timeout),
            hard_timeout: Timeout::to_int(self.hard_timeout),
            cookie: self.cookie,
            packet_count: self.packet_count,
            byte_count: self.byte_count,
            actions: self.actions.clone(),
        }
    }

    /// Account for one packet of `n_bytes` hitting this entry at `now`.
    pub fn touch_packet(&mut self, n_bytes: u64, now: Duration) {
        self.byte_count += n_bytes;
        self.packet_count += 1;
        self.last_touched_at = now.max(self.created_at);
    }

    pub fn is_expired(&self, now: Duration) -> bool {
        self.expiry_reason(now).is_some()
    }

    /// Why the entry has expired at `now`, if it has. A hard timeout wins over an idle one.
    pub fn expiry_reason(&self, now: Duration) -> Option<FlowRemovedReason> {
        if timeout_elapsed(self.hard_timeout, self.created_at, now) {
            Some(FlowRemovedReason::HardTimeout)
        } else if timeout_elapsed(self.idle_timeout, self.last_touched_at, now) {
            Some(FlowRemovedReason::IdleTimeout)
        } else {
            None
        }
    }

    /// Whether the entry forwards to `port`.
    pub fn outputs_to(&self, port: &PseudoPort) -> bool {
        self.actions
            .iter()
            .filter_map(Action::output_port)
            .any(|p| p.same_destination(port))
    }

    /// OpenFlow selection rule for modify and delete requests. Strict selection needs an
    /// identical match and priority; non-strict selection takes every entry whose match
    /// is subsumed by `query`, whatever its priority.
    pub fn is_matched_by(
        &self,
        query: &MatchSpec,
        priority: u16,
        strict: bool,
        out_port: Option<&PseudoPort>,
    ) -> bool {
        let selected = if strict {
            self.match_spec == *query && self.priority == priority
        } else {
            query.subsumes(&self.match_spec)
        };
        selected && out_port.map_or(true, |port| self.outputs_to(port))
    }

    /// Whether `self` is the rule identified by `cookie`, `match_spec` and `priority`.
    pub fn is_identified_by(&self, cookie: u64, match_spec: &MatchSpec, priority: u16) -> bool {
        self.cookie == cookie && self.match_spec == *match_spec && self.priority == priority
    }
}

/// Entries added to and removed from a flow table in one step.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FlowTableModification {
    pub added: Vec<TableEntry>,
    pub removed: Vec<TableEntry>,
    pub reason: Option<FlowRemovedReason>,
}

impl FlowTableModification {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Flow entries ordered by priority, highest first. Entries of equal priority keep their
/// insertion order.
#[derive(Clone, Debug, Default)]
pub struct FlowTable {
    entries: Vec<TableEntry>,
}

impl FlowTable {
    pub fn new() -> FlowTable {
        FlowTable::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TableEntry> {
        self.entries.iter()
    }

    pub fn entries(&self) -> &[TableEntry] {
        &self.entries
    }

    pub fn clear(&mut self) -> Vec<TableEntry> {
        self.entries.drain(..).collect()
    }

    /// Insert `entry` after every entry of greater or equal priority. Duplicates and
    /// overlapping entries are accepted as is.
    pub fn add_entry(&mut self, entry: TableEntry) {
        let pos = self.entries.partition_point(|e| e.priority >= entry.priority);
        self.entries.insert(pos, entry);
    }

    /// The highest priority entry matching `packet`, `None` on a table miss.
    pub fn lookup(&self, packet: &MatchSpec) -> Option<&TableEntry> {
        self.entries.iter().find(|e| e.match_spec.matches(packet))
    }

    pub fn lookup_mut(&mut self, packet: &MatchSpec) -> Option<&mut TableEntry> {
        self.entries.iter_mut().find(|e| e.match_spec.matches(packet))
    }

    pub fn matching_entries(
        &self,
        query: &MatchSpec,
        priority: u16,
        strict: bool,
        out_port: Option<&PseudoPort>,
    ) -> Vec<&TableEntry> {
        self.entries
            .iter()
            .filter(|e| e.is_matched_by(query, priority, strict, out_port))
            .collect()
    }

    fn extract<F>(&mut self, mut predicate: F) -> Vec<TableEntry>
    where
        F: FnMut(&TableEntry) -> bool,
    {
        let (removed, kept): (Vec<TableEntry>, Vec<TableEntry>) =
            self.entries.drain(..).partition(|e| predicate(e));
        self.entries = kept;
        removed
    }

    pub fn remove_matching_entries(
        &mut self,
        query: &MatchSpec,
        priority: u16,
        strict: bool,
    ) -> Vec<TableEntry> {
        self.remove_matching_entries_for_port(query, priority, strict, None)
    }

    /// As `remove_matching_entries`, restricted to entries forwarding to `out_port` when
    /// one is given.
    pub fn remove_matching_entries_for_port(
        &mut self,
        query: &MatchSpec,
        priority: u16,
        strict: bool,
        out_port: Option<&PseudoPort>,
    ) -> Vec<TableEntry> {
        self.extract(|e| e.is_matched_by(query, priority, strict, out_port))
    }

    /// Replace the actions of the selected entries, keeping their counters. Returns the
    /// number of entries changed.
    pub fn modify_matching_entries(
        &mut self,
        query: &MatchSpec,
        priority: u16,
        strict: bool,
        actions: &[Action],
    ) -> usize {
        let mut modified = 0;
        for entry in self.entries.iter_mut() {
            if entry.is_matched_by(query, priority, strict, None) {
                entry.actions = actions.to_vec();
                modified += 1;
            }
        }
        modified
    }

    pub fn remove_expired_entries(&mut self, now: Duration) -> Vec<TableEntry> {
        self.extract(|e| e.is_expired(now))
    }

    /// Remove the entry identified by `cookie`, `match_spec` and `priority`.
    pub fn remove_entry(
        &mut self,
        cookie: u64,
        match_spec: &MatchSpec,
        priority: u16,
    ) -> Option<TableEntry> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.is_identified_by(cookie, match_spec, priority))?;
        Some(self.entries.remove(pos))
    }

    pub fn entries_for_port(&self, port: &PseudoPort) -> Vec<&TableEntry> {
        self.entries.iter().filter(|e| e.outputs_to(port)).collect()
    }

    pub fn flow_stats(
        &self,
        query: &MatchSpec,
        out_port: Option<&PseudoPort>,
        now: Duration,
    ) -> Vec<FlowStats> {
        self.matching_entries(query, 0, false, out_port)
            .into_iter()
            .map(|e| e.flow_stats(now))
            .collect()
    }

    pub fn aggregate_stats(
        &self,
        query: &MatchSpec,
        out_port: Option<&PseudoPort>,
    ) -> AggregateStats {
        self.matching_entries(query, 0, false, out_port)
            .into_iter()
            .fold(AggregateStats::default(), |mut agg, e| {
                agg.packet_count += e.packet_count;
                agg.byte_count += e.byte_count;
                agg.flow_count += 1;
                agg
            })
    }
}
