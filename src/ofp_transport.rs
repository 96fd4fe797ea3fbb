//! Byte transports under an OpenFlow connection, and the background sender that finishes
//! writes a transport could not take at once.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::ofp_connection::ConnectionId;

/// Largest chunk handed to a transport in one write.
const CHUNK_SIZE: usize = 4096;
/// How long the sender waits before retrying a transport that would block.
const RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Non-blocking byte sink.
///
/// `try_write` writes as much of `buf` as the transport accepts right now and returns the
/// count, or fails with `WouldBlock` when it accepts nothing.
pub trait Transport: Send + Sync {
    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;

    fn shutdown(&self) {}
}

#[derive(Debug, Default)]
struct Pipe {
    data: Vec<u8>,
    limit: Option<usize>,
    failed: bool,
    shut_down: bool,
}

/// In-memory transport. Clones share the same pipe, so one side writes and the other
/// `take`s what was written.
#[derive(Clone, Debug, Default)]
pub struct MemoryTransport {
    pipe: Arc<Mutex<Pipe>>,
}

impl MemoryTransport {
    pub fn new() -> MemoryTransport {
        MemoryTransport::default()
    }

    /// A transport that holds at most `limit` unread bytes.
    pub fn with_limit(limit: usize) -> MemoryTransport {
        let transport = MemoryTransport::new();
        transport.set_limit(Some(limit));
        transport
    }

    fn pipe(&self) -> MutexGuard<Pipe> {
        match self.pipe.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn set_limit(&self, limit: Option<usize>) {
        self.pipe().limit = limit;
    }

    /// Everything written since the last call.
    pub fn take(&self) -> Vec<u8> {
        std::mem::replace(&mut self.pipe().data, vec![])
    }

    pub fn pending(&self) -> usize {
        self.pipe().data.len()
    }

    /// Make every later write fail with `BrokenPipe`.
    pub fn fail(&self) {
        self.pipe().failed = true;
    }

    pub fn is_shut_down(&self) -> bool {
        self.pipe().shut_down
    }
}

impl Transport for MemoryTransport {
    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut pipe = self.pipe();
        if pipe.failed || pipe.shut_down {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "memory transport closed"));
        }
        let room = match pipe.limit {
            Some(limit) => limit.saturating_sub(pipe.data.len()),
            None => buf.len(),
        };
        let n = room.min(buf.len());
        if n == 0 && !buf.is_empty() {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "memory transport full"));
        }
        pipe.data.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn shutdown(&self) {
        self.pipe().shut_down = true;
    }
}

struct Outgoing {
    transport: Arc<dyn Transport>,
    chunks: VecDeque<Vec<u8>>,
}

#[derive(Default)]
struct SenderState {
    outgoing: HashMap<ConnectionId, Outgoing>,
    failed: Vec<ConnectionId>,
    stopped: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<SenderState>,
    wakeup: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<SenderState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Background thread draining data that could not be written synchronously. Bytes queued
/// for one connection are written in the order they were queued.
pub struct DeferredSender {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl DeferredSender {
    pub fn new() -> io::Result<DeferredSender> {
        let shared = Arc::new(Shared::default());
        let worker_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("deferred-sender".to_string())
            .spawn(move || run(&worker_shared))?;
        Ok(DeferredSender {
            shared,
            worker: Some(worker),
        })
    }

    /// Queue `data` behind whatever is still pending for `id`.
    pub fn send(&self, id: ConnectionId, transport: &Arc<dyn Transport>, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut state = self.shared.lock();
        let outgoing = state.outgoing.entry(id).or_insert_with(|| Outgoing {
            transport: transport.clone(),
            chunks: VecDeque::new(),
        });
        outgoing.chunks.extend(data.chunks(CHUNK_SIZE).map(|c| c.to_vec()));
        self.shared.wakeup.notify_one();
    }

    /// Whether `id` still has queued bytes.
    pub fn is_sending(&self, id: ConnectionId) -> bool {
        self.shared.lock().outgoing.contains_key(&id)
    }

    pub fn pending_bytes(&self, id: ConnectionId) -> usize {
        self.shared
            .lock()
            .outgoing
            .get(&id)
            .map_or(0, |o| o.chunks.iter().map(Vec::len).sum())
    }

    /// Drop everything queued for `id`.
    pub fn kill(&self, id: ConnectionId) {
        let mut state = self.shared.lock();
        state.outgoing.remove(&id);
        state.failed.retain(|f| *f != id);
        self.shared.wakeup.notify_one();
    }

    /// Connections whose transport failed since the last call.
    pub fn take_failed(&self) -> Vec<ConnectionId> {
        std::mem::replace(&mut self.shared.lock().failed, vec![])
    }
}

impl Drop for DeferredSender {
    fn drop(&mut self) {
        self.shared.lock().stopped = true;
        self.shared.wakeup.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Deferred sender thread panicked");
            }
        }
    }
}

fn run(shared: &Shared) {
    let mut state = shared.lock();
    loop {
        if state.stopped {
            break;
        }
        if state.outgoing.is_empty() {
            state = match shared.wakeup.wait(state) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            continue;
        }
        if flush(&mut state) {
            state = match shared.wakeup.wait_timeout(state, RETRY_INTERVAL) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
    debug!("Deferred sender stopped");
}

/// Write as much as every transport accepts. Returns whether some connection is still
/// blocked.
fn flush(state: &mut SenderState) -> bool {
    let mut blocked = false;
    let mut failed = vec![];

    for (id, outgoing) in state.outgoing.iter_mut() {
        while let Some(chunk) = outgoing.chunks.front_mut() {
            match outgoing.transport.try_write(chunk) {
                Ok(n) if n == chunk.len() => {
                    outgoing.chunks.pop_front();
                }
                Ok(0) => {
                    blocked = true;
                    break;
                }
                Ok(n) => {
                    chunk.drain(..n);
                    blocked = true;
                    break;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    blocked = true;
                    break;
                }
                Err(e) => {
                    warn!("Deferred send to connection {} failed: {}", id, e);
                    failed.push(*id);
                    break;
                }
            }
        }
    }

    for id in failed {
        state.outgoing.remove(&id);
        state.failed.push(id);
    }
    state.outgoing.retain(|_, o| !o.chunks.is_empty());
    blocked
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn wait_until<F: FnMut() -> bool>(mut cond: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_memory_transport_limit() {
        let transport = MemoryTransport::with_limit(4);
        assert_eq!(transport.try_write(&[1, 2, 3]).unwrap(), 3);
        assert_eq!(transport.try_write(&[4, 5, 6]).unwrap(), 1);
        let err = transport.try_write(&[7]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert_eq!(transport.take(), vec![1, 2, 3, 4]);
        assert_eq!(transport.try_write(&[7]).unwrap(), 1);
    }

    #[test]
    fn test_memory_transport_failure() {
        let transport = MemoryTransport::new();
        transport.fail();
        let err = transport.try_write(&[1]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_deferred_send_drains_in_order() {
        let sender = DeferredSender::new().unwrap();
        let memory = MemoryTransport::with_limit(3);
        let transport: Arc<dyn Transport> = Arc::new(memory.clone());
        let id = ConnectionId(1);

        let data: Vec<u8> = (0..10).collect();
        sender.send(id, &transport, &data[..6]);
        sender.send(id, &transport, &data[6..]);

        let mut received = vec![];
        let drained = wait_until(|| {
            received.extend(memory.take());
            received.len() == data.len()
        });
        assert!(drained);
        assert_eq!(received, data);
        assert!(wait_until(|| !sender.is_sending(id)));
        assert_eq!(sender.pending_bytes(id), 0);
    }

    #[test]
    fn test_failed_transport_is_reported() {
        let sender = DeferredSender::new().unwrap();
        let memory = MemoryTransport::new();
        memory.fail();
        let transport: Arc<dyn Transport> = Arc::new(memory);
        sender.send(ConnectionId(7), &transport, &[1, 2, 3]);

        let mut failed = vec![];
        assert!(wait_until(|| {
            failed.extend(sender.take_failed());
            !failed.is_empty()
        }));
        assert_eq!(failed, vec![ConnectionId(7)]);
        assert!(!sender.is_sending(ConnectionId(7)));
    }

    #[test]
    fn test_kill_drops_queue() {
        let sender = DeferredSender::new().unwrap();
        let memory = MemoryTransport::with_limit(0);
        let transport: Arc<dyn Transport> = Arc::new(memory);
        sender.send(ConnectionId(2), &transport, &[1, 2, 3]);
        assert!(sender.is_sending(ConnectionId(2)));
        sender.kill(ConnectionId(2));
        assert!(!sender.is_sending(ConnectionId(2)));
    }
}
