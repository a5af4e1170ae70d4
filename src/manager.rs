//! Pooling of transport sessions between the devices that share them
//!
//! Devices never own a session. They ask the [`ConnectionManager`] for a [`Lease`] on the session
//! of a `(server, device)` pair, which is opened lazily on first use. When the last clone of a lease
//! is dropped the session is not closed right away: a teardown task waits for the idle timeout and
//! only then disconnects, unless the session is leased again in the meantime. Dropping the manager
//! kills every pending teardown, closes every session and invalidates all outstanding leases.
//!
//! With a keep-alive period configured, a background task also checks every open session at that
//! period and logs the devices that stopped answering.

use crate::{
    config::ManagerSettings,
    core::ConnectionId,
    error::{
        Error,
        Result,
    },
    transport::{
        Connector,
        DeviceStatus,
        Transport,
    },
};
use std::{
    collections::{
        hash_map::Entry,
        HashMap,
    },
    fmt,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        Weak,
    },
    time::Duration,
};
use tokio::{
    runtime::{
        Builder,
        Handle,
        Runtime,
    },
    sync::oneshot,
    task::JoinHandle,
};
use tracing::{
    debug,
    info,
    warn,
};

/// Lifecycle of one pooled connection, as seen from outside the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Absent,
    Connected { leases: usize },
    /// No leases left, a teardown task is counting down
    PendingRemoval,
}

struct Slot<T> {
    transport: Arc<Mutex<T>>,
    leases: usize,
}

/// Signals to the teardown task of one connection
struct PendingRemoval {
    /// Distinguishes this countdown from later ones on the same connection
    epoch: u64,
    reacquired: oneshot::Sender<()>,
    kill: oneshot::Sender<()>,
}

struct State<T> {
    connections: HashMap<ConnectionId, Slot<T>>,
    pending: HashMap<ConnectionId, PendingRemoval>,
    tasks: Vec<JoinHandle<()>>,
    next_epoch: u64,
    /// Set once shutdown begins, no teardown may be scheduled or carried out after it
    closing: bool,
    /// Set once every connection is gone, every lease is invalid from here on
    closed: bool,
}

impl<T> Default for State<T> {
    fn default() -> Self {
        Self {
            connections: HashMap::new(),
            pending: HashMap::new(),
            tasks: Vec::new(),
            next_epoch: 0,
            closing: false,
            closed: false,
        }
    }
}

impl<T> State<T> {
    fn reap(&mut self) {
        self.tasks.retain(|task| !task.is_finished());
    }
}

struct Shared<C: Connector> {
    connector: C,
    idle_timeout: Duration,
    runtime: Handle,
    state: Mutex<State<C::Transport>>,
}

impl<C: Connector> Shared<C> {
    fn lock(&self) -> MutexGuard<'_, State<C::Transport>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add_lease(&self, id: &ConnectionId) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        if let Some(slot) = state.connections.get_mut(id) {
            slot.leases += 1;
        }
    }

    fn release(self: &Arc<Self>, id: &ConnectionId) {
        let mut state = self.lock();
        if state.closing {
            return;
        }
        let Some(slot) = state.connections.get_mut(id) else {
            return;
        };
        slot.leases = slot.leases.saturating_sub(1);
        if slot.leases == 0 {
            self.schedule_removal(&mut state, id);
        }
    }

    fn schedule_removal(self: &Arc<Self>, state: &mut State<C::Transport>, id: &ConnectionId) {
        let (reacquired, reacquired_rx) = oneshot::channel();
        let (kill, kill_rx) = oneshot::channel();
        let epoch = state.next_epoch;
        state.next_epoch += 1;
        state.pending.insert(
            id.clone(),
            PendingRemoval {
                epoch,
                reacquired,
                kill,
            },
        );
        debug!(connection = %id, timeout = ?self.idle_timeout, "Last lease released, scheduling disconnect");
        let manager = Arc::downgrade(self);
        let idle_timeout = self.idle_timeout;
        let id = id.clone();
        let task = self.runtime.spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(idle_timeout) => {
                    if let Some(shared) = manager.upgrade() {
                        shared.remove_idle(&id, epoch);
                    }
                }
                _ = reacquired_rx => debug!(connection = %id, "Connection reacquired, disconnect cancelled"),
                _ = kill_rx => debug!(connection = %id, "Disconnect superseded by shutdown"),
            }
        });
        state.tasks.push(task);
    }

    fn remove_idle(&self, id: &ConnectionId, epoch: u64) {
        let mut state = self.lock();
        if state.closing {
            return;
        }
        match state.pending.get(id) {
            Some(pending) if pending.epoch == epoch => {}
            _ => return,
        }
        state.pending.remove(id);
        if let Some(slot) = state.connections.remove(id) {
            info!(connection = %id, "Idle timeout elapsed");
            disconnect(id, &slot.transport);
        }
    }
}

impl<C: Connector> Shared<C> {
    /// Check that the device behind every open session still answers
    fn ping_all(&self) {
        let sessions: Vec<_> = {
            let state = self.lock();
            if state.closing {
                return;
            }
            state
                .connections
                .iter()
                .map(|(id, slot)| (id.clone(), Arc::clone(&slot.transport)))
                .collect()
        };
        debug!(connections = sessions.len(), "Pinging open connections");
        for (id, transport) in sessions {
            let Ok(mut transport) = transport.lock() else {
                warn!(connection = %id, "Session lock poisoned, not pinging");
                continue;
            };
            match transport.is_online(&id.device) {
                Ok(true) => {}
                Ok(false) => warn!(connection = %id, "Device stopped answering"),
                Err(error) => warn!(connection = %id, %error, "Ping failed"),
            }
        }
    }
}

fn disconnect<T: Transport>(id: &ConnectionId, transport: &Mutex<T>) {
    let mut transport = transport.lock().unwrap_or_else(PoisonError::into_inner);
    match transport.disconnect() {
        Ok(()) => debug!(connection = %id, "Disconnected"),
        Err(error) => warn!(connection = %id, %error, "Disconnect failed"),
    }
}

/// Owner of every pooled transport session
pub struct ConnectionManager<C: Connector> {
    shared: Arc<Shared<C>>,
    /// Runs the teardown tasks, shut down after the last one was joined
    runtime: Option<Runtime>,
    /// Stop signal and handle of the keep-alive task, if one runs
    keep_alive: Option<(oneshot::Sender<()>, JoinHandle<()>)>,
}

impl<C: Connector> fmt::Debug for ConnectionManager<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("idle_timeout", &self.shared.idle_timeout)
            .field("open_connections", &self.open_connections())
            .field("keep_alive", &self.keep_alive.is_some())
            .finish_non_exhaustive()
    }
}

impl<C: Connector> ConnectionManager<C> {
    /// Build a manager opening sessions through `connector`
    /// # Errors
    /// Returns an error if the teardown runtime can't be started
    pub fn new(connector: C, settings: &ManagerSettings) -> Result<Self> {
        let mut manager = Self::with_idle_timeout(connector, settings.idle_timeout)?;
        if let Some(period) = settings.keep_alive {
            manager.start_keep_alive(period);
        }
        Ok(manager)
    }

    /// # Errors
    /// Returns an error if the teardown runtime can't be started
    pub fn with_idle_timeout(connector: C, idle_timeout: Duration) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("feconfig-teardown")
            .enable_time()
            .build()?;
        let shared = Arc::new(Shared {
            connector,
            idle_timeout,
            runtime: runtime.handle().clone(),
            state: Mutex::new(State::default()),
        });
        Ok(Self {
            shared,
            runtime: Some(runtime),
            keep_alive: None,
        })
    }

    fn start_keep_alive(&mut self, period: Duration) {
        let (stop, mut stop_rx) = oneshot::channel();
        let manager = Arc::downgrade(&self.shared);
        let period = period.max(Duration::from_millis(1));
        let task = self.shared.runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => match manager.upgrade() {
                        Some(shared) => shared.ping_all(),
                        None => break,
                    },
                    _ = &mut stop_rx => break,
                }
            }
            debug!("Keep-alive stopped");
        });
        info!(?period, "Keep-alive started");
        self.keep_alive = Some((stop, task));
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        self.shared.idle_timeout
    }

    /// Lease the session of `device` on `server`, connecting if there is none yet. A pending
    /// disconnect of that session is cancelled.
    /// # Errors
    /// Returns [`Error::Connection`] if a new session could not be opened. Nothing is recorded in
    /// that case, so a later call tries again.
    pub fn acquire(&self, server: &str, device: &str) -> Result<Lease<C>> {
        let id = ConnectionId::new(server, device);
        let mut guard = self.shared.lock();
        let state = &mut *guard;
        state.reap();
        if let Some(pending) = state.pending.remove(&id) {
            // The receiver is gone if the countdown already fired
            let _ = pending.reacquired.send(());
        }
        let slot = match state.connections.entry(id.clone()) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(vacant) => {
                debug!(connection = %id, "Opening connection");
                let transport = self
                    .shared
                    .connector
                    .connect(server)
                    .map_err(|source| Error::Connection {
                        server: id.server.clone(),
                        source,
                    })?;
                vacant.insert(Slot {
                    transport: Arc::new(Mutex::new(transport)),
                    leases: 0,
                })
            }
        };
        slot.leases += 1;
        Ok(Lease {
            id,
            manager: Arc::downgrade(&self.shared),
        })
    }

    /// Where the connection to `device` on `server` is in its lifecycle
    #[must_use]
    pub fn state(&self, server: &str, device: &str) -> ConnectionState {
        let id = ConnectionId::new(server, device);
        let state = self.shared.lock();
        match state.connections.get(&id) {
            None => ConnectionState::Absent,
            Some(_) if state.pending.contains_key(&id) => ConnectionState::PendingRemoval,
            Some(slot) => ConnectionState::Connected {
                leases: slot.leases,
            },
        }
    }

    /// Number of live sessions, pending removals included
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.shared.lock().connections.len()
    }

    /// Check whether `device` answers on `server`. Never fails: connection problems are reported
    /// as [`DeviceStatus::ServerOffline`].
    pub fn probe(&self, server: &str, device: &str) -> DeviceStatus {
        let lease = match self.acquire(server, device) {
            Ok(lease) => lease,
            Err(error) => {
                warn!(server, device, %error, "Probe could not connect");
                return DeviceStatus::ServerOffline;
            }
        };
        let status = match lease.with_transport(|t| t.is_online(device)) {
            Ok(Ok(true)) => DeviceStatus::Reachable,
            Ok(Ok(false)) => DeviceStatus::Unreachable,
            Ok(Err(error)) => {
                warn!(server, device, %error, "Probe failed");
                DeviceStatus::ServerOffline
            }
            Err(error) => {
                warn!(server, device, %error, "Probe failed");
                DeviceStatus::ServerOffline
            }
        };
        debug!(server, device, %status, "Probed device");
        status
    }
}

impl<C: Connector> Drop for ConnectionManager<C> {
    /// Kills every pending teardown, waits for the teardown tasks, then closes every session.
    ///
    /// # Panics
    /// Blocks on the teardown runtime, so this panics if dropped from within an async context
    fn drop(&mut self) {
        let tasks = {
            let mut state = self.shared.lock();
            state.closing = true;
            for (id, pending) in state.pending.drain() {
                debug!(connection = %id, "Killing scheduled disconnect");
                let _ = pending.kill.send(());
                let _ = pending.reacquired.send(());
            }
            let mut tasks = std::mem::take(&mut state.tasks);
            if let Some((stop, task)) = self.keep_alive.take() {
                let _ = stop.send(());
                tasks.push(task);
            }
            tasks
        };
        if let Some(runtime) = self.runtime.take() {
            runtime.block_on(async {
                for task in tasks {
                    let _ = task.await;
                }
            });
        }
        let mut state = self.shared.lock();
        state.closed = true;
        for (id, slot) in state.connections.drain() {
            if slot.leases > 0 {
                debug!(connection = %id, leases = slot.leases, "Invalidating outstanding leases");
            }
            disconnect(&id, &slot.transport);
        }
        info!("Connection manager shut down");
    }
}

/// A handle granting use of a pooled session. Cloning adds a lease, dropping the last clone lets
/// the manager schedule the disconnect.
pub struct Lease<C: Connector> {
    id: ConnectionId,
    manager: Weak<Shared<C>>,
}

impl<C: Connector> fmt::Debug for Lease<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl<C: Connector> Lease<C> {
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Whether the manager that issued this lease is still running
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.manager
            .upgrade()
            .is_some_and(|shared| !shared.lock().closed)
    }

    /// Run `f` with exclusive use of the leased session
    /// # Errors
    /// Returns [`Error::InvalidManager`] if the manager has shut down
    pub fn with_transport<R>(&self, f: impl FnOnce(&mut C::Transport) -> R) -> Result<R> {
        let invalid = || Error::InvalidManager(self.id.clone());
        let shared = self.manager.upgrade().ok_or_else(invalid)?;
        let transport = {
            let state = shared.lock();
            if state.closed {
                return Err(invalid());
            }
            state
                .connections
                .get(&self.id)
                .map(|slot| Arc::clone(&slot.transport))
                .ok_or_else(invalid)?
        };
        let mut transport = transport
            .lock()
            .map_err(|_| Error::Poisoned("transport session"))?;
        Ok(f(&mut *transport))
    }
}

impl<C: Connector> Clone for Lease<C> {
    fn clone(&self) -> Self {
        if let Some(shared) = self.manager.upgrade() {
            shared.add_lease(&self.id);
        }
        Self {
            id: self.id.clone(),
            manager: self.manager.clone(),
        }
    }
}

impl<C: Connector> Drop for Lease<C> {
    fn drop(&mut self) {
        match self.manager.upgrade() {
            Some(shared) => shared.release(&self.id),
            None => debug!(connection = %self.id, "Manager invalid, nothing to release"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::{
            Endianness,
            RegisterAddress,
        },
        transport::mock::{
            MockBoard,
            MockConnector,
        },
    };
    use std::thread::sleep;

    const SERVER: &str = "opc.example:48020";
    const DEVICE: &str = "sector.mmtp";

    fn manager(board: &MockBoard, idle: Duration) -> ConnectionManager<MockConnector> {
        ConnectionManager::with_idle_timeout(board.connector(), idle).unwrap()
    }

    #[test]
    fn test_lazy_connect_and_sharing() {
        let board = MockBoard::new();
        let mgr = manager(&board, Duration::from_secs(10));
        assert_eq!(mgr.state(SERVER, DEVICE), ConnectionState::Absent);
        let a = mgr.acquire(SERVER, DEVICE).unwrap();
        let b = mgr.acquire(SERVER, DEVICE).unwrap();
        let c = a.clone();
        assert_eq!(board.connects(), 1);
        assert_eq!(mgr.open_connections(), 1);
        assert_eq!(
            mgr.state(SERVER, DEVICE),
            ConnectionState::Connected { leases: 3 }
        );
        drop((a, b));
        assert_eq!(
            mgr.state(SERVER, DEVICE),
            ConnectionState::Connected { leases: 1 }
        );
        drop(c);
        assert_eq!(mgr.state(SERVER, DEVICE), ConnectionState::PendingRemoval);
        // A different device on the same server gets its own session
        let _other = mgr.acquire(SERVER, "sector.carrier").unwrap();
        assert_eq!(board.connects(), 2);
    }

    #[test]
    fn test_reacquire_before_timeout() {
        let board = MockBoard::new();
        let mgr = manager(&board, Duration::from_millis(200));
        drop(mgr.acquire(SERVER, DEVICE).unwrap());
        sleep(Duration::from_millis(50));
        let lease = mgr.acquire(SERVER, DEVICE).unwrap();
        sleep(Duration::from_millis(400));
        assert_eq!(board.connects(), 1);
        assert_eq!(board.disconnects(), 0);
        assert_eq!(
            mgr.state(SERVER, DEVICE),
            ConnectionState::Connected { leases: 1 }
        );
        assert!(lease.is_valid());
    }

    #[test]
    fn test_idle_expiry() {
        let board = MockBoard::new();
        let mgr = manager(&board, Duration::from_millis(50));
        drop(mgr.acquire(SERVER, DEVICE).unwrap());
        sleep(Duration::from_millis(300));
        assert_eq!(board.disconnects(), 1);
        assert_eq!(mgr.state(SERVER, DEVICE), ConnectionState::Absent);
        assert_eq!(mgr.open_connections(), 0);
        let _lease = mgr.acquire(SERVER, DEVICE).unwrap();
        assert_eq!(board.connects(), 2);
        drop(mgr);
        assert_eq!(board.disconnects(), 2);
    }

    #[test]
    fn test_stale_countdown_is_ignored() {
        let board = MockBoard::new();
        let mgr = manager(&board, Duration::from_millis(100));
        drop(mgr.acquire(SERVER, DEVICE).unwrap());
        // Release again a moment later, the second countdown is the only one that counts
        sleep(Duration::from_millis(60));
        drop(mgr.acquire(SERVER, DEVICE).unwrap());
        sleep(Duration::from_millis(60));
        assert_eq!(mgr.state(SERVER, DEVICE), ConnectionState::PendingRemoval);
        sleep(Duration::from_millis(200));
        assert_eq!(mgr.state(SERVER, DEVICE), ConnectionState::Absent);
        assert_eq!(board.disconnects(), 1);
    }

    #[test]
    fn test_failed_connect_records_nothing() {
        let board = MockBoard::new();
        let mgr = manager(&board, Duration::from_secs(10));
        board.set_offline(true);
        let err = mgr.acquire(SERVER, DEVICE).unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
        assert_eq!(mgr.state(SERVER, DEVICE), ConnectionState::Absent);
        board.set_offline(false);
        assert!(mgr.acquire(SERVER, DEVICE).is_ok());
        assert_eq!(board.connects(), 1);
    }

    #[test]
    fn test_drop_invalidates_leases() {
        let board = MockBoard::new();
        let mgr = manager(&board, Duration::from_secs(10));
        let leases: Vec<_> = (0..4)
            .map(|i| mgr.acquire(SERVER, &format!("device{i}")).unwrap())
            .collect();
        // One released lease leaves a countdown that the shutdown must kill
        drop(mgr.acquire(SERVER, "released").unwrap());
        drop(mgr);
        assert_eq!(board.disconnects(), 5);
        for lease in &leases {
            assert!(!lease.is_valid());
            let err = lease.with_transport(|_| ()).unwrap_err();
            assert!(matches!(err, Error::InvalidManager(_)));
        }
        // Clones and drops of dead leases are harmless
        let clone = leases[0].clone();
        drop(clone);
        drop(leases);
        assert_eq!(board.disconnects(), 5);
    }

    #[test]
    fn test_drop_does_not_wait_for_idle_timeout() {
        let board = MockBoard::new();
        let mgr = manager(&board, Duration::from_secs(3600));
        drop(mgr.acquire(SERVER, DEVICE).unwrap());
        let started = std::time::Instant::now();
        drop(mgr);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(board.disconnects(), 1);
    }

    #[test]
    fn test_with_transport() -> anyhow::Result<()> {
        let board = MockBoard::new();
        let mgr = manager(&board, Duration::from_secs(10));
        let lease = mgr.acquire(SERVER, DEVICE)?;
        let addr = RegisterAddress::new(DEVICE, 0x10);
        lease.with_transport(|t| t.write_register(&addr, 0xFF, Endianness::Little))??;
        assert_eq!(board.value(&addr), 0xFF);
        Ok(())
    }

    #[test]
    fn test_concurrent_acquire() {
        let board = MockBoard::new();
        let mgr = manager(&board, Duration::from_millis(20));
        std::thread::scope(|s| {
            for t in 0..8 {
                let mgr = &mgr;
                s.spawn(move || {
                    for i in 0..50 {
                        let device = format!("device{}", (t + i) % 3);
                        let lease = mgr.acquire(SERVER, &device).unwrap();
                        let _clone = lease.clone();
                    }
                });
            }
        });
        assert!(mgr.open_connections() <= 3);
        sleep(Duration::from_millis(200));
        assert_eq!(mgr.open_connections(), 0);
        assert_eq!(board.connects(), board.disconnects());
    }

    #[test]
    fn test_keep_alive_pings_open_connections() {
        let board = MockBoard::new();
        let settings = ManagerSettings {
            idle_timeout: Duration::from_secs(10),
            keep_alive: Some(Duration::from_millis(20)),
        };
        let mgr = ConnectionManager::new(board.connector(), &settings).unwrap();
        let _lease = mgr.acquire(SERVER, DEVICE).unwrap();
        sleep(Duration::from_millis(200));
        assert!(board.pings() >= 2);
        drop(mgr);
        let pings = board.pings();
        sleep(Duration::from_millis(100));
        assert_eq!(board.pings(), pings);
    }

    #[test]
    fn test_no_keep_alive_by_default() {
        let board = MockBoard::new();
        let mgr = ConnectionManager::new(board.connector(), &ManagerSettings::default()).unwrap();
        let _lease = mgr.acquire(SERVER, DEVICE).unwrap();
        sleep(Duration::from_millis(100));
        assert_eq!(board.pings(), 0);
    }

    #[test]
    fn test_probe() {
        let board = MockBoard::new();
        let mgr = manager(&board, Duration::from_secs(10));
        assert_eq!(mgr.probe(SERVER, DEVICE), DeviceStatus::Reachable);
        board.remove_device("sector.gone");
        assert_eq!(mgr.probe(SERVER, "sector.gone"), DeviceStatus::Unreachable);
        board.set_offline(true);
        assert_eq!(mgr.probe(SERVER, "sector.new"), DeviceStatus::ServerOffline);
        // The existing session is still pooled but the server stopped answering
        assert_eq!(mgr.probe(SERVER, DEVICE), DeviceStatus::ServerOffline);
    }
}
