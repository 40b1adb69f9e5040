//! Session manager
//!
//! Owns the acceptor, the session factory and all live sessions. One
//! manager task serializes every state change: it accepts connections (one
//! outstanding accept at a time), tracks each session through a per-session
//! proxy, classifies how sessions end, enforces the active and stopping
//! caps, and aggregates statistics. Session completions hop onto the
//! manager task through an event channel, never touching manager state from
//! a session executor.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::completion::HandlerStorage;
use crate::counter::SaturatingCounter;
use crate::error::ServerError;
use crate::factory::SessionFactory;
use crate::session::{Session, SessionConfig};

/// Pause before re-arming accept after the factory reports `no_memory`.
const CREATE_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    pub endpoint: SocketAddr,
    pub max_session_count: usize,
    pub recycled_session_count: usize,
    pub max_stopping_sessions: usize,
    pub listen_backlog: u32,
    /// Accept budget; once spent and every session has finished, the
    /// manager's wait completes with `out_of_work`.
    pub max_accepted_total: Option<u64>,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Ready,
    Work,
    Stop,
    Stopped,
}

/// Aggregate counters, snapshot via [`SessionManager::stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionManagerStats {
    pub active: usize,
    pub max_active: usize,
    pub recycled: usize,
    pub total_accepted: SaturatingCounter,
    pub active_shutdowned: SaturatingCounter,
    pub out_of_work: SaturatingCounter,
    pub timed_out: SaturatingCounter,
    pub error_stopped: SaturatingCounter,
}

/// The manager's view of one session, distinct from the session's own
/// state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProxyState {
    Work,
    Stop,
    Stopped,
}

struct SessionProxy {
    session: Arc<Session>,
    state: ProxyState,
    /// Manager-issued operations still in flight against this session.
    pending_operations: usize,
    remote_endpoint: SocketAddr,
}

enum ManagerCmd {
    Stop,
}

enum Event {
    WaitDone(u64, ServerError),
    StopDone(u64, Result<(), ServerError>),
    /// A force-reset session has been reclaimed and released.
    Reclaimed(u64),
}

struct ManagerLife {
    state: ManagerState,
    cmd_tx: Option<mpsc::UnboundedSender<ManagerCmd>>,
    local_endpoint: Option<SocketAddr>,
    wait_result: Option<ServerError>,
    wait_done: bool,
}

struct ManagerShared {
    life: StdMutex<ManagerLife>,
    stats: StdMutex<SessionManagerStats>,
    wait_slot: HandlerStorage<ServerError>,
    stop_slot: HandlerStorage<Result<(), ServerError>>,
}

pub struct SessionManager {
    config: SessionManagerConfig,
    factory: Arc<dyn SessionFactory>,
    shared: Arc<ManagerShared>,
}

impl SessionManager {
    pub fn new(config: SessionManagerConfig, factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            config,
            factory,
            shared: Arc::new(ManagerShared {
                life: StdMutex::new(ManagerLife {
                    state: ManagerState::Ready,
                    cmd_tx: None,
                    local_endpoint: None,
                    wait_result: None,
                    wait_done: false,
                }),
                stats: StdMutex::new(SessionManagerStats::default()),
                wait_slot: HandlerStorage::new(),
                stop_slot: HandlerStorage::new(),
            }),
        }
    }

    pub fn state(&self) -> ManagerState {
        self.shared.life.lock().unwrap().state
    }

    /// Address the acceptor actually bound, once started. Lets a
    /// supervisor configure port 0 and discover the real port.
    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        self.shared.life.lock().unwrap().local_endpoint
    }

    /// Binds and listens on the configured endpoint, then launches the
    /// manager task. Must be called on the supervisor runtime.
    pub fn start(&self) -> Result<(), ServerError> {
        let mut life = self.shared.life.lock().unwrap();
        if life.state != ManagerState::Ready {
            return Err(ServerError::InvalidState);
        }

        let listener = match bind_listener(&self.config) {
            Ok(listener) => listener,
            Err(err) => {
                life.state = ManagerState::Stopped;
                return Err(err.into());
            }
        };
        let local = listener.local_addr().map_err(|err| {
            life.state = ManagerState::Stopped;
            ServerError::from(err)
        })?;
        life.local_endpoint = Some(local);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        life.cmd_tx = Some(cmd_tx);
        life.state = ManagerState::Work;
        drop(life);

        tracing::info!("[manager] listening on {}", local);
        let task = ManagerTask {
            config: self.config.clone(),
            factory: Arc::clone(&self.factory),
            shared: Arc::clone(&self.shared),
            events_tx,
            active: HashMap::new(),
            stopping: HashMap::new(),
            next_id: 1,
            accepted_total: 0,
            detached: 0,
            backoff_until: None,
            wait_fired: false,
        };
        tokio::spawn(task.run(listener, cmd_rx, events_rx));
        Ok(())
    }

    /// Resolves when the manager hits a terminal condition: a fatal
    /// acceptor error, the accept budget running dry (`out_of_work`), or
    /// `operation_aborted` when `stop` intervenes.
    pub async fn wait(&self) -> ServerError {
        let receiver = {
            let mut life = self.shared.life.lock().unwrap();
            if let Some(reason) = life.wait_result.take() {
                life.wait_done = true;
                return reason;
            }
            if life.wait_done || life.state != ManagerState::Work {
                return ServerError::InvalidState;
            }
            match self.shared.wait_slot.put() {
                Ok(receiver) => receiver,
                Err(err) => return err,
            }
        };
        match receiver.await {
            Ok(reason) => {
                self.shared.life.lock().unwrap().wait_done = true;
                reason
            }
            Err(_) => ServerError::OperationAborted,
        }
    }

    /// Stops accepting, fans a stop out to every live session, and
    /// resolves once all of them are stopped and released. Absorbed when
    /// the manager already stopped; a concurrent duplicate gets
    /// `invalid_state`.
    pub async fn stop(&self) -> Result<(), ServerError> {
        let receiver = {
            let mut life = self.shared.life.lock().unwrap();
            match life.state {
                ManagerState::Ready => {
                    life.state = ManagerState::Stopped;
                    return Ok(());
                }
                ManagerState::Stopped => return Ok(()),
                ManagerState::Work | ManagerState::Stop => {}
            }
            let receiver = self.shared.stop_slot.put()?;
            if life.state == ManagerState::Work {
                if let Some(cmd_tx) = &life.cmd_tx {
                    let _ = cmd_tx.send(ManagerCmd::Stop);
                }
            }
            receiver
        };
        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(ServerError::OperationAborted),
        }
    }

    /// Statistics snapshot; the recycled gauge reads through to the
    /// factory, which owns the bins.
    pub fn stats(&self) -> SessionManagerStats {
        let mut stats = *self.shared.stats.lock().unwrap();
        stats.recycled = self.factory.recycled_count();
        stats
    }
}

fn bind_listener(config: &SessionManagerConfig) -> std::io::Result<TcpListener> {
    let socket = match config.endpoint {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(config.endpoint)?;
    socket.listen(config.listen_backlog)
}

/// Accept errors that refer to the failed connection, not the acceptor.
fn is_transient_accept_error(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
    )
}

async fn accept_next(
    listener: &Option<TcpListener>,
) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

struct ManagerTask {
    config: SessionManagerConfig,
    factory: Arc<dyn SessionFactory>,
    shared: Arc<ManagerShared>,
    events_tx: mpsc::UnboundedSender<Event>,
    active: HashMap<u64, SessionProxy>,
    stopping: HashMap<u64, SessionProxy>,
    next_id: u64,
    accepted_total: u64,
    /// Force-reset reclaims still in flight; they block stop completion.
    detached: usize,
    backoff_until: Option<Instant>,
    wait_fired: bool,
}

impl ManagerTask {
    async fn run(
        mut self,
        listener: TcpListener,
        mut cmd_rx: mpsc::UnboundedReceiver<ManagerCmd>,
        mut events_rx: mpsc::UnboundedReceiver<Event>,
    ) {
        let mut listener = Some(listener);

        loop {
            let in_work = self.shared.life.lock().unwrap().state == ManagerState::Work;
            let budget_open = self
                .config
                .max_accepted_total
                .map_or(true, |budget| self.accepted_total < budget);
            let accept_armed = in_work
                && listener.is_some()
                && budget_open
                && self.backoff_until.is_none()
                && self.active.len() + self.stopping.len() < self.config.max_session_count;
            let backoff = self.backoff_until;

            tokio::select! {
                biased;

                cmd = cmd_rx.recv() => match cmd {
                    Some(ManagerCmd::Stop) => {
                        tracing::info!("[manager] stop requested");
                        self.begin_stop(&mut listener);
                    }
                    None => {
                        // Supervisor dropped the manager; abandon ship.
                        tracing::debug!("[manager] handle dropped, exiting");
                        break;
                    }
                },

                event = events_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_event(event);
                    }
                }

                _ = tokio::time::sleep_until(backoff.unwrap_or_else(Instant::now)),
                        if backoff.is_some() => {
                    self.backoff_until = None;
                }

                accepted = accept_next(&listener), if accept_armed => match accepted {
                    Ok((stream, remote)) => self.handle_accept(stream, remote),
                    Err(err) if is_transient_accept_error(&err) => {
                        tracing::warn!("[manager] transient accept error: {}", err);
                    }
                    Err(err) => {
                        tracing::error!("[manager] acceptor failed: {}", err);
                        self.fire_wait(err.into());
                        self.begin_stop(&mut listener);
                    }
                },
            }

            self.maybe_out_of_work();
            if self.maybe_complete_stop() {
                break;
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::WaitDone(id, reason) => self.handle_wait_done(id, reason),
            Event::StopDone(id, result) => self.handle_stop_done(id, result),
            Event::Reclaimed(_id) => {
                self.detached -= 1;
            }
        }
    }

    fn handle_accept(&mut self, stream: TcpStream, remote: SocketAddr) {
        self.accepted_total += 1;
        self.shared.stats.lock().unwrap().total_accepted.increment();

        let session = match self.factory.create(&self.config.session) {
            Ok(session) => session,
            Err(err) => {
                // Typically no_memory: refuse this connection, pause the
                // accept loop briefly, keep serving.
                tracing::warn!("[manager] session create failed: {}", err);
                self.shared.stats.lock().unwrap().error_stopped.increment();
                self.backoff_until = Some(Instant::now() + CREATE_BACKOFF);
                return;
            }
        };

        if let Err(err) = session.attach(stream).and_then(|()| session.start()) {
            // The failed session is stopped already; accounting, then back
            // to the factory.
            tracing::debug!("[manager] session start failed for {}: {}", remote, err);
            self.shared.stats.lock().unwrap().error_stopped.increment();
            self.factory.release(session);
            return;
        }

        let id = self.next_id;
        self.next_id += 1;
        tracing::info!("[manager] accepted connection from {}", remote);
        let proxy = SessionProxy {
            session: Arc::clone(&session),
            state: ProxyState::Work,
            pending_operations: 1,
            remote_endpoint: remote,
        };
        self.spawn_wait_hop(id, session);
        self.active.insert(id, proxy);

        let len = self.active.len();
        let mut stats = self.shared.stats.lock().unwrap();
        stats.active = len;
        if len > stats.max_active {
            stats.max_active = len;
        }
    }

    fn handle_wait_done(&mut self, id: u64, reason: ServerError) {
        if let Some(proxy) = self.active.get_mut(&id) {
            proxy.pending_operations -= 1;
            let remote = proxy.remote_endpoint;
            match reason {
                ServerError::OperationAborted => {
                    // Stopped by this manager; nothing further to record.
                }
                ServerError::InactivityTimeout => {
                    tracing::info!("[manager] session from {} timed out", remote);
                    self.shared.stats.lock().unwrap().timed_out.increment();
                    self.shut_down_session(id);
                }
                ServerError::EndOfStream => {
                    tracing::info!("[manager] session from {} shut down", remote);
                    self.shared
                        .stats
                        .lock()
                        .unwrap()
                        .active_shutdowned
                        .increment();
                    self.shut_down_session(id);
                }
                err => {
                    tracing::info!("[manager] session from {} failed: {}", remote, err);
                    self.shared.stats.lock().unwrap().error_stopped.increment();
                    self.shut_down_session(id);
                }
            }
        } else if let Some(proxy) = self.stopping.get_mut(&id) {
            // The session was already moved to stopping before its wait
            // completed; this is the aborted wait catching up.
            proxy.pending_operations -= 1;
            self.try_release(id);
        }
    }

    fn handle_stop_done(&mut self, id: u64, result: Result<(), ServerError>) {
        if let Err(err) = result {
            tracing::debug!("[manager] session stop completed with {}", err);
        }
        if let Some(proxy) = self.stopping.get_mut(&id) {
            proxy.pending_operations -= 1;
            proxy.state = ProxyState::Stopped;
            self.try_release(id);
        }
    }

    /// Moves an active session into graceful shutdown, or force-resets it
    /// when the stopping list is at capacity.
    fn shut_down_session(&mut self, id: u64) {
        let Some(mut proxy) = self.active.remove(&id) else {
            return;
        };
        self.shared.stats.lock().unwrap().active = self.active.len();

        if self.stopping.len() < self.config.max_stopping_sessions {
            proxy.state = ProxyState::Stop;
            proxy.pending_operations += 1;
            self.spawn_stop_hop(id, Arc::clone(&proxy.session));
            self.stopping.insert(id, proxy);
        } else {
            // No room for another graceful shutdown: close the socket
            // outright and hand the session straight back to the factory.
            self.detached += 1;
            let session = proxy.session;
            let factory = Arc::clone(&self.factory);
            let events_tx = self.events_tx.clone();
            tokio::spawn(async move {
                session.kill().await;
                factory.release(session);
                let _ = events_tx.send(Event::Reclaimed(id));
            });
        }
    }

    /// A proxy leaves the stopping list only when it is stopped and no
    /// manager-issued operation is still in flight against it.
    fn try_release(&mut self, id: u64) {
        let done = matches!(
            self.stopping.get(&id),
            Some(proxy) if proxy.state == ProxyState::Stopped && proxy.pending_operations == 0
        );
        if done {
            let proxy = self.stopping.remove(&id).expect("checked above");
            self.factory.release(proxy.session);
        }
    }

    fn begin_stop(&mut self, listener: &mut Option<TcpListener>) {
        {
            let mut life = self.shared.life.lock().unwrap();
            if life.state == ManagerState::Work {
                life.state = ManagerState::Stop;
            }
        }
        // Dropping the acceptor cancels any further accepts.
        *listener = None;
        self.fire_wait(ServerError::OperationAborted);

        // Same per-session path as steady state: graceful shutdown while
        // the stopping list has room, force-reset past the cap.
        let ids: Vec<u64> = self.active.keys().copied().collect();
        for id in ids {
            self.shut_down_session(id);
        }
    }

    fn maybe_complete_stop(&mut self) -> bool {
        if !(self.active.is_empty() && self.stopping.is_empty() && self.detached == 0) {
            return false;
        }
        {
            let mut life = self.shared.life.lock().unwrap();
            if life.state != ManagerState::Stop {
                return false;
            }
            life.state = ManagerState::Stopped;
            life.cmd_tx = None;
        }
        self.shared.stop_slot.post(Ok(()));
        tracing::info!("[manager] stopped");
        true
    }

    fn maybe_out_of_work(&mut self) {
        if self.wait_fired {
            return;
        }
        let budget_spent = self
            .config
            .max_accepted_total
            .map_or(false, |budget| self.accepted_total >= budget);
        if !budget_spent
            || !self.active.is_empty()
            || !self.stopping.is_empty()
            || self.detached != 0
        {
            return;
        }
        if self.shared.life.lock().unwrap().state != ManagerState::Work {
            return;
        }
        tracing::info!("[manager] accept budget spent, out of work");
        self.shared.stats.lock().unwrap().out_of_work.increment();
        self.fire_wait(ServerError::OutOfWork);
    }

    /// Delivers the manager wait completion exactly once; parks the reason
    /// if nobody registered yet.
    fn fire_wait(&mut self, reason: ServerError) {
        if self.wait_fired {
            return;
        }
        self.wait_fired = true;
        if !self.shared.wait_slot.post(reason) {
            self.shared.life.lock().unwrap().wait_result = Some(reason);
        }
    }

    fn spawn_wait_hop(&self, id: u64, session: Arc<Session>) {
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let reason = session.wait().await;
            let _ = events_tx.send(Event::WaitDone(id, reason));
        });
    }

    fn spawn_stop_hop(&self, id: u64, session: Arc<Session>) {
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = session.stop().await;
            let _ = events_tx.send(Event::StopDone(id, result));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::SimpleSessionFactory;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::runtime::Handle;

    fn test_manager(mutate: impl FnOnce(&mut SessionManagerConfig)) -> SessionManager {
        let mut config = SessionManagerConfig {
            endpoint: "127.0.0.1:0".parse().unwrap(),
            max_session_count: 8,
            recycled_session_count: 4,
            max_stopping_sessions: 4,
            listen_backlog: 16,
            max_accepted_total: None,
            session: SessionConfig {
                buffer_size: 64,
                max_transfer_size: 32,
                socket_recv_buffer_size: None,
                socket_send_buffer_size: None,
                no_delay: None,
                inactivity_timeout: None,
            },
        };
        mutate(&mut config);
        let factory = Arc::new(SimpleSessionFactory::new(
            Handle::current(),
            config.recycled_session_count,
        ));
        SessionManager::new(config, factory)
    }

    #[tokio::test]
    async fn test_start_then_stop() {
        let manager = test_manager(|_| {});
        manager.start().unwrap();
        assert_eq!(manager.state(), ManagerState::Work);
        assert!(manager.local_endpoint().is_some());

        manager.stop().await.unwrap();
        assert_eq!(manager.state(), ManagerState::Stopped);

        // Absorbed once stopped.
        assert_eq!(manager.stop().await, Ok(()));
    }

    #[tokio::test]
    async fn test_start_twice_is_invalid_state() {
        let manager = test_manager(|_| {});
        manager.start().unwrap();
        assert_eq!(manager.start(), Err(ServerError::InvalidState));
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_before_start_is_invalid_state() {
        let manager = test_manager(|_| {});
        assert_eq!(manager.wait().await, ServerError::InvalidState);
    }

    #[tokio::test]
    async fn test_stop_in_ready_is_immediate() {
        let manager = test_manager(|_| {});
        assert_eq!(manager.stop().await, Ok(()));
        assert_eq!(manager.state(), ManagerState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_aborts_pending_wait() {
        let manager = Arc::new(test_manager(|_| {}));
        manager.start().unwrap();
        let waiter = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.wait().await })
        };
        tokio::task::yield_now().await;

        manager.stop().await.unwrap();
        assert_eq!(waiter.await.unwrap(), ServerError::OperationAborted);
    }

    #[tokio::test]
    async fn test_accept_budget_runs_out_of_work() {
        let manager = test_manager(|config| {
            config.max_accepted_total = Some(1);
        });
        manager.start().unwrap();
        let addr = manager.local_endpoint().unwrap();

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        client.write_all(b"once").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"once");
        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        drop(client);

        assert_eq!(manager.wait().await, ServerError::OutOfWork);
        let stats = manager.stats();
        assert_eq!(stats.out_of_work.value(), 1);
        assert_eq!(stats.total_accepted.value(), 1);
        assert_eq!(stats.active_shutdowned.value(), 1);

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_surfaces_and_stops() {
        let holder = test_manager(|_| {});
        holder.start().unwrap();
        let taken = holder.local_endpoint().unwrap();

        let manager = test_manager(|config| {
            config.endpoint = taken;
        });
        let result = manager.start();
        assert!(matches!(result, Err(ServerError::Io(_))));
        assert_eq!(manager.state(), ManagerState::Stopped);

        holder.stop().await.unwrap();
    }
}
