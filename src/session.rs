//! Echo sessions
//!
//! One session owns one accepted TCP socket and echoes every byte back to
//! the peer through a cyclic buffer. All session state lives in a single
//! driver task on the session's executor, so reads, writes, timer expiry
//! and control commands are serialized without locking the hot path.
//!
//! Lifecycle: `ready → start → work → shutdown → stop → stopped`. The
//! `wait` completion fires exactly once with the reason the echo loop
//! ended; the `stop` completion fires when the session has fully shut down
//! and its socket is closed.

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::buffer::CyclicBuffer;
use crate::completion::HandlerStorage;
use crate::error::ServerError;
use crate::scratch::TransferScratch;

/// Inline scratch for discarding unread inbound bytes at shutdown.
pub const READ_SCRATCH_SIZE: usize = 256;

/// Immutable per-session transfer settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub buffer_size: usize,
    pub max_transfer_size: usize,
    pub socket_recv_buffer_size: Option<i32>,
    pub socket_send_buffer_size: Option<i32>,
    pub no_delay: Option<bool>,
    pub inactivity_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Ready,
    Start,
    Work,
    Shutdown,
    Stop,
    Stopped,
}

enum Command {
    /// Graceful shutdown: flush buffered echo, half-close, sweep unread
    /// input, then stop.
    Stop,
    /// Immediate teardown; acknowledged once the socket is closed.
    Kill(oneshot::Sender<()>),
}

/// Storage a session keeps across recycling: the ring and the shutdown
/// sweep scratch.
struct EchoCore {
    buffer: CyclicBuffer,
    read_scratch: TransferScratch<READ_SCRATCH_SIZE>,
}

impl EchoCore {
    fn new(config: &SessionConfig) -> Result<Self, ServerError> {
        Ok(Self {
            buffer: CyclicBuffer::new(config.buffer_size)?,
            read_scratch: TransferScratch::new(),
        })
    }
}

struct LifeState {
    state: SessionState,
    /// Socket attached by the manager, consumed by `start`.
    pending_socket: Option<TcpStream>,
    /// Control channel into the driver task; present while it runs.
    cmd_tx: Option<mpsc::UnboundedSender<Command>>,
    /// Transfer storage; absent while the driver task owns it.
    core: Option<EchoCore>,
    /// Terminal reason recorded before anyone called `wait`.
    wait_result: Option<ServerError>,
    /// The wait completion has been consumed for this lifecycle.
    wait_done: bool,
}

struct SessionShared {
    life: StdMutex<LifeState>,
    wait_slot: HandlerStorage<ServerError>,
    stop_slot: HandlerStorage<Result<(), ServerError>>,
}

pub struct Session {
    config: SessionConfig,
    executor: Handle,
    home_shard: usize,
    shared: Arc<SessionShared>,
}

impl Session {
    /// Builds a session pinned to `executor`. `home_shard` records which
    /// factory shard constructed it so releases return to the same bin.
    pub fn new(
        executor: Handle,
        config: &SessionConfig,
        home_shard: usize,
    ) -> Result<Arc<Self>, ServerError> {
        let core = EchoCore::new(config)?;
        Ok(Arc::new(Self {
            config: config.clone(),
            executor,
            home_shard,
            shared: Arc::new(SessionShared {
                life: StdMutex::new(LifeState {
                    state: SessionState::Ready,
                    pending_socket: None,
                    cmd_tx: None,
                    core: Some(core),
                    wait_result: None,
                    wait_done: false,
                }),
                wait_slot: HandlerStorage::new(),
                stop_slot: HandlerStorage::new(),
            }),
        }))
    }

    pub fn state(&self) -> SessionState {
        self.shared.life.lock().unwrap().state
    }

    pub(crate) fn home_shard(&self) -> usize {
        self.home_shard
    }

    /// Hands an accepted socket to the session. Allowed only in `ready`.
    pub fn attach(&self, socket: TcpStream) -> Result<(), ServerError> {
        let mut life = self.shared.life.lock().unwrap();
        if life.state != SessionState::Ready || life.pending_socket.is_some() {
            return Err(ServerError::InvalidState);
        }
        life.pending_socket = Some(socket);
        Ok(())
    }

    /// Applies socket options and launches the echo driver.
    ///
    /// On socket setup failure the session transitions straight to
    /// `stopped` and the error is returned to the caller.
    pub fn start(&self) -> Result<(), ServerError> {
        let mut life = self.shared.life.lock().unwrap();
        if life.state != SessionState::Ready {
            return Err(ServerError::InvalidState);
        }
        let socket = life.pending_socket.take().ok_or(ServerError::InvalidState)?;
        life.state = SessionState::Start;

        if let Err(err) = self.apply_socket_options(&socket) {
            tracing::debug!("[session] socket setup failed: {}", err);
            life.state = SessionState::Stopped;
            return Err(err);
        }

        let core = match life.core.take() {
            Some(core) => core,
            None => {
                life.state = SessionState::Stopped;
                return Err(ServerError::InvalidState);
            }
        };
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        life.cmd_tx = Some(cmd_tx);
        life.state = SessionState::Work;
        drop(life);

        let driver = Driver {
            socket,
            core,
            cmd_rx,
            config: self.config.clone(),
            shared: Arc::clone(&self.shared),
            first_error: None,
            eof_seen: false,
            read_failed: false,
            write_failed: false,
            wait_fired: false,
            shutdown_sent: false,
        };
        self.executor.spawn(driver.run());
        Ok(())
    }

    /// Resolves with the reason the echo loop ended: `end_of_stream` on a
    /// drained half-close, `inactivity_timeout`, `operation_aborted` on
    /// stop, or the first socket error. Fires at most once per lifecycle;
    /// misuse gets `invalid_state`.
    pub async fn wait(&self) -> ServerError {
        let receiver = {
            let mut life = self.shared.life.lock().unwrap();
            if let Some(reason) = life.wait_result.take() {
                life.wait_done = true;
                return reason;
            }
            if life.wait_done
                || !matches!(life.state, SessionState::Work | SessionState::Shutdown)
            {
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

    /// Requests graceful shutdown: echo bytes already buffered are flushed
    /// to the peer, then the socket is half-closed so the peer sees EOF,
    /// unread input is swept, and the session closes. Resolves with the
    /// session's first error or success. In `ready` the session stops on
    /// the spot. A second stop while one is pending, or after the session
    /// stopped, gets `invalid_state`.
    pub async fn stop(&self) -> Result<(), ServerError> {
        let receiver = {
            let mut life = self.shared.life.lock().unwrap();
            match life.state {
                SessionState::Ready => {
                    life.state = SessionState::Stopped;
                    life.pending_socket = None;
                    return Ok(());
                }
                SessionState::Work | SessionState::Shutdown => {}
                _ => return Err(ServerError::InvalidState),
            }
            let receiver = self.shared.stop_slot.put()?;
            if let Some(cmd_tx) = &life.cmd_tx {
                let _ = cmd_tx.send(Command::Stop);
            }
            receiver
        };
        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(ServerError::OperationAborted),
        }
    }

    /// Immediate teardown: closes the socket without the graceful
    /// half-close. Used by the manager when the stopping list is full.
    /// Completes once the driver has torn down; a session never started
    /// stops on the spot.
    pub(crate) async fn kill(&self) {
        let ack = {
            let mut life = self.shared.life.lock().unwrap();
            match life.state {
                SessionState::Ready => {
                    life.state = SessionState::Stopped;
                    life.pending_socket = None;
                    return;
                }
                SessionState::Stopped => return,
                _ => {}
            }
            let (ack_tx, ack_rx) = oneshot::channel();
            match &life.cmd_tx {
                Some(cmd_tx) if cmd_tx.send(Command::Kill(ack_tx)).is_ok() => Some(ack_rx),
                _ => None,
            }
        };
        if let Some(ack) = ack {
            let _ = ack.await;
        }
    }

    /// Returns a stopped session to `ready` for reuse, keeping its buffer
    /// allocation. Called by factories when a recycled session is handed
    /// out again.
    pub(crate) fn reset(&self) -> Result<(), ServerError> {
        let mut life = self.shared.life.lock().unwrap();
        if life.state != SessionState::Stopped {
            return Err(ServerError::InvalidState);
        }
        match life.core.as_mut() {
            Some(core) => core.buffer.reset(),
            None => life.core = Some(EchoCore::new(&self.config)?),
        }
        life.pending_socket = None;
        life.cmd_tx = None;
        life.wait_result = None;
        life.wait_done = false;
        self.shared.wait_slot.cancel();
        self.shared.stop_slot.cancel();
        life.state = SessionState::Ready;
        Ok(())
    }

    fn apply_socket_options(&self, socket: &TcpStream) -> Result<(), ServerError> {
        if let Some(size) = self.config.socket_recv_buffer_size {
            set_socket_buffer(socket.as_raw_fd(), libc::SO_RCVBUF, size)?;
        }
        if let Some(size) = self.config.socket_send_buffer_size {
            set_socket_buffer(socket.as_raw_fd(), libc::SO_SNDBUF, size)?;
        }
        if let Some(no_delay) = self.config.no_delay {
            socket.set_nodelay(no_delay)?;
        }
        Ok(())
    }
}

fn set_socket_buffer(fd: RawFd, option: libc::c_int, size: i32) -> std::io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            option,
            &size as *const i32 as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// The per-session task. Owns the socket and transfer storage outright;
/// everything else reaches it through the command channel.
struct Driver {
    socket: TcpStream,
    core: EchoCore,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    config: SessionConfig,
    shared: Arc<SessionShared>,
    first_error: Option<ServerError>,
    eof_seen: bool,
    /// A read failed; no further reads are issued.
    read_failed: bool,
    /// A write failed; buffered bytes can no longer be delivered.
    write_failed: bool,
    wait_fired: bool,
    shutdown_sent: bool,
}

impl Driver {
    async fn run(mut self) {
        let idle_window = self.config.inactivity_timeout;
        let timer = tokio::time::sleep(Duration::from_secs(0));
        tokio::pin!(timer);
        if let Some(window) = idle_window {
            timer.as_mut().reset(Instant::now() + window);
        }

        // Wind-down phase: no new reads, buffered echo keeps flushing.
        let mut draining = false;
        // A stop command arrived; leave the loop once the flush is done.
        let mut stop_requested = false;
        let mut kill_ack = None;
        let mut killed = false;

        loop {
            // The timer's only job is firing the wait completion, which
            // happens at most once. Transfers keep going regardless.
            let timer_armed = idle_window.is_some() && !self.wait_fired;
            let want_read = !draining
                && !self.eof_seen
                && !self.read_failed
                && self.core.buffer.free() > 0;
            let want_write = !self.write_failed && self.core.buffer.filled() > 0;

            tokio::select! {
                biased;

                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Stop) => {
                        self.fire_wait(ServerError::OperationAborted);
                        self.mark_shutdown();
                        draining = true;
                        stop_requested = true;
                    }
                    Some(Command::Kill(ack)) => {
                        kill_ack = Some(ack);
                        killed = true;
                        break;
                    }
                    None => {
                        // Session handle dropped; nobody is left to observe.
                        killed = true;
                        break;
                    }
                },

                _ = &mut timer, if timer_armed => {
                    tracing::debug!("[session] inactivity timeout expired");
                    if self.first_error.is_none() {
                        self.first_error = Some(ServerError::InactivityTimeout);
                    }
                    self.fire_wait(ServerError::InactivityTimeout);
                    self.mark_shutdown();
                    draining = true;
                }

                ready = self.socket.readable(), if want_read => {
                    let transferred = match ready {
                        Ok(()) => self.read_once(),
                        Err(err) => {
                            self.read_failed = true;
                            self.on_transfer_error(err.into());
                            0
                        }
                    };
                    if transferred > 0 {
                        if let Some(window) = idle_window {
                            timer.as_mut().reset(Instant::now() + window);
                        }
                    }
                }

                ready = self.socket.writable(), if want_write => {
                    let transferred = match ready {
                        Ok(()) => self.write_once(),
                        Err(err) => {
                            self.write_failed = true;
                            self.on_transfer_error(err.into());
                            0
                        }
                    };
                    if transferred > 0 {
                        if let Some(window) = idle_window {
                            timer.as_mut().reset(Instant::now() + window);
                        }
                    }
                }
            }

            if self.eof_seen && self.core.buffer.filled() == 0 {
                // Peer half-closed and every byte has been echoed back.
                self.fire_wait(ServerError::EndOfStream);
            }

            if draining && (self.core.buffer.filled() == 0 || self.write_failed) {
                // Buffered echo is flushed (or undeliverable): let the peer
                // see EOF and discard whatever input is left.
                self.half_close().await;
                self.sweep_unread();
                if stop_requested {
                    break;
                }
            }
        }

        self.finish(killed, kill_ack);
    }

    /// One readiness-gated read straight into the ring's first free run,
    /// capped at the configured transfer size.
    fn read_once(&mut self) -> usize {
        let limit = self.config.max_transfer_size;
        let (first, _) = self.core.buffer.prepared();
        let len = first.len().min(limit);
        match self.socket.try_read(&mut first[..len]) {
            Ok(0) => {
                self.eof_seen = true;
                0
            }
            Ok(n) => {
                self.core.buffer.commit(n);
                n
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => 0,
            Err(err) => {
                self.read_failed = true;
                self.on_transfer_error(err.into());
                0
            }
        }
    }

    /// One readiness-gated write offering the first contiguous filled run,
    /// capped at the configured transfer size. A wrapped run takes a second
    /// pass once the cursor comes around.
    fn write_once(&mut self) -> usize {
        let limit = self.config.max_transfer_size;
        let (first, _) = self.core.buffer.data();
        let len = first.len().min(limit);
        match self.socket.try_write(&first[..len]) {
            Ok(n) => {
                self.core.buffer.consume(n);
                n
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => 0,
            Err(err) => {
                self.write_failed = true;
                self.on_transfer_error(err.into());
                0
            }
        }
    }

    /// Records the first socket error and reports it through the wait
    /// completion; follow-on errors are absorbed.
    fn on_transfer_error(&mut self, err: ServerError) {
        if self.first_error.is_none() {
            self.first_error = Some(err);
        }
        tracing::debug!("[session] transfer error: {}", err);
        self.fire_wait(err);
    }

    /// Delivers the wait completion exactly once. If nobody registered yet
    /// the reason is parked for the next `wait` call.
    fn fire_wait(&mut self, reason: ServerError) {
        if self.wait_fired {
            return;
        }
        self.wait_fired = true;
        if !self.shared.wait_slot.post(reason) {
            self.shared.life.lock().unwrap().wait_result = Some(reason);
        }
    }

    /// Moves the observable state to `shutdown` when a stop request or
    /// timeout begins the wind-down.
    fn mark_shutdown(&self) {
        let mut life = self.shared.life.lock().unwrap();
        if life.state == SessionState::Work {
            life.state = SessionState::Shutdown;
        }
    }

    /// Half-closes the send direction so the peer observes EOF.
    async fn half_close(&mut self) {
        if self.shutdown_sent {
            return;
        }
        self.shutdown_sent = true;
        if let Err(err) = self.socket.shutdown().await {
            tracing::debug!("[session] send shutdown failed: {}", err);
        }
    }

    /// Discards input that already arrived so an unread backlog does not
    /// turn the close into a connection reset. Never blocks.
    fn sweep_unread(&mut self) {
        loop {
            let mut lease = self.core.read_scratch.lease(READ_SCRATCH_SIZE);
            match self.socket.try_read(&mut lease) {
                Ok(n) if n > 0 => continue,
                _ => break,
            }
        }
    }

    fn finish(mut self, killed: bool, kill_ack: Option<oneshot::Sender<()>>) {
        self.fire_wait(ServerError::OperationAborted);

        {
            let mut life = self.shared.life.lock().unwrap();
            life.state = SessionState::Stop;
        }
        // Dropping the socket closes it.
        drop(self.socket);
        {
            let mut life = self.shared.life.lock().unwrap();
            life.state = SessionState::Stopped;
            life.cmd_tx = None;
            life.core = Some(self.core);
        }

        let stop_result = if killed {
            Err(ServerError::OperationAborted)
        } else {
            match self.first_error {
                None => Ok(()),
                Some(err) => Err(err),
            }
        };
        self.shared.stop_slot.post(stop_result);

        if let Some(ack) = kill_ack {
            let _ = ack.send(());
        }
        tracing::debug!("[session] stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn test_config() -> SessionConfig {
        SessionConfig {
            buffer_size: 64,
            max_transfer_size: 32,
            socket_recv_buffer_size: None,
            socket_send_buffer_size: None,
            no_delay: None,
            inactivity_timeout: None,
        }
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted, client) = tokio::join!(
            async { listener.accept().await.unwrap().0 },
            async { TcpStream::connect(addr).await.unwrap() },
        );
        (accepted, client)
    }

    #[tokio::test]
    async fn test_echo_round_trip_then_eof() {
        let (server_side, mut client) = socket_pair().await;
        let session = Session::new(Handle::current(), &test_config(), 0).unwrap();
        session.attach(server_side).unwrap();
        session.start().unwrap();
        assert_eq!(session.state(), SessionState::Work);

        client.write_all(b"HELLO").await.unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"HELLO");

        client.shutdown().await.unwrap();
        assert_eq!(session.wait().await, ServerError::EndOfStream);

        assert_eq!(session.stop().await, Ok(()));
        assert_eq!(session.state(), SessionState::Stopped);

        // Peer observes EOF once the session is gone.
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_streams_larger_than_buffer() {
        let (server_side, client) = socket_pair().await;
        let config = SessionConfig {
            buffer_size: 16,
            max_transfer_size: 8,
            ..test_config()
        };
        let session = Session::new(Handle::current(), &config, 0).unwrap();
        session.attach(server_side).unwrap();
        session.start().unwrap();

        let sent: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let payload = sent.clone();
        let (mut read_half, mut write_half) = client.into_split();
        let writer = tokio::spawn(async move {
            write_half.write_all(&payload).await.unwrap();
            write_half.shutdown().await.unwrap();
        });

        let mut echoed = vec![0u8; sent.len()];
        read_half.read_exact(&mut echoed).await.unwrap();
        writer.await.unwrap();
        assert_eq!(echoed, sent);

        assert_eq!(session.wait().await, ServerError::EndOfStream);
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_twice_is_invalid_state() {
        let (server_side, _client) = socket_pair().await;
        let session = Session::new(Handle::current(), &test_config(), 0).unwrap();
        session.attach(server_side).unwrap();
        session.start().unwrap();
        assert_eq!(session.start(), Err(ServerError::InvalidState));
    }

    #[tokio::test]
    async fn test_wait_before_start_is_invalid_state() {
        let session = Session::new(Handle::current(), &test_config(), 0).unwrap();
        assert_eq!(session.wait().await, ServerError::InvalidState);
    }

    #[tokio::test]
    async fn test_stop_in_ready_stops_immediately() {
        let session = Session::new(Handle::current(), &test_config(), 0).unwrap();
        assert_eq!(session.stop().await, Ok(()));
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.stop().await, Err(ServerError::InvalidState));
    }

    #[tokio::test]
    async fn test_inactivity_timeout_fires_wait_and_half_closes() {
        let (server_side, mut client) = socket_pair().await;
        let config = SessionConfig {
            inactivity_timeout: Some(Duration::from_millis(50)),
            ..test_config()
        };
        let session = Session::new(Handle::current(), &config, 0).unwrap();
        session.attach(server_side).unwrap();
        session.start().unwrap();

        assert_eq!(session.wait().await, ServerError::InactivityTimeout);

        // The half-close reaches the peer as EOF.
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());

        assert_eq!(session.stop().await, Err(ServerError::InactivityTimeout));
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_transfer_rearms_inactivity_timer() {
        let (server_side, mut client) = socket_pair().await;
        let config = SessionConfig {
            inactivity_timeout: Some(Duration::from_millis(400)),
            ..test_config()
        };
        let session = Session::new(Handle::current(), &config, 0).unwrap();
        session.attach(server_side).unwrap();
        session.start().unwrap();

        // Keep the session busy past the original deadline.
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(150)).await;
            client.write_all(b"ping").await.unwrap();
            let mut echoed = [0u8; 4];
            client.read_exact(&mut echoed).await.unwrap();
        }
        assert_eq!(session.state(), SessionState::Work);

        assert_eq!(session.wait().await, ServerError::InactivityTimeout);
    }

    #[tokio::test]
    async fn test_stop_aborts_pending_wait() {
        let (server_side, mut client) = socket_pair().await;
        let session = Session::new(Handle::current(), &test_config(), 0).unwrap();
        session.attach(server_side).unwrap();
        session.start().unwrap();

        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.wait().await })
        };
        // Let the waiter register before stopping.
        tokio::task::yield_now().await;

        assert_eq!(session.stop().await, Ok(()));
        assert_eq!(waiter.await.unwrap(), ServerError::OperationAborted);
        assert_eq!(session.state(), SessionState::Stopped);

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_stop_flushes_buffered_echo() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Small socket buffers on both sides so the echo stalls and bytes
        // pile up in the session buffer instead of the kernel.
        let client_socket = tokio::net::TcpSocket::new_v4().unwrap();
        client_socket.set_recv_buffer_size(4096).unwrap();
        let (client, server_side) = tokio::join!(
            async { client_socket.connect(addr).await.unwrap() },
            async { listener.accept().await.unwrap().0 },
        );
        let mut client = client;

        let config = SessionConfig {
            buffer_size: 32 * 1024,
            max_transfer_size: 4096,
            socket_send_buffer_size: Some(4096),
            ..test_config()
        };
        let session = Session::new(Handle::current(), &config, 0).unwrap();
        session.attach(server_side).unwrap();
        session.start().unwrap();

        let payload: Vec<u8> = (0..24 * 1024u32).map(|i| (i % 241) as u8).collect();
        client.write_all(&payload).await.unwrap();
        client.shutdown().await.unwrap();

        // Let the session pull the whole payload into its buffer while the
        // peer reads nothing back.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let stopper = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.stop().await })
        };

        // Everything the session buffered must still be echoed, then EOF.
        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, payload);
        assert_eq!(stopper.await.unwrap(), Ok(()));
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_reset_allows_reuse_with_kept_storage() {
        let (server_side, mut client) = socket_pair().await;
        let session = Session::new(Handle::current(), &test_config(), 3).unwrap();
        assert_eq!(session.home_shard(), 3);
        session.attach(server_side).unwrap();
        session.start().unwrap();
        client.shutdown().await.unwrap();
        assert_eq!(session.wait().await, ServerError::EndOfStream);
        session.stop().await.unwrap();

        session.reset().unwrap();
        assert_eq!(session.state(), SessionState::Ready);

        let (server_side, mut client) = socket_pair().await;
        session.attach(server_side).unwrap();
        session.start().unwrap();
        client.write_all(b"again").await.unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"again");
        client.shutdown().await.unwrap();
        assert_eq!(session.wait().await, ServerError::EndOfStream);
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_kill_closes_without_graceful_half_close() {
        let (server_side, mut client) = socket_pair().await;
        let session = Session::new(Handle::current(), &test_config(), 0).unwrap();
        session.attach(server_side).unwrap();
        session.start().unwrap();

        session.kill().await;
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.wait().await, ServerError::OperationAborted);

        let mut buf = Vec::new();
        let _ = client.read_to_end(&mut buf).await;
        assert!(buf.is_empty());
    }
}
