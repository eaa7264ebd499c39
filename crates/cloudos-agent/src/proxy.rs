//! WebSocket <-> TCP relay for remote-desktop sessions.
//!
//! Payloads are forwarded verbatim, one frame/read at a time, never parsed.

use std::{
    fmt::Display,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use axum::extract::ws::{Message, WebSocket};
use cloudos_action::SessionId;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::watch,
    time::Instant,
};
use tracing::Instrument;

use crate::error::ProxyError;

const RELAY_CHUNK_BYTES: usize = 64 * 1024;
const CLOSE_GRACE: Duration = Duration::from_secs(1);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone)]
pub struct ProxyTarget {
    addr: String,
    connect_timeout: Duration,
    idle_timeout: Option<Duration>,
}

impl ProxyTarget {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// `None` keeps a session open for as long as both ends are healthy.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn connect(&self) -> Result<TcpStream, ProxyError> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(self.addr.as_str())).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(ProxyError::Connect {
                target: self.addr.clone(),
                source,
            }),
            Err(_) => Err(ProxyError::ConnectTimeout {
                target: self.addr.clone(),
                timeout_ms: self.connect_timeout.as_millis(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    ConnectFailed,
    ExternalClosed,
    LocalClosed,
    RelayFailed,
    IdleTimeout,
}

impl SessionEnd {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionEnd::ConnectFailed => "connect_failed",
            SessionEnd::ExternalClosed => "external_closed",
            SessionEnd::LocalClosed => "local_closed",
            SessionEnd::RelayFailed => "relay_failed",
            SessionEnd::IdleTimeout => "idle_timeout",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub id: SessionId,
    pub end: SessionEnd,
    pub error: Option<String>,
    pub bytes_to_local: u64,
    pub bytes_to_external: u64,
}

struct Shared {
    stop: watch::Sender<bool>,
    ended: Mutex<Option<(SessionEnd, Option<String>)>>,
    started: Instant,
    last_activity_ms: AtomicU64,
    to_local: AtomicU64,
    to_external: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            stop,
            ended: Mutex::new(None),
            started: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            to_local: AtomicU64::new(0),
            to_external: AtomicU64::new(0),
        }
    }

    /// First caller decides how the session ended; every caller raises the stop signal.
    fn finish(&self, end: SessionEnd, error: Option<String>) {
        {
            let mut ended = self.ended.lock().unwrap_or_else(|p| p.into_inner());
            if ended.is_none() {
                *ended = Some((end, error));
            }
        }
        self.stop.send_replace(true);
    }

    fn outcome(&self) -> (SessionEnd, Option<String>) {
        self.ended
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .unwrap_or((SessionEnd::RelayFailed, Some("relay ended without a reason".to_string())))
    }

    fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_activity_ms.store(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }
}

/// Raises the stop signal even if a relay task unwinds.
struct StopOnDrop(Arc<Shared>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0
            .finish(SessionEnd::RelayFailed, Some("relay task ended unexpectedly".to_string()));
    }
}

/// Relays an upgraded WebSocket to the target until either side goes away.
pub async fn run_websocket_session(socket: WebSocket, target: &ProxyTarget) -> SessionReport {
    let (tx, rx) = socket.split();
    run_session(tx, rx, target).await
}

/// Relays an external message channel to the target until either side goes away.
///
/// Returns only after both relay directions have stopped and both connections are
/// released.
pub async fn run_session<Tx, Rx, E>(mut tx: Tx, rx: Rx, target: &ProxyTarget) -> SessionReport
where
    Tx: Sink<Message> + Unpin + Send + 'static,
    Tx::Error: Display + Send + 'static,
    Rx: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    let id = SessionId::new();
    let span = tracing::info_span!("vnc_session", session = %id, target = %target.addr());

    async move {
        let local = match target.connect().await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, outcome = SessionEnd::ConnectFailed.as_str(), "proxy target unreachable");
                close_external(&mut tx).await;
                drop(rx);
                return SessionReport {
                    id,
                    end: SessionEnd::ConnectFailed,
                    error: Some(e.to_string()),
                    bytes_to_local: 0,
                    bytes_to_external: 0,
                };
            }
        };
        if let Err(e) = local.set_nodelay(true) {
            tracing::debug!(error = %e, "set_nodelay failed");
        }
        tracing::info!("relay started");

        let (local_rd, local_wr) = local.into_split();
        let shared = Arc::new(Shared::new());

        let inbound = tokio::spawn(
            pump_to_local(rx, local_wr, shared.clone(), shared.stop.subscribe()).in_current_span(),
        );
        let outbound = tokio::spawn(
            pump_to_external(local_rd, tx, shared.clone(), shared.stop.subscribe()).in_current_span(),
        );
        let watchdog = target.idle_timeout.map(|idle| {
            tokio::spawn(watch_idle(shared.clone(), idle, shared.stop.subscribe()).in_current_span())
        });

        let (inbound, outbound) = tokio::join!(inbound, outbound);
        for (direction, res) in [("to_local", inbound), ("to_external", outbound)] {
            if let Err(e) = res {
                tracing::error!(direction, error = %e, "relay task failed");
            }
        }
        if let Some(watchdog) = watchdog {
            let _ = watchdog.await;
        }

        let (end, error) = shared.outcome();
        let report = SessionReport {
            id,
            end,
            error,
            bytes_to_local: shared.to_local.load(Ordering::Relaxed),
            bytes_to_external: shared.to_external.load(Ordering::Relaxed),
        };
        match &report.error {
            Some(error) => tracing::warn!(
                outcome = end.as_str(),
                error = %error,
                bytes_to_local = report.bytes_to_local,
                bytes_to_external = report.bytes_to_external,
                "relay ended"
            ),
            None => tracing::info!(
                outcome = end.as_str(),
                bytes_to_local = report.bytes_to_local,
                bytes_to_external = report.bytes_to_external,
                "relay ended"
            ),
        }
        report
    }
    .instrument(span)
    .await
}

async fn close_external<Tx>(tx: &mut Tx)
where
    Tx: Sink<Message> + Unpin,
{
    let _ = tokio::time::timeout(CLOSE_GRACE, async {
        let _ = tx.send(Message::Close(None)).await;
        let _ = tx.close().await;
    })
    .await;
}

async fn pump_to_local<Rx, E>(
    mut rx: Rx,
    mut local: OwnedWriteHalf,
    shared: Arc<Shared>,
    mut stop: watch::Receiver<bool>,
) where
    Rx: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let _guard = StopOnDrop(shared.clone());
    loop {
        let msg = tokio::select! {
            _ = stop.changed() => break,
            msg = rx.next() => msg,
        };
        let payload = match msg {
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => {
                shared.finish(SessionEnd::ExternalClosed, None);
                break;
            }
            Some(Err(e)) => {
                shared.finish(SessionEnd::RelayFailed, Some(format!("read external: {e}")));
                break;
            }
        };

        let written = tokio::select! {
            _ = stop.changed() => break,
            r = local.write_all(&payload) => r,
        };
        if let Err(e) = written {
            shared.finish(SessionEnd::RelayFailed, Some(format!("write local: {e}")));
            break;
        }
        shared.to_local.fetch_add(payload.len() as u64, Ordering::Relaxed);
        shared.touch();
    }
    let _ = tokio::time::timeout(CLOSE_GRACE, local.shutdown()).await;
}

async fn pump_to_external<Tx>(
    mut local: OwnedReadHalf,
    mut tx: Tx,
    shared: Arc<Shared>,
    mut stop: watch::Receiver<bool>,
) where
    Tx: Sink<Message> + Unpin,
    Tx::Error: Display,
{
    let _guard = StopOnDrop(shared.clone());
    let mut buf = vec![0u8; RELAY_CHUNK_BYTES];
    loop {
        let read = tokio::select! {
            _ = stop.changed() => break,
            r = local.read(&mut buf) => r,
        };
        let n = match read {
            Ok(0) => {
                shared.finish(SessionEnd::LocalClosed, None);
                break;
            }
            Ok(n) => n,
            Err(e) => {
                shared.finish(SessionEnd::RelayFailed, Some(format!("read local: {e}")));
                break;
            }
        };

        let sent = tokio::select! {
            _ = stop.changed() => break,
            r = tx.send(Message::Binary(buf[..n].to_vec())) => r,
        };
        if let Err(e) = sent {
            shared.finish(SessionEnd::RelayFailed, Some(format!("write external: {e}")));
            break;
        }
        shared.to_external.fetch_add(n as u64, Ordering::Relaxed);
        shared.touch();
    }
    close_external(&mut tx).await;
}

async fn watch_idle(shared: Arc<Shared>, idle: Duration, mut stop: watch::Receiver<bool>) {
    loop {
        let remaining = idle.saturating_sub(shared.idle_for());
        if remaining.is_zero() {
            tracing::info!(idle_secs = idle.as_secs(), "relay idle; closing");
            shared.finish(SessionEnd::IdleTimeout, None);
            return;
        }
        tokio::select! {
            _ = stop.changed() => return,
            _ = tokio::time::sleep(remaining) => {}
        }
    }
}
