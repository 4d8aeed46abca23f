//! `Connection`: AMQP connection lifecycle with URL failover, automatic
//! reconnection and revival of registered clients (spec §4.1).
//!
//! Every `lapin` call for a given `Connection` happens on one dedicated,
//! single-threaded `tokio` runtime (`io_runtime` below), mirroring the
//! original's "one executor per connection" rule: handlers fired on AMQP
//! events can rely on never running concurrently with each other. Calling
//! from outside that thread spawns onto it (`post`); calling from inside it
//! runs inline (`dispatch`) so a handler can itself queue further work
//! without deadlocking on its own executor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use lapin::{Connection as LapinConnection, ConnectionProperties};
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, warn};

use kb_common::{ErrorCode, KaraboError, Result};

use crate::config::parse_broker_url;

const MIN_RECONNECT_DELAY_MS: u64 = 2_000;
const MAX_RECONNECT_DELAY_MS: u64 = 15_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unknown,
    Started,
    NotConnected,
    ConnectionDone,
    ConnectionReady,
    ConnectionClosed,
    ConnectionError,
    ConnectionLost,
}

/// A client that keeps state derived from the connection (subscriptions,
/// a `lapin::Channel`) and must replay it after an automatic reconnect.
pub trait Revivable: Send + Sync {
    fn revive_if_reconnected(&self);
}

struct Inner {
    state: ConnectionState,
    url_index: usize,
    lapin: Option<LapinConnection>,
    waiters: Vec<oneshot::Sender<Result<()>>>,
    registered: Vec<Weak<dyn Revivable>>,
}

/// A dedicated current-thread `tokio` runtime, running on its own OS
/// thread, that every `lapin` call for one `Connection` is funneled
/// through.
struct IoExecutor {
    handle: tokio::runtime::Handle,
    thread_id: std::thread::ThreadId,
    shutdown: Arc<Notify>,
    join: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl IoExecutor {
    fn spawn_thread() -> Self {
        let (tx, rx) = std::sync::mpsc::channel();
        let shutdown = Arc::new(Notify::new());
        let shutdown_wait = shutdown.clone();
        let join = std::thread::Builder::new()
            .name("kb-net-io".to_string())
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("build dedicated io runtime");
                tx.send((rt.handle().clone(), std::thread::current().id())).ok();
                rt.block_on(shutdown_wait.notified());
            })
            .expect("spawn io thread");
        let (handle, thread_id) = rx.recv().expect("io thread reported its handle");
        Self { handle, thread_id, shutdown, join: Mutex::new(Some(join)) }
    }

    fn is_current(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    fn spawn<F>(&self, fut: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(fut)
    }
}

impl Drop for IoExecutor {
    fn drop(&mut self) {
        self.shutdown.notify_one();
        if let Some(join) = self.join.lock().take() {
            let _ = join.join();
        }
    }
}

/// An AMQP connection, managing the state machine described in spec §4.1:
/// `Unknown -> Started -> (per url) NotConnected -> ConnectionDone ->
/// ConnectionReady`, with `ConnectionError`/`ConnectionClosed`/
/// `ConnectionLost` as the terminal or transient failure states.
pub struct Connection {
    urls: Vec<String>,
    io: IoExecutor,
    inner: Arc<Mutex<Inner>>,
}

impl Connection {
    pub fn new(urls: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            urls,
            io: IoExecutor::spawn_thread(),
            inner: Arc::new(Mutex::new(Inner {
                state: ConnectionState::Unknown,
                url_index: 0,
                lapin: None,
                waiters: Vec::new(),
                registered: Vec::new(),
            })),
        })
    }

    pub fn io_runtime(&self) -> tokio::runtime::Handle {
        self.io.handle.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().state == ConnectionState::ConnectionReady
    }

    /// Register a client to be revived (its `revive_if_reconnected` called)
    /// after every successful reconnect. Held weakly: a dropped client is
    /// pruned the next time revival runs.
    pub fn register_for_reconnect_info(&self, client: Weak<dyn Revivable>) {
        self.inner.lock().registered.push(client);
    }

    /// Run `f` on the connection's dedicated executor, spawning if called
    /// from elsewhere and running inline if already there.
    async fn run_on_io<F, T>(&self, f: F) -> T
    where
        F: std::future::Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.io.is_current() {
            f.await
        } else {
            self.io.spawn(f).await.expect("io task panicked")
        }
    }

    /// Connect using the first reachable URL, trying each of `urls` in
    /// order. Concurrent callers while a connect attempt is already in
    /// flight are coalesced onto the same outcome.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let this = self.clone();
        self.run_on_io(async move { this.begin_connect(tx).await }).await;
        rx.await.unwrap_or_else(|_| Err(KaraboError::new(ErrorCode::OperationCanceled, "connection dropped")))
    }

    async fn begin_connect(self: Arc<Self>, waiter: oneshot::Sender<Result<()>>) {
        let should_start = {
            let mut inner = self.inner.lock();
            match inner.state {
                ConnectionState::ConnectionReady => {
                    let _ = waiter.send(Ok(()));
                    false
                }
                ConnectionState::Started | ConnectionState::NotConnected | ConnectionState::ConnectionDone => {
                    inner.waiters.push(waiter);
                    false
                }
                _ => {
                    inner.waiters.push(waiter);
                    inner.state = ConnectionState::Started;
                    inner.url_index = 0;
                    true
                }
            }
        };
        if should_start {
            self.try_connect_from(0).await;
        }
    }

    fn try_connect_from(self: Arc<Self>, start_index: usize) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
            if start_index >= self.urls.len() {
                self.finish_connect(Err(KaraboError::new(ErrorCode::ConnectionRefused, "no reachable broker url")));
                return;
            }
            let raw_url = &self.urls[start_index];
            self.inner.lock().state = ConnectionState::NotConnected;
            let parsed = match parse_broker_url(raw_url) {
                Ok(p) => p,
                Err(_) => {
                    self.clone().try_connect_from(start_index + 1).await;
                    return;
                }
            };
            debug!(url = %raw_url, "attempting broker connection");
            let uri = parsed.to_amqp_uri();
            match LapinConnection::connect(&uri, ConnectionProperties::default()).await {
                Ok(conn) => {
                    self.inner.lock().state = ConnectionState::ConnectionDone;
                    self.install(conn, start_index).await;
                    self.finish_connect(Ok(()));
                }
                Err(err) => {
                    warn!(url = %raw_url, error = %err, "broker connection attempt failed");
                    self.clone().try_connect_from(start_index + 1).await;
                }
            }
        })
    }

    async fn install(self: &Arc<Self>, conn: LapinConnection, url_index: usize) {
        let weak_self: Weak<Connection> = Arc::downgrade(self);
        conn.on_error(move |err| {
            if let Some(this) = weak_self.upgrade() {
                this.io.spawn(this.clone().handle_lost(err.to_string()));
            }
        });
        let mut inner = self.inner.lock();
        inner.lapin = Some(conn);
        inner.url_index = url_index;
        inner.state = ConnectionState::ConnectionReady;
    }

    fn finish_connect(self: &Arc<Self>, result: Result<()>) {
        let waiters = {
            let mut inner = self.inner.lock();
            if result.is_err() {
                inner.state = ConnectionState::ConnectionError;
            }
            std::mem::take(&mut inner.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(clone_result(&result));
        }
        if result.is_ok() {
            self.revive_registered();
        }
    }

    fn revive_registered(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        inner.registered.retain(|weak| {
            if let Some(client) = weak.upgrade() {
                client.revive_if_reconnected();
                true
            } else {
                false
            }
        });
    }

    async fn handle_lost(self: Arc<Self>, reason: String) {
        let should_reconnect = {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::ConnectionClosed {
                // an intentional disconnect() already ran; nothing to do.
                false
            } else {
                warn!(%reason, "connection lost, scheduling reconnect");
                inner.state = ConnectionState::ConnectionLost;
                inner.lapin = None;
                true
            }
        };
        if should_reconnect {
            self.schedule_reconnect().await;
        }
    }

    async fn schedule_reconnect(self: Arc<Self>) {
        let delay_ms = {
            let mut rng = rand::rng();
            rng.random_range(MIN_RECONNECT_DELAY_MS..=MAX_RECONNECT_DELAY_MS)
        };
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        {
            let mut inner = self.inner.lock();
            if inner.state != ConnectionState::ConnectionLost {
                return;
            }
            inner.state = ConnectionState::Started;
            inner.url_index = 0;
        }
        info!(delay_ms, "reconnecting to broker");
        self.try_connect_from(0).await;
    }

    /// Open a new AMQP channel on this connection, failing with
    /// `NotConnected` if the connection is not currently ready.
    pub async fn create_channel(self: &Arc<Self>) -> Result<lapin::Channel> {
        let conn = {
            let inner = self.inner.lock();
            if inner.state != ConnectionState::ConnectionReady {
                return Err(KaraboError::new(ErrorCode::NotConnected, "connection is not ready"));
            }
            inner.lapin.clone()
        };
        let conn = conn.ok_or_else(|| KaraboError::new(ErrorCode::NotConnected, "connection is not ready"))?;
        self.run_on_io(async move {
            conn.create_channel()
                .await
                .map_err(|e| KaraboError::with_source(ErrorCode::CreateChannelError, "failed to create channel", e))
        })
        .await
    }

    /// Intentionally close the connection. Any queued connect waiters are
    /// released with `OperationCanceled`, and reconnection is suppressed.
    pub async fn disconnect(self: &Arc<Self>) {
        let conn = {
            let mut inner = self.inner.lock();
            inner.state = ConnectionState::ConnectionClosed;
            inner.lapin.take()
        };
        if let Some(conn) = conn {
            let _ = self.run_on_io(async move { conn.close(200, "bye").await }).await;
        }
        self.finish_connect(Err(KaraboError::new(ErrorCode::OperationCanceled, "connection closed")));
    }
}

fn clone_result(result: &Result<()>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) => Err(KaraboError::new(e.code, e.message.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_connection_starts_unknown() {
        let conn = Connection::new(vec!["amqp://localhost:5672".to_string()]);
        assert_eq!(conn.state(), ConnectionState::Unknown);
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn connect_with_unreachable_urls_reports_connection_refused() {
        let conn = Connection::new(vec!["amqp://127.0.0.1:1".to_string()]);
        let result = conn.connect().await;
        assert!(result.is_err());
        assert_eq!(conn.state(), ConnectionState::ConnectionError);
    }

    struct CountingRevivable(AtomicUsize);

    impl Revivable for CountingRevivable {
        fn revive_if_reconnected(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// `register_for_reconnect_info` + `revive_registered` is the mechanism
    /// `RawClient::new` relies on to replay subscriptions after a reconnect
    /// (spec §4.1/§8): every still-live registrant gets called once, and a
    /// dropped one is silently pruned rather than upgraded.
    #[test]
    fn revive_registered_calls_live_registrants_and_prunes_dead_ones() {
        let conn = Connection::new(vec!["amqp://127.0.0.1:1".to_string()]);
        let alive = Arc::new(CountingRevivable(AtomicUsize::new(0)));
        conn.register_for_reconnect_info(Arc::downgrade(&alive) as Weak<dyn Revivable>);

        let dead = Arc::new(CountingRevivable(AtomicUsize::new(0)));
        conn.register_for_reconnect_info(Arc::downgrade(&dead) as Weak<dyn Revivable>);
        drop(dead);

        conn.revive_registered();
        assert_eq!(alive.0.load(Ordering::SeqCst), 1);
        assert_eq!(conn.inner.lock().registered.len(), 1);
    }
}
