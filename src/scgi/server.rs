//! Accept loop and per connection workers.
//!
//! The server accepts connections until it is closed (or interrupted),
//! runs one tokio task per connection and, once accepting has stopped,
//! waits for every running connection to finish before returning.

use std::io;
use std::marker::Unpin;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{watch, Notify};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::connection::Connection;
use super::error::Error;
use super::handler::Handler;
use super::request::read_request;
use super::response::{RESP_BAD_REQUEST, RESP_INTERNAL_ERROR, RESP_NOT_FOUND};
use super::settings::{ConfigError, Settings};

/// Source of accepted connections
#[async_trait]
pub trait Listener: Send
{
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn accept_stream(&mut self) -> io::Result<Self::Stream>;
}

#[async_trait]
impl Listener for TcpListener
{
    type Stream = TcpStream;

    async fn accept_stream(&mut self) -> io::Result<TcpStream>
    {
        let (stream, peer) = self.accept().await?;
        debug!(peer = %peer, "Connection accepted");
        Ok(stream)
    }
}

#[cfg(unix)]
#[async_trait]
impl Listener for UnixListener
{
    type Stream = UnixStream;

    async fn accept_stream(&mut self) -> io::Result<UnixStream>
    {
        let (stream, _) = self.accept().await?;
        debug!("Connection accepted");
        Ok(stream)
    }
}

/// Where to listen: `unix:<path>` for a local socket, otherwise a TCP
/// address such as `127.0.0.1:8080`. A bare `:8080` listens on all
/// interfaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr
{
    Tcp(String),
    Unix(PathBuf)
}

impl FromStr for ListenAddr
{
    type Err = Error;

    fn from_str(s: &str) -> Result<ListenAddr, Error>
    {
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(Error::Io(io::Error::new(io::ErrorKind::InvalidInput,
                                                    "empty socket path")));
            }
            Ok(ListenAddr::Unix(PathBuf::from(path)))
        } else if s.starts_with(':') {
            Ok(ListenAddr::Tcp(format!("0.0.0.0{}", s)))
        } else {
            Ok(ListenAddr::Tcp(s.to_string()))
        }
    }
}

#[derive(Clone)]
struct Route
{
    prefix: String,
    handler: Arc<dyn Handler>
}

/// First route whose prefix matches, in registration order
fn find_route<'a>(routes: &'a [Route], path: &str) -> Option<&'a Route>
{
    routes.iter().find(|r| path.starts_with(r.prefix.as_str()))
}

/// Number of running connection workers
struct ActiveConnections
{
    count: AtomicUsize,
    idle: Notify
}

impl ActiveConnections
{
    fn new() -> ActiveConnections
    {
        ActiveConnections{count: AtomicUsize::new(0), idle: Notify::new()}
    }

    fn get(&self) -> usize
    {
        self.count.load(Ordering::SeqCst)
    }

    async fn drained(&self)
    {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.get() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Counts one worker for as long as it lives
struct ActiveGuard(Arc<ActiveConnections>);

impl ActiveGuard
{
    fn new(active: &Arc<ActiveConnections>) -> ActiveGuard
    {
        active.count.fetch_add(1, Ordering::SeqCst);
        ActiveGuard(active.clone())
    }
}

impl Drop for ActiveGuard
{
    fn drop(&mut self)
    {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Signals a server to stop accepting connections
#[derive(Clone)]
pub struct CloseHandle
{
    tx: Arc<watch::Sender<bool>>
}

impl CloseHandle
{
    pub fn close(&self)
    {
        // The server keeps a receiver, so this can't fail
        let _ = self.tx.send(true);
    }
}

pub struct Server
{
    settings: Arc<Settings>,
    routes: Arc<Vec<Route>>,
    close_tx: Arc<watch::Sender<bool>>,
    close_rx: watch::Receiver<bool>,
    active: Arc<ActiveConnections>
}

impl Server
{
    /// Create a server without any handlers. Fails if a size limit or
    /// timeout in `settings` is zero.
    pub fn new(settings: Settings) -> Result<Server, ConfigError>
    {
        settings.validate()?;
        let (tx, rx) = watch::channel(false);
        Ok(Server{settings: Arc::new(settings),
                  routes: Arc::new(Vec::new()),
                  close_tx: Arc::new(tx),
                  close_rx: rx,
                  active: Arc::new(ActiveConnections::new())
        })
    }

    pub fn settings(&self) -> &Settings
    {
        &self.settings
    }

    /// Route requests whose path starts with `prefix` to `handler`.
    /// Routes are tried in the order they were added.
    pub fn add_handler<H>(&mut self, prefix: &str, handler: H)
        where H: Handler
    {
        Arc::make_mut(&mut self.routes).push(Route{
            prefix: prefix.to_string(),
            handler: Arc::new(handler)
        });
    }

    pub fn close_handle(&self) -> CloseHandle
    {
        CloseHandle{tx: self.close_tx.clone()}
    }

    pub fn close(&self)
    {
        self.close_handle().close();
    }

    pub fn active_connections(&self) -> usize
    {
        self.active.get()
    }

    /// Listen on `unix:<path>` or a TCP address until closed
    pub async fn listen(&self, address: &str) -> Result<(), Error>
    {
        match address.parse::<ListenAddr>()? {
            ListenAddr::Tcp(addr) => self.listen_tcp(&addr).await,
            #[cfg(unix)]
            ListenAddr::Unix(path) => self.listen_unix(&path).await,
            #[cfg(not(unix))]
            ListenAddr::Unix(_) => Err(Error::Io(io::Error::new(
                io::ErrorKind::Unsupported, "local sockets are not supported")))
        }
    }

    pub async fn listen_tcp(&self, addr: &str) -> Result<(), Error>
    {
        let listener = TcpListener::bind(addr).await?;
        info!(address = %listener.local_addr()?, "Listening on TCP");
        self.serve(listener).await
    }

    /// Listen on a Unix domain socket. The socket file is removed when
    /// serving ends.
    #[cfg(unix)]
    pub async fn listen_unix(&self, path: &Path) -> Result<(), Error>
    {
        let listener = UnixListener::bind(path)?;
        info!(path = %path.display(), "Listening on Unix socket");
        let res = self.serve(listener).await;
        if let Err(e) = std::fs::remove_file(path) {
            debug!(path = %path.display(), error = %e,
                   "Failed to remove socket file");
        }
        res
    }

    /// Run the accept loop on an already bound listener.
    ///
    /// Returns after a close or interrupt once every accepted
    /// connection has been handled.
    pub async fn serve<L>(&self, mut listener: L) -> Result<(), Error>
        where L: Listener
    {
        let mut close = self.close_rx.clone();
        let interrupt = interrupted(self.settings.catch_interrupt);
        tokio::pin!(interrupt);
        loop {
            if *close.borrow() {
                info!("Server closing");
                break;
            }
            let accepted = tokio::select! {
                _ = close.changed() => continue,
                _ = &mut interrupt => {
                    info!("Interrupted, terminating");
                    break;
                }
                res = timeout(self.settings.listen_accept_timeout,
                              listener.accept_stream()) => res
            };
            match accepted {
                Ok(Ok(stream)) => {
                    let guard = ActiveGuard::new(&self.active);
                    tokio::spawn(handle_connection(stream,
                                                   self.settings.clone(),
                                                   self.routes.clone(),
                                                   guard));
                },
                Ok(Err(e)) => debug!(error = %e, "Accept failed"),
                // deadline passed, check for close again
                Err(_) => {}
            }
        }
        drop(listener);
        let active = self.active_connections();
        if active > 0 {
            info!(active, "Waiting for connections to finish");
        }
        self.active.drained().await;
        info!("Server stopped");
        Ok(())
    }
}

async fn interrupted(enabled: bool)
{
    if enabled && tokio::signal::ctrl_c().await.is_ok() {
        return;
    }
    std::future::pending::<()>().await
}

async fn handle_connection<S>(stream: S, settings: Arc<Settings>,
                              routes: Arc<Vec<Route>>, _guard: ActiveGuard)
    where S: AsyncRead + AsyncWrite + Unpin + Send
{
    let mut conn = Connection::new(stream, &settings);
    let written = match read_request(&mut conn, &settings).await {
        Err(e) => {
            warn!(error = %e, "Failed to read request");
            conn.write_response(&RESP_BAD_REQUEST).await
        },
        Ok(req) => match find_route(&routes, req.path()) {
            None => {
                debug!(path = req.path(), "No handler");
                conn.write_response(&RESP_NOT_FOUND).await
            },
            Some(route) => match route.handler.handle(&req).await {
                Some(resp) => conn.write_response(&resp).await,
                None => {
                    warn!(path = req.path(), prefix = route.prefix.as_str(),
                          "Handler returned no response");
                    conn.write_response(&RESP_INTERNAL_ERROR).await
                }
            }
        }
    };
    if let Err(e) = written {
        warn!(error = %e, "Failed to write response");
    }
    if let Err(e) = conn.shutdown().await {
        debug!(error = %e, "Failed to close connection");
    }
}

#[cfg(test)]
use tokio::runtime::Runtime;
#[cfg(test)]
use tokio::io::{AsyncReadExt, AsyncWriteExt};
#[cfg(test)]
use std::time::Duration;
#[cfg(test)]
use super::defs;
#[cfg(test)]
use super::header::encode_header;
#[cfg(test)]
use super::request::Request;
#[cfg(test)]
use super::response::Response;

#[cfg(test)]
fn test_settings() -> Settings
{
    Settings{listen_accept_timeout: Duration::from_millis(200),
             read_timeout: Duration::from_secs(2),
             write_timeout: Duration::from_secs(2),
             catch_interrupt: false,
             ..Settings::new()}
}

#[cfg(test)]
fn get_request(uri: &str) -> Vec<u8>
{
    encode_header(&[("CONTENT_LENGTH", "0"),
                    ("REQUEST_METHOD", "GET"),
                    ("REQUEST_URI", uri)]).to_vec()
}

#[cfg(test)]
async fn exchange<S>(mut stream: S, input: &[u8]) -> Vec<u8>
    where S: AsyncRead + AsyncWrite + Unpin
{
    stream.write_all(input).await.unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    out
}

#[cfg(test)]
async fn start(server: Server)
               -> (Arc<Server>, std::net::SocketAddr,
                   tokio::task::JoinHandle<Result<(), Error>>)
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(server);
    let srv = server.clone();
    let task = tokio::spawn(async move { srv.serve(listener).await });
    (server, addr, task)
}

#[test]
fn test_end_to_end()
{
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let mut server = Server::new(test_settings()).unwrap();
        server.add_handler("/cgi/", |req: &Request| {
            assert_eq!(req.query["x"], vec!["1"]);
            Some(Response::ok(defs::RESP_TYPE_TEXT, "ok"))
        });
        let (server, addr, task) = start(server).await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let reply = exchange(stream, &get_request("/cgi/test?x=1")).await;
        assert_eq!(reply,
                   b"Status: 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nok".to_vec());

        server.close();
        task.await.unwrap().unwrap();
        assert_eq!(server.active_connections(), 0);
    });
}

#[test]
fn test_dispatch_first_match()
{
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let mut server = Server::new(test_settings()).unwrap();
        // "/a" is registered first, so it also takes "/ab/..."
        server.add_handler("/a", |_req: &Request| {
            Some(Response::ok(defs::RESP_TYPE_TEXT, "A"))
        });
        server.add_handler("/ab", |_req: &Request| {
            Some(Response::ok(defs::RESP_TYPE_TEXT, "AB"))
        });
        server.add_handler("/none", |_req: &Request| -> Option<Response> { None });
        let (server, addr, task) = start(server).await;

        let reply = exchange(TcpStream::connect(addr).await.unwrap(),
                             &get_request("/ab/x")).await;
        assert!(reply.ends_with(b"\r\n\r\nA"));

        let reply = exchange(TcpStream::connect(addr).await.unwrap(),
                             &get_request("/zzz")).await;
        assert_eq!(reply,
                   b"Status: 404 Not found\r\nContent-Type: text/plain\r\nContent-Length: 13\r\n\r\n404 Not found".to_vec());

        let reply = exchange(TcpStream::connect(addr).await.unwrap(),
                             &get_request("/none")).await;
        assert!(reply.starts_with(b"Status: 500 Internal error\r\n"));

        let reply = exchange(TcpStream::connect(addr).await.unwrap(),
                             b"xyz:").await;
        assert!(reply.starts_with(b"Status: 400 Bad request\r\n"));

        server.close();
        task.await.unwrap().unwrap();
    });
}

#[test]
fn test_silent_client_gets_bad_request()
{
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let settings = Settings{read_timeout: Duration::from_millis(100),
                                ..test_settings()};
        let (server, addr, task) = start(Server::new(settings).unwrap()).await;
        let reply = exchange(TcpStream::connect(addr).await.unwrap(), b"").await;
        assert!(reply.starts_with(b"Status: 400 Bad request\r\n"));
        server.close();
        task.await.unwrap().unwrap();
    });
}

#[cfg(test)]
struct SlowHandler
{
    delay: Duration,
    finished: Arc<AtomicUsize>
}

#[cfg(test)]
#[async_trait]
impl Handler for SlowHandler
{
    async fn handle(&self, _req: &Request) -> Option<Response>
    {
        tokio::time::sleep(self.delay).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Some(Response::ok(defs::RESP_TYPE_TEXT, "slow"))
    }
}

#[test]
fn test_shutdown_drains_connections()
{
    const CLIENTS: usize = 3;
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let finished = Arc::new(AtomicUsize::new(0));
        let mut server = Server::new(test_settings()).unwrap();
        server.add_handler("/", SlowHandler{delay: Duration::from_millis(400),
                                            finished: finished.clone()});
        let (server, addr, task) = start(server).await;

        let mut clients = Vec::new();
        for _ in 0..CLIENTS {
            clients.push(tokio::spawn(async move {
                let stream = TcpStream::connect(addr).await.unwrap();
                exchange(stream, &get_request("/slow")).await
            }));
        }
        // wait until every request is inside the handler
        while server.active_connections() < CLIENTS {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        server.close();
        task.await.unwrap().unwrap();
        // serve only returns once all handlers have completed
        assert_eq!(finished.load(Ordering::SeqCst), CLIENTS);
        assert_eq!(server.active_connections(), 0);
        for client in clients {
            let reply = client.await.unwrap();
            assert!(reply.ends_with(b"\r\n\r\nslow"));
        }
    });
}

#[test]
fn test_close_is_prompt()
{
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let settings = Settings{listen_accept_timeout: Duration::from_secs(1),
                                ..test_settings()};
        let (server, _addr, task) = start(Server::new(settings).unwrap()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let handle = server.close_handle();
        handle.close();
        timeout(Duration::from_secs(1), task).await
            .expect("server did not stop within one accept timeout")
            .unwrap().unwrap();
    });
}

#[test]
fn test_closed_before_serving()
{
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let server = Server::new(test_settings()).unwrap();
        server.close();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        timeout(Duration::from_secs(1), server.serve(listener)).await
            .unwrap().unwrap();
    });
}

#[test]
fn test_listen_addr()
{
    assert_eq!("unix:/tmp/scgi.sock".parse::<ListenAddr>().unwrap(),
               ListenAddr::Unix(PathBuf::from("/tmp/scgi.sock")));
    assert_eq!("127.0.0.1:8080".parse::<ListenAddr>().unwrap(),
               ListenAddr::Tcp("127.0.0.1:8080".to_string()));
    assert!("unix:".parse::<ListenAddr>().is_err());
    assert_eq!(":8080".parse::<ListenAddr>().unwrap(),
               ListenAddr::Tcp("0.0.0.0:8080".to_string()));
}

#[test]
fn test_listen_port_only()
{
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let server = Arc::new(Server::new(test_settings()).unwrap());
        let srv = server.clone();
        let task = tokio::spawn(async move { srv.listen(":0").await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.close();
        timeout(Duration::from_secs(1), task).await
            .unwrap().unwrap().unwrap();
    });
}

#[test]
fn test_zero_settings_rejected()
{
    let settings = Settings{max_header_size: 0, ..test_settings()};
    assert!(matches!(Server::new(settings),
                     Err(ConfigError::Invalid("max_header_size"))));
    let settings = Settings{listen_accept_timeout: Duration::from_millis(0),
                            ..test_settings()};
    assert!(matches!(Server::new(settings),
                     Err(ConfigError::Invalid("listen_accept_timeout_ms"))));
}

#[cfg(unix)]
#[test]
fn test_unix_socket()
{
    let rt = Runtime::new().unwrap();
    rt.block_on(async {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scgi.sock");
        let mut server = Server::new(test_settings()).unwrap();
        server.add_handler("/", |req: &Request| {
            Some(Response::ok(defs::RESP_TYPE_TEXT, req.path().to_string()))
        });
        let server = Arc::new(server);
        let srv = server.clone();
        let address = format!("unix:{}", path.display());
        let task = tokio::spawn(async move { srv.listen(&address).await });

        while !path.exists() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let stream = UnixStream::connect(&path).await.unwrap();
        let reply = exchange(stream, &get_request("/local")).await;
        assert!(reply.ends_with(b"\r\n\r\n/local"));

        server.close();
        task.await.unwrap().unwrap();
        assert!(!path.exists());
    });
}
