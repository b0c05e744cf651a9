// Concrete byte streams: TCP, TLS (either side), and any AsyncRead + AsyncWrite

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use async_trait::async_trait;
use rustls_pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

use super::client_queue::Connector;
use super::ByteStream;
use crate::config::ClientOptions;
use crate::error::{LdapError, Result};

const READ_CHUNK: usize = 4096;
pub const LDAP_PORT: u16 = 389;
pub const LDAPS_PORT: u16 = 636;

/// What a StartTLS upgrade needs for each side of the connection.
#[derive(Clone)]
pub enum TlsUpgrade {
    Server(TlsAcceptor),
    Client {
        connector: TlsConnector,
        server_name: ServerName<'static>,
    },
}

async fn read_chunk<R>(reader: &mut R, block: bool, read_timeout: Option<Duration>) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin + Send,
{
    let mut buf = vec![0u8; READ_CHUNK];
    let n = if block {
        match read_timeout {
            Some(limit) => tokio::time::timeout(limit, reader.read(&mut buf))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timed out"))??,
            None => reader.read(&mut buf).await?,
        }
    } else {
        // A zero timeout still polls the read once.
        match tokio::time::timeout(Duration::ZERO, reader.read(&mut buf)).await {
            Ok(n) => n?,
            Err(_) => 0,
        }
    };
    buf.truncate(n);
    Ok(buf)
}

async fn write_all<W: AsyncWrite + Unpin + Send>(writer: &mut W, data: &[u8]) -> io::Result<()> {
    writer.write_all(data).await?;
    writer.flush().await
}

enum Inner {
    Tcp(TcpStream),
    ServerTls(Box<server::TlsStream<TcpStream>>),
    ClientTls(Box<client::TlsStream<TcpStream>>),
    /// Left behind by a failed TLS handshake.
    Closed,
}

impl AsyncRead for Inner {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Inner::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Inner::ServerTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Inner::ClientTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Inner::Closed => Poll::Ready(Ok(())),
        }
    }
}

impl AsyncWrite for Inner {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match &mut *self {
            Inner::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Inner::ServerTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            Inner::ClientTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            Inner::Closed => Poll::Ready(Err(io::ErrorKind::NotConnected.into())),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Inner::Tcp(s) => Pin::new(s).poll_flush(cx),
            Inner::ServerTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Inner::ClientTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Inner::Closed => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Inner::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Inner::ServerTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Inner::ClientTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Inner::Closed => Poll::Ready(Ok(())),
        }
    }
}

/// A network connection: plain TCP, or TLS from either end. Plain TCP can
/// be upgraded in place with StartTLS.
pub struct LdapStream {
    inner: Inner,
    read_timeout: Option<Duration>,
}

impl LdapStream {
    pub fn tcp(stream: TcpStream) -> Self {
        Self {
            inner: Inner::Tcp(stream),
            read_timeout: None,
        }
    }

    pub fn server_tls(stream: server::TlsStream<TcpStream>) -> Self {
        Self {
            inner: Inner::ServerTls(Box::new(stream)),
            read_timeout: None,
        }
    }

    pub fn client_tls(stream: client::TlsStream<TcpStream>) -> Self {
        Self {
            inner: Inner::ClientTls(Box::new(stream)),
            read_timeout: None,
        }
    }

    pub fn with_read_timeout(mut self, read_timeout: Option<Duration>) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match &self.inner {
            Inner::Tcp(s) => s.peer_addr().ok(),
            Inner::ServerTls(s) => s.get_ref().0.peer_addr().ok(),
            Inner::ClientTls(s) => s.get_ref().0.peer_addr().ok(),
            Inner::Closed => None,
        }
    }
}

#[async_trait]
impl ByteStream for LdapStream {
    async fn read(&mut self, block: bool) -> io::Result<Vec<u8>> {
        read_chunk(&mut self.inner, block, self.read_timeout).await
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        write_all(&mut self.inner, data).await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }

    fn is_secure(&self) -> bool {
        matches!(self.inner, Inner::ServerTls(_) | Inner::ClientTls(_))
    }

    async fn start_tls(&mut self, upgrade: &TlsUpgrade) -> Result<()> {
        let tcp = match std::mem::replace(&mut self.inner, Inner::Closed) {
            Inner::Tcp(tcp) => tcp,
            other => {
                self.inner = other;
                return Err(LdapError::Tls("connection is already secured".into()));
            }
        };
        self.inner = match upgrade {
            TlsUpgrade::Server(acceptor) => Inner::ServerTls(Box::new(
                acceptor
                    .accept(tcp)
                    .await
                    .map_err(|e| LdapError::Tls(format!("TLS handshake failed: {}", e)))?,
            )),
            TlsUpgrade::Client {
                connector,
                server_name,
            } => Inner::ClientTls(Box::new(
                connector
                    .connect(server_name.clone(), tcp)
                    .await
                    .map_err(|e| LdapError::Tls(format!("TLS handshake failed: {}", e)))?,
            )),
        };
        debug!("connection upgraded to TLS");
        Ok(())
    }
}

/// Any async byte pipe, e.g. `tokio::io::duplex` in tests.
pub struct IoStream<T> {
    io: T,
    read_timeout: Option<Duration>,
}

impl<T> IoStream<T> {
    pub fn new(io: T) -> Self {
        Self { io, read_timeout: None }
    }

    pub fn with_read_timeout(mut self, read_timeout: Option<Duration>) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn into_inner(self) -> T {
        self.io
    }
}

#[async_trait]
impl<T> ByteStream for IoStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read(&mut self, block: bool) -> io::Result<Vec<u8>> {
        read_chunk(&mut self.io, block, self.read_timeout).await
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        write_all(&mut self.io, data).await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.io.shutdown().await
    }
}

/// One entry of `ClientOptions::servers`, resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
    pub use_ssl: bool,
}

/// Accepts `ldap://host:port`, `ldaps://host`, `host:port`, `[::1]:389` or
/// a bare host. Missing ports come from the scheme or `default_port`.
pub fn parse_server(entry: &str, default_port: u16, default_ssl: bool) -> io::Result<ServerAddress> {
    let invalid = |what: &str| io::Error::new(io::ErrorKind::InvalidInput, format!("{}: {}", what, entry));
    let (rest, use_ssl, scheme_port) = if let Some(rest) = entry.strip_prefix("ldaps://") {
        (rest, true, Some(LDAPS_PORT))
    } else if let Some(rest) = entry.strip_prefix("ldap://") {
        (rest, false, Some(LDAP_PORT))
    } else if entry.contains("://") {
        return Err(invalid("unsupported URI scheme"));
    } else {
        (entry, default_ssl, None)
    };
    let rest = rest.trim_start_matches('/');
    let rest = rest.split('/').next().unwrap_or_default();

    let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
        let (host, after) = bracketed.split_once(']').ok_or_else(|| invalid("unterminated IPv6 address"))?;
        (host, after.strip_prefix(':'))
    } else {
        match rest.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (rest, None),
        }
    };
    if host.is_empty() {
        return Err(invalid("missing host"));
    }
    let port = match port {
        Some(p) => p.parse().map_err(|_| invalid("invalid port"))?,
        None => scheme_port.unwrap_or(default_port),
    };
    Ok(ServerAddress {
        host: host.to_string(),
        port,
        use_ssl,
    })
}

/// Connects to the first reachable server from `ClientOptions::servers`.
pub struct TcpConnector {
    servers: Vec<ServerAddress>,
    connect_timeout: Duration,
    read_timeout: Option<Duration>,
    tls: TlsConnector,
    last_host: Mutex<Option<String>>,
}

impl TcpConnector {
    pub fn new(options: &ClientOptions) -> Result<Self> {
        if options.servers.is_empty() {
            return Err(LdapError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no LDAP servers configured",
            )));
        }
        let servers = options
            .servers
            .iter()
            .map(|s| parse_server(s, options.port, options.use_ssl))
            .collect::<io::Result<Vec<_>>>()?;
        let config = crate::tls::client_config(options.ca_file.as_deref(), options.tls_skip_verify)
            .map_err(|e| LdapError::Tls(format!("{:#}", e)))?;
        Ok(Self {
            servers,
            connect_timeout: Duration::from_secs(options.timeout_connect_sec),
            read_timeout: options.timeout_read_sec.map(Duration::from_secs),
            tls: TlsConnector::from(config),
            last_host: Mutex::new(None),
        })
    }

    pub fn servers(&self) -> &[ServerAddress] {
        &self.servers
    }

    async fn connect_one(&self, server: &ServerAddress) -> Result<LdapStream> {
        let addr = (server.host.as_str(), server.port);
        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| LdapError::Timeout)??;
        tcp.set_nodelay(true)?;
        let stream = if server.use_ssl {
            let name = server_name(&server.host)?;
            let tls = self
                .tls
                .connect(name, tcp)
                .await
                .map_err(|e| LdapError::Tls(format!("TLS handshake with {} failed: {}", server.host, e)))?;
            LdapStream::client_tls(tls)
        } else {
            LdapStream::tcp(tcp)
        };
        Ok(stream.with_read_timeout(self.read_timeout))
    }
}

fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|_| LdapError::Tls(format!("invalid hostname for TLS SNI: {}", host)))
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn ByteStream>> {
        let mut last_error = None;
        for server in &self.servers {
            match self.connect_one(server).await {
                Ok(stream) => {
                    debug!("connected to {}:{}", server.host, server.port);
                    if let Ok(mut last) = self.last_host.lock() {
                        *last = Some(server.host.clone());
                    }
                    return Ok(Box::new(stream));
                }
                Err(e) => {
                    warn!("failed to connect to {}:{}: {}", server.host, server.port, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(LdapError::ConnectionClosed))
    }

    fn tls_upgrade(&self) -> Option<TlsUpgrade> {
        let host = self.last_host.lock().ok()?.clone()?;
        Some(TlsUpgrade::Client {
            connector: self.tls.clone(),
            server_name: server_name(&host).ok()?,
        })
    }
}

/// Connector for a fixed, already-open stream; further connects fail.
pub struct OnceConnector {
    stream: Mutex<Option<Box<dyn ByteStream>>>,
}

impl OnceConnector {
    pub fn new(stream: Box<dyn ByteStream>) -> Arc<Self> {
        Arc::new(Self {
            stream: Mutex::new(Some(stream)),
        })
    }
}

#[async_trait]
impl Connector for OnceConnector {
    async fn connect(&self) -> Result<Box<dyn ByteStream>> {
        self.stream
            .lock()
            .ok()
            .and_then(|mut s| s.take())
            .ok_or(LdapError::ConnectionClosed)
    }
}
