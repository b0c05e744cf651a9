//! LDAP server: accept loop, shared context and per-connection dispatch.

pub mod bind;
pub mod handler;
pub mod history;
pub mod paging;
pub mod protocol_handler;
pub mod token;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

use crate::config::ServerOptions;
use crate::metrics::Metrics;
use crate::protocol::OperationRegistry;
use crate::transport::{ByteStream, LdapStream};

pub use bind::{AnonymousBind, Bind, SaslPlainBind, SimpleBind};
pub use handler::{
    Authorizer, GenericRequestHandler, HandlerResult, PagingHandler, RequestHandler, RootDseHandler,
    SearchPagingHandler, StaticAuthorizer,
};
pub use history::RequestHistory;
pub use paging::{PagingRequest, PagingRequests, PagingResponse};
pub use protocol_handler::ServerProtocolHandler;
pub use token::{RequestContext, Token};

/// Everything a connection needs, shared by all connections of a server.
pub struct ServerContext {
    pub options: ServerOptions,
    pub handler: Arc<dyn RequestHandler>,
    pub paging: Option<Arc<dyn PagingHandler>>,
    pub root_dse: Option<Arc<dyn RootDseHandler>>,
    /// Tried in order; the first one supporting a bind request handles it.
    pub binds: Vec<Box<dyn Bind>>,
    /// Used for ldaps:// listeners and StartTLS.
    pub tls: Option<TlsAcceptor>,
    pub registry: Arc<OperationRegistry>,
    pub metrics: Arc<Metrics>,
}

impl ServerContext {
    /// Anonymous, simple and SASL PLAIN binds against `authorizer`; every
    /// directory operation is refused until a handler is set.
    pub fn new(options: ServerOptions, authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            options,
            handler: Arc::new(GenericRequestHandler),
            paging: None,
            root_dse: None,
            binds: vec![
                Box::new(AnonymousBind),
                Box::new(SimpleBind::new(Arc::clone(&authorizer))),
                Box::new(SaslPlainBind::new(authorizer)),
            ],
            tls: None,
            registry: Arc::new(OperationRegistry::new()),
            metrics: Arc::new(Metrics::default()),
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn with_paging(mut self, paging: Arc<dyn PagingHandler>) -> Self {
        self.paging = Some(paging);
        self
    }

    pub fn with_root_dse(mut self, root_dse: Arc<dyn RootDseHandler>) -> Self {
        self.root_dse = Some(root_dse);
        self
    }

    pub fn with_binds(mut self, binds: Vec<Box<dyn Bind>>) -> Self {
        self.binds = binds;
        self
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls = Some(acceptor);
        self
    }

    pub fn with_registry(mut self, registry: Arc<OperationRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }
}

/// Serve one already-established connection until it ends.
pub async fn serve_stream(ctx: Arc<ServerContext>, stream: Box<dyn ByteStream>, peer: impl Into<String>) {
    ServerProtocolHandler::new(ctx, stream, peer).run().await
}

pub struct LdapServer {
    listen_url: String,
    ctx: Arc<ServerContext>,
}

impl LdapServer {
    pub fn new(listen_url: impl Into<String>, ctx: ServerContext) -> Self {
        Self {
            listen_url: listen_url.into(),
            ctx: Arc::new(ctx),
        }
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    pub async fn start(&self) -> Result<()> {
        let (addr, ldaps) = parse_listen_url(&self.listen_url)?;
        if ldaps && self.ctx.tls.is_none() {
            anyhow::bail!("{} needs a TLS certificate and key", self.listen_url);
        }

        info!("Starting LDAP server on {}", addr);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;
        info!(
            "LDAP server listening on {} ({})",
            addr,
            if ldaps { "ldaps" } else { "ldap" }
        );
        self.ctx.metrics.set_ready(true);

        let read_timeout = self.ctx.options.read_timeout_sec.map(Duration::from_secs);
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("New connection from {}", peer_addr);
                    let ctx = Arc::clone(&self.ctx);
                    let acceptor = if ldaps { ctx.tls.clone() } else { None };

                    tokio::spawn(async move {
                        let stream = match acceptor {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(tls_stream) => LdapStream::server_tls(tls_stream),
                                Err(e) => {
                                    error!("TLS handshake failed for {}: {}", peer_addr, e);
                                    return;
                                }
                            },
                            None => LdapStream::tcp(stream),
                        };
                        let stream = stream.with_read_timeout(read_timeout);
                        serve_stream(ctx, Box::new(stream), peer_addr.to_string()).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

/// `ldap://host:port` or `ldaps://host:port`; `ldap://:port` binds every
/// interface. The flag is true for ldaps.
pub fn parse_listen_url(url: &str) -> Result<(SocketAddr, bool)> {
    let (rest, ldaps) = if let Some(rest) = url.strip_prefix("ldaps://") {
        (rest, true)
    } else if let Some(rest) = url.strip_prefix("ldap://") {
        (rest, false)
    } else {
        anyhow::bail!("Invalid URL scheme, expected ldap:// or ldaps://");
    };

    let rest = rest.trim_start_matches('/');
    let addr = if let Some(port) = rest.strip_prefix(':') {
        let port: u16 = port.parse().context("Invalid port number")?;
        SocketAddr::from(([0, 0, 0, 0], port))
    } else {
        rest.parse()
            .with_context(|| format!("Failed to parse address: {}", rest))?
    };
    Ok((addr, ldaps))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listen_url_ldap() {
        let (addr, ldaps) = parse_listen_url("ldap://127.0.0.1:1389").unwrap();
        assert_eq!(addr.port(), 1389);
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        assert!(!ldaps);
    }

    #[test]
    fn test_parse_listen_url_ldaps() {
        let (addr, ldaps) = parse_listen_url("ldaps://0.0.0.0:636").unwrap();
        assert_eq!(addr.port(), 636);
        assert_eq!(addr.ip().to_string(), "0.0.0.0");
        assert!(ldaps);
    }

    #[test]
    fn test_parse_listen_url_port_only() {
        let (addr, _) = parse_listen_url("ldap://:1389").unwrap();
        assert_eq!(addr.port(), 1389);
        assert_eq!(addr.ip().to_string(), "0.0.0.0");
    }

    #[test]
    fn test_parse_listen_url_with_slashes() {
        let (addr, _) = parse_listen_url("ldap:///127.0.0.1:1389").unwrap();
        assert_eq!(addr.port(), 1389);
    }

    #[test]
    fn test_parse_listen_url_invalid() {
        assert!(parse_listen_url("http://127.0.0.1:1389").is_err());
        assert!(parse_listen_url("ldap://:99999").is_err());
        assert!(parse_listen_url("ldap://:abc").is_err());
        assert!(parse_listen_url("ldap://invalid:address").is_err());
    }

    #[tokio::test]
    async fn test_ldaps_without_certificate_fails() {
        let ctx = ServerContext::new(ServerOptions::default(), Arc::new(StaticAuthorizer::default()));
        let server = LdapServer::new("ldaps://127.0.0.1:0", ctx);
        assert!(server.start().await.is_err());
        assert!(!server.context().metrics.is_ready());
    }
}
