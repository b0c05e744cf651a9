use clap::Parser;
use ldap_stack::server::{GenericRequestHandler, RequestHandler, SearchPagingHandler, StaticAuthorizer};
use ldap_stack::{run_metrics_server, tls, Config, LdapServer, Metrics, ServerContext};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use anyhow::Result;

#[derive(Parser)]
#[command(name = "ldap-stack-server")]
#[command(about = "LDAP v3 server - static accounts, Root DSE, StartTLS, paging and Who Am I")]
struct Args {
    /// Configuration file path (YAML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen URL (overrides config; e.g. ldap://:1389)
    #[arg(short = 'l', long, value_name = "URL")]
    listen: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("ldap_stack={},info", log_level))
        .init();

    info!("Starting LDAP server");

    let config = match &args.config {
        Some(path) => {
            info!("Configuration source: file {:?}", path);
            Config::from_file(path)?
        }
        None => {
            warn!("No --config given, using defaults");
            Config::default()
        }
    };
    let listen_url = args.listen.clone().unwrap_or_else(|| config.listen.url.clone());

    info!("Configuration loaded:");
    info!("  Listen URL: {}", listen_url);
    info!("  Accounts: {}", config.users.len());
    info!("  Anonymous binds: {}", config.server.allow_anonymous);
    info!("  Authentication required: {}", config.server.require_authentication);

    let metrics = Arc::new(Metrics::new());
    if let Some(addr) = config.metrics_listen.clone() {
        let metrics_for_http = Arc::clone(&metrics);
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(&addr, metrics_for_http).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let authorizer = StaticAuthorizer::new(&config.users);
    if authorizer.is_empty() {
        warn!("No accounts configured; only anonymous binds can succeed");
    }
    let handler: Arc<dyn RequestHandler> = Arc::new(GenericRequestHandler);
    let mut ctx = ServerContext::new(config.server.clone(), Arc::new(authorizer))
        .with_paging(Arc::new(SearchPagingHandler::new(Arc::clone(&handler))))
        .with_handler(handler)
        .with_metrics(metrics);

    let need_ldaps = listen_url.starts_with("ldaps://");
    match &config.tls {
        Some(tls_cfg) => {
            tls::validate_tls_files(&tls_cfg.cert_file, &tls_cfg.key_file, tls_cfg.ca_file.as_deref())?;
            ctx = ctx.with_tls(tls::acceptor_from_files(&tls_cfg.cert_file, &tls_cfg.key_file)?);
            info!("TLS enabled for listener ({})", if need_ldaps { "LDAPS" } else { "StartTLS" });
        }
        None if need_ldaps => {
            anyhow::bail!("LDAPS (ldaps://) requires a tls section with cert_file and key_file");
        }
        None => {}
    }

    let server = LdapServer::new(listen_url, ctx);
    server.start().await?;

    Ok(())
}
