//! PendingDNS entry point
//!
//! Starts the roles enabled in configuration (DNS responder, health
//! checker, public front end) as tasks of one process. A supervisor runs
//! one process per role in production and restarts on non-zero exit; the
//! exit codes here are part of that contract.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::net::{IpAddr, SocketAddr};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::task::JoinSet;
use tracing::{error, info};

use pendingdns_common::errors::exit_codes;
use pendingdns_common::observability::init_tracing;
use pendingdns_config::Config;
use pendingdns_server::acme::CertManager;
use pendingdns_server::dns::{run_tcp, run_udp, DnsHandler};
use pendingdns_server::health::HealthChecker;
use pendingdns_server::public::{run_http, run_https, PublicContext, TlsGateway};
use pendingdns_store::tickets::TicketStore;
use pendingdns_store::{CachedResolver, KeyStore, ResolveOpts, ZoneStore};

/// PendingDNS - API-driven authoritative DNS with on-demand TLS
#[derive(Parser, Debug)]
#[command(name = "pendingdns")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "PENDINGDNS_CONFIG")]
    config: Option<String>,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate configuration and exit
    Test {
        #[arg(short = 'c', long = "config")]
        config: Option<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.verbose && std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "debug");
    }

    match cli.command {
        Some(Commands::Test { config }) => {
            return test_config(config.as_deref().or(cli.config.as_deref()));
        }
        None => {}
    }

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => Arc::new(config),
        Err(code) => return code,
    };

    if let Err(e) = init_tracing() {
        eprintln!("failed to initialize tracing: {}", e);
        return ExitCode::from(exit_codes::STARTUP_FAILURE as u8);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to build runtime");
            return ExitCode::from(exit_codes::STARTUP_FAILURE as u8);
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "worker failed");
            ExitCode::from(exit_codes::UNCAUGHT as u8)
        }
    }
}

fn test_config(path: Option<&str>) -> ExitCode {
    match load_config(path) {
        Ok(_) => {
            println!("configuration ok");
            ExitCode::SUCCESS
        }
        Err(code) => code,
    }
}

fn load_config(path: Option<&str>) -> Result<Config, ExitCode> {
    let result = match path {
        Some(path) => Config::from_file(path),
        None => {
            let config = Config::default();
            config.validate().map(|_| config)
        }
    };
    result.map_err(|e| {
        eprintln!("configuration error: {}", e);
        ExitCode::from(e.exit_code() as u8)
    })
}

async fn run(config: Arc<Config>) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "starting PendingDNS");

    let ks = KeyStore::connect(&config.store.url, config.store.read_url.as_deref())
        .await
        .context("connecting to key store")?;
    let zone = ZoneStore::new(ks.clone());

    let upstreams: Vec<IpAddr> = config
        .resolver
        .ns
        .iter()
        .filter_map(|ip| ip.parse().ok())
        .collect();
    let external = Arc::new(CachedResolver::new(
        ks.clone(),
        &upstreams,
        ResolveOpts::default(),
    ));

    let records = Arc::new(zone.clone());
    let handler = Arc::new(DnsHandler::new(
        records.clone(),
        external.clone(),
        config.clone(),
    ));

    let certs = CertManager::new(zone.clone(), external.clone(), &config);
    certs.spawn_renewal_sweep();

    let mut tasks = JoinSet::new();

    let dns_addr = listen_addr(&config.dns.host, config.dns.port)?;
    {
        let handler = handler.clone();
        tasks.spawn(async move { run_udp(handler, dns_addr).await });
    }
    {
        let handler = handler.clone();
        tasks.spawn(async move { run_tcp(handler, dns_addr).await });
    }

    if config.health.enabled {
        let checker = Arc::new(HealthChecker::new(zone.clone(), config.health.clone()));
        checker.spawn();
        info!(handlers = config.health.handlers, "health checker started");
    }

    let public_ctx = PublicContext::new(records.clone(), config.clone());
    let http_addr = listen_addr(&config.public.http.host, config.public.http.port)?;
    {
        let ctx = public_ctx.clone();
        tasks.spawn(async move { run_http(ctx, http_addr).await });
    }

    let tickets = Arc::new(
        TicketStore::new(&config.store.url).context("connecting session ticket store")?,
    );
    let gateway = Arc::new(
        TlsGateway::new(records, certs, tickets, &config.public.https)
            .context("building TLS gateway")?,
    );
    let https_addr = listen_addr(&config.public.https.host, config.public.https.port)?;
    {
        let ctx = public_ctx.clone();
        tasks.spawn(async move { run_https(ctx, gateway, https_addr).await });
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(())
        }
        joined = tasks.join_next() => {
            match joined {
                Some(Ok(Ok(()))) => anyhow::bail!("listener exited unexpectedly"),
                Some(Ok(Err(e))) => Err(e).context("listener failed"),
                Some(Err(e)) => Err(e).context("listener panicked"),
                None => Ok(()),
            }
        }
    }
}

fn listen_addr(host: &str, port: u16) -> Result<SocketAddr> {
    let ip: IpAddr = host
        .parse()
        .with_context(|| format!("unparseable listen address {:?}", host))?;
    Ok(SocketAddr::new(ip, port))
}
