// OIC Linux daemon: hosts configured resources, runs their automation, and
// optionally discovers and caches remote resources.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use oic_core::{ConnectivityType, ResourceDescriptor};
use oic_linux::config::{self, Config};
use oic_linux::transport::udp::{UdpTransport, COAP_PORT};
use oic_linux::{AutomationEngine, ResourceClient, ResourceHost, TransportMultiplexer};
use tracing::{info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("oic-linux {}", VERSION);
                return Ok(());
            }
            "--config" | "-c" => {
                let path = args.next().context("--config needs a path")?;
                config_path = Some(PathBuf::from(path));
            }
            other => anyhow::bail!("unknown argument {other:?}"),
        }
    }

    let cfg = config::load(config_path.as_deref())?;
    init_tracing(&cfg.log_filter);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

fn init_tracing(fallback: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    info!(version = VERSION, coap_port = cfg.coap_port, "starting");

    // The host owns the CoAP port; the client talks from an ephemeral one.
    let (host_mux, host_events) = TransportMultiplexer::new();
    let udp = UdpTransport::bind(cfg.coap_port, cfg.coap_port, host_mux.frame_sink())
        .await
        .with_context(|| format!("binding udp port {}", cfg.coap_port))?;
    host_mux.register(udp, true);
    let host = ResourceHost::start(host_mux, host_events);

    let automation = AutomationEngine::new(cfg.automation_interval());
    for resource_cfg in &cfg.resources {
        let resource = host.add_resource(resource_cfg.to_definition()?)?;
        if let Some(mode) = resource_cfg.automation {
            automation.start_resource_automation(&resource, mode.into(), |id, status| {
                info!(id, ?status, "automation complete");
            })?;
        }
    }

    let client = match &cfg.discovery_query {
        Some(query) => Some(start_client(&cfg, query).await?),
        None => None,
    };

    shutdown_signal().await?;
    info!("shutting down");
    automation.stop_all();
    if let Some(client) = client {
        client.shutdown();
    }
    host.shutdown();
    Ok(())
}

async fn start_client(cfg: &Config, query: &str) -> anyhow::Result<Arc<ResourceClient>> {
    let (mux, events) = TransportMultiplexer::new();
    // Multicast goes to the group on the configured port even when it is not the default.
    let multicast_port = if cfg.coap_port == 0 { COAP_PORT } else { cfg.coap_port };
    let udp = UdpTransport::bind(0, multicast_port, mux.frame_sink())
        .await
        .context("binding client udp socket")?;
    mux.register(udp, true);
    let client = Arc::new(ResourceClient::start(cfg.client_config(), mux, events));

    let mut found = client.discover(query, ConnectivityType::IP)?;
    let watcher = client.clone();
    tokio::spawn(async move {
        while let Some(resource) = found.next().await {
            info!(uri = resource.uri(), host = resource.host(), "discovered");
            if resource.is_observable() {
                cache(&watcher, resource);
            }
        }
    });
    Ok(client)
}

fn cache(client: &ResourceClient, resource: ResourceDescriptor) {
    let key = resource.key();
    let state_key = key.clone();
    if let Err(e) = client.start_monitoring(&resource, move |state| {
        info!(resource = %state_key, %state, "state changed");
    }) {
        warn!(resource = %key, error = %e, "monitoring failed");
        return;
    }
    let cache_key = key.clone();
    if let Err(e) = client.start_caching(&resource, move |attributes| {
        info!(resource = %cache_key, ?attributes, "cache updated");
    }) {
        warn!(resource = %key, error = %e, "caching failed");
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
