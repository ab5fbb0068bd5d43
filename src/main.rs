use anyhow::{Context, Result};
use clap::Parser;
use peersync::cli::Cli;
use peersync::config::{SourceKind, SyncConfig};
use peersync::netif::{resolve_local_peer, SystemResolver};
use peersync::shutdown::{self, Shutdown};
use peersync::source::{poll_slices, FileLister, KubeLister, MembershipFeed, SliceLister};
use peersync::{new_api_client, new_reconciler, Worker};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = cli.into_config().context("load configuration")?;
    let local = resolve_local_peer(&config.local, &SystemResolver).context("resolve local peer")?;

    info!(version = peersync::VERSION, "peersync starting");
    info!(
        api = %config.api.url,
        section = %config.peers.section_name,
        port = config.peers.port,
        policy = %config.peers.entry_failure_policy,
        local = %local,
        "configuration loaded"
    );

    let api = new_api_client(&config).context("create API client")?;
    let reconciler = new_reconciler(&config, local, api);
    let lister = build_lister(&config).context("create membership source")?;

    let (trigger, shutdown) = shutdown::channel();
    let signal = shutdown::termination_signal().context("install signal handlers")?;
    tokio::spawn(async move {
        let name = signal.await;
        info!(signal = name, "shutdown requested");
        trigger.trigger();
    });

    let (feed, events) = MembershipFeed::channel();
    let poll_interval = config.poll_interval();
    let source_shutdown: Shutdown = shutdown.clone();
    let source = tokio::spawn(async move {
        poll_slices(lister.as_ref(), feed, poll_interval, source_shutdown).await;
    });

    let mut worker = Worker::new(reconciler, config.worker_settings(), shutdown);
    let stats = worker.run(events).await;
    source.await.context("membership source task failed")?;

    info!(
        runs = stats.runs,
        committed = stats.committed,
        failed = stats.failed,
        retries = stats.retries,
        "peersync stopped"
    );
    Ok(())
}

fn build_lister(config: &SyncConfig) -> Result<Box<dyn SliceLister>> {
    let source = &config.source;
    match source.kind {
        SourceKind::File => {
            let path = source
                .path
                .clone()
                .context("file source requires a path")?;
            Ok(Box::new(FileLister::new(path)))
        }
        SourceKind::Kubernetes => {
            let lister = KubeLister::new(
                source.kube_api_server()?,
                source.namespace.clone().unwrap_or_default(),
                source.service.clone().unwrap_or_default(),
                Some(source.kube_token_path()),
                source.kube_ca_path(),
                config.request_timeout(),
            )?;
            Ok(Box::new(lister))
        }
    }
}
