//! The Gridpack Machine service: reads its configuration from the
//! environment, wires the controller against the document store and the
//! submission host, starts the periodic tick and repository-refresh jobs,
//! and serves the REST API until SIGINT/SIGTERM.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use routerify::RouterService;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gridpack_machine::controller::Controller;
use gridpack_machine::database::{DocumentStore, MongoStore};
use gridpack_machine::http::routes::make_router;
use gridpack_machine::notifier::{Notifier, SmtpMailer};
use gridpack_machine::repository::TemplateRepository;
use gridpack_machine::scheduler::Scheduler;
use gridpack_machine::{MachineConf, Service};
use remote_executor::SshExecutor;

#[derive(Parser)]
#[command(about = "Gridpack production control plane")]
struct Args {
    /// Debug mode (verbose logging)
    #[arg(long)]
    debug: bool,
    /// Override the listening host from the environment
    #[arg(long)]
    host: Option<String>,
    /// Override the listening port from the environment
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut conf = MachineConf::from_env().context("loading configuration")?;
    conf.debug |= args.debug;
    if let Some(host) = args.host {
        conf.http_host = host;
    }
    if let Some(port) = args.port {
        conf.http_port = port;
    }

    let default_directives = if conf.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_directives)),
        )
        .init();

    let conf = Arc::new(conf);
    let store: Arc<dyn DocumentStore> =
        Arc::new(MongoStore::new(&conf).context("connecting to the document store")?);
    let repository = Arc::new(TemplateRepository::new(conf.clone()));
    let executor = Arc::new(
        SshExecutor::new(conf.submission_host.clone(), conf.ssh_credentials.clone())
            .with_cms_caf(conf.use_htcondor_cms_caf),
    );
    let mailer = Arc::new(SmtpMailer::new(&conf).context("setting up the SMTP transport")?);
    let notifier = Notifier::new(mailer, &conf);
    let controller = Arc::new(Controller::new(
        conf.clone(),
        store.clone(),
        repository.clone(),
        executor,
        notifier,
    ));

    info!(
        "tick every {}, repository refresh every {}",
        humantime::format_duration(conf.tick_interval),
        humantime::format_duration(conf.repository_update_interval),
    );
    let scheduler = Scheduler::new();
    {
        let controller = controller.clone();
        scheduler.add_job("controller_tick", conf.tick_interval, move || {
            let controller = controller.clone();
            async move { controller.tick().await }
        });
    }
    {
        let repository = repository.clone();
        scheduler.add_job(
            "repository_refresh",
            conf.repository_update_interval,
            move || {
                let repository = repository.clone();
                async move {
                    if let Err(e) = repository.refresh().await {
                        error!("error refreshing the template repository: {e:#}");
                    }
                }
            },
        );
    }

    let service = Arc::new(Service {
        conf: conf.clone(),
        controller,
        repository,
        store,
        scheduler,
    });

    let router = make_router(service.clone())
        .build()
        .map_err(|e| anyhow::anyhow!("building the router: {e}"))?;
    let router_service =
        RouterService::new(router).map_err(|e| anyhow::anyhow!("wrapping the router: {e}"))?;
    let address: SocketAddr = format!("{}:{}", conf.http_host, conf.http_port)
        .parse()
        .context("parsing the listen address")?;

    info!("will run on {address}");
    let server = hyper::Server::bind(&address).serve(router_service);
    let graceful = server.with_graceful_shutdown(shutdown_signal());
    graceful.await.context("serving the API")?;

    info!("shutting down the scheduler");
    service.scheduler.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing the SIGTERM handler cannot fail");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    info!("received a shutdown signal");
}
