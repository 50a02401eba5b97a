//! memcached-operator - mcrouter proxy fleets for memcached on Kubernetes

use std::time::Duration;

use clap::builder::TypedValueParser;
use clap::{Parser, Subcommand, ValueEnum};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use memcached_operator::controller::{self, ControllerConfig};
use memcached_operator::crd::MemcachedProxy;
use memcached_operator::retry::{retry_with_backoff, RetryConfig};
use memcached_operator::{CONTROLLER_NAME, DEFAULT_MAX_RETRIES, DEFAULT_WORKERS};

/// memcached-operator - CRD-driven mcrouter proxies for memcached
#[derive(Parser, Debug)]
#[command(name = "memcached-operator", version, about, long_about = None)]
struct Cli {
    /// Print the MemcachedProxy CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Log output format
    #[arg(
        long,
        value_enum,
        env = "MEMCACHED_OPERATOR_LOG_FORMAT",
        default_value = "text",
        global = true
    )]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    Controller(ControllerArgs),
}

/// Controller mode arguments
#[derive(Parser, Debug)]
struct ControllerArgs {
    /// Number of concurrent reconcile workers
    #[arg(
        long,
        env = "MEMCACHED_OPERATOR_WORKERS",
        default_value_t = DEFAULT_WORKERS,
        value_parser = clap::value_parser!(u64).range(1..).map(|v| v as usize)
    )]
    workers: usize,

    /// Only watch this namespace (all namespaces if unset)
    #[arg(long, env = "MEMCACHED_OPERATOR_NAMESPACE")]
    namespace: Option<String>,

    /// Retries for a failing proxy before giving up until its next change
    #[arg(long, env = "MEMCACHED_OPERATOR_MAX_RETRIES", default_value_t = DEFAULT_MAX_RETRIES)]
    max_retries: u32,

    /// Initial requeue delay for a failing proxy, in milliseconds
    #[arg(long, default_value_t = 500)]
    backoff_base_ms: u64,

    /// Upper bound on the requeue delay, in seconds
    #[arg(long, default_value_t = 300)]
    backoff_max_secs: u64,
}

impl Cli {
    /// Controller arguments, from the subcommand or, in default mode, from
    /// the environment and built-in defaults
    fn into_controller_args(self) -> Result<ControllerArgs, clap::Error> {
        match self.command {
            Some(Commands::Controller(args)) => Ok(args),
            None => ControllerArgs::try_parse_from(["controller"]),
        }
    }
}

impl ControllerArgs {
    fn into_config(self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers,
            max_retries: self.max_retries,
            backoff: RetryConfig {
                max_attempts: 0,
                initial_delay: Duration::from_millis(self.backoff_base_ms),
                max_delay: Duration::from_secs(self.backoff_max_secs),
                backoff_multiplier: 2.0,
            },
            namespace: self.namespace,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    if cli.crd {
        let crd = serde_yaml::to_string(&MemcachedProxy::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    let args = cli.into_controller_args().unwrap_or_else(|e| e.exit());
    run_controller(args).await
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,memcached_operator=debug,kube=info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Text => registry.with(fmt::layer()).init(),
    }
}

/// Install or update the MemcachedProxy CRD with server-side apply
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(CONTROLLER_NAME).force();
    let crd = MemcachedProxy::crd();
    let name = crd.metadata.name.clone().unwrap_or_default();

    tracing::info!(crd = %name, "Installing MemcachedProxy CRD...");
    let patch = Patch::Apply(&crd);
    retry_with_backoff(&RetryConfig::with_max_attempts(5), "install_crd", || {
        crds.patch(&name, &params, &patch)
    })
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install MemcachedProxy CRD: {}", e))?;

    Ok(())
}

/// Cancel the returned token on SIGINT or SIGTERM
fn shutdown_on_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "cannot listen for SIGTERM");
                    let _ = ctrl_c.await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        tracing::info!("shutdown signal received");
        trigger.cancel();
    });
    token
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    tracing::info!("memcached-operator starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crd_installed(&client).await?;

    let shutdown = shutdown_on_signal();
    controller::run(client, args.into_config(), shutdown).await;

    tracing::info!("memcached-operator stopped");
    Ok(())
}
