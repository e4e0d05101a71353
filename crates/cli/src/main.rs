//! Katafygio: continuously mirror Kubernetes cluster objects as yaml files,
//! optionally versioned in a git repository.

mod config;
mod run;

use std::path::PathBuf;
use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

const APP_NAME: &str = "katafygio";

#[derive(Parser, Debug, Default)]
#[command(name = APP_NAME, version, about = "Backup Kubernetes cluster as yaml files")]
pub(crate) struct Cli {
    /// Configuration file (default: /etc/katafygio/katafygio.yaml)
    #[arg(short = 'c', long, env = "KF_CONFIG")]
    config: Option<PathBuf>,

    /// Kubernetes api-server url
    #[arg(short = 's', long, env = "KF_API_SERVER")]
    api_server: Option<String>,

    /// Kubeconfig context to use
    #[arg(short = 'q', long, env = "KF_CONTEXT")]
    context: Option<String>,

    /// Only dump objects from this namespace
    #[arg(short = 'a', long, env = "KF_NAMESPACE")]
    namespace: Option<String>,

    /// Kubernetes configuration path (default: $KUBECONFIG, else ~/.kube/config, else in-cluster)
    #[arg(short = 'k', long, env = "KF_KUBE_CONFIG")]
    kube_config: Option<PathBuf>,

    /// Dry-run mode: dump nothing, commit nothing
    #[arg(short = 'd', long, env = "KF_DRY_RUN")]
    dry_run: bool,

    /// Dump everything once, then exit when the initial sync completes
    #[arg(short = 'm', long, env = "KF_DUMP_ONLY")]
    dump_only: bool,

    /// Log level (default: info)
    #[arg(short = 'v', long, env = "KF_LOG_LEVEL",
          value_parser = ["debug", "info", "warning", "error", "fatal", "panic"])]
    log_level: Option<String>,

    /// Log output (default: stderr)
    #[arg(short = 'o', long, env = "KF_LOG_OUTPUT",
          value_parser = ["stdout", "stderr", "syslog", "test"])]
    log_output: Option<String>,

    /// Log server (if using syslog)
    #[arg(short = 'r', long, env = "KF_LOG_SERVER")]
    log_server: Option<String>,

    /// Local directory for the dump (default: ./kubernetes-backup)
    #[arg(short = 'e', long, env = "KF_LOCAL_DIR")]
    local_dir: Option<PathBuf>,

    /// Git repository URL to clone from and push to (default: local-only)
    #[arg(short = 'g', long, env = "KF_GIT_URL")]
    git_url: Option<String>,

    /// Per-git-command timeout in seconds (default: 300)
    #[arg(short = 't', long, env = "KF_GIT_TIMEOUT")]
    git_timeout: Option<u64>,

    /// Git commit author name (default: Katafygio)
    #[arg(short = 'b', long, env = "KF_GIT_AUTHOR")]
    git_author: Option<String>,

    /// Git commit author email (default: katafygio@localhost)
    #[arg(short = 'f', long, env = "KF_GIT_EMAIL")]
    git_email: Option<String>,

    /// Disable git versioning entirely
    #[arg(short = 'n', long, env = "KF_NO_GIT")]
    no_git: bool,

    /// Object kinds to ignore (repeatable or comma-separated)
    #[arg(short = 'x', long, env = "KF_EXCLUDE_KIND", value_delimiter = ',')]
    exclude_kind: Vec<String>,

    /// Objects to ignore, as <kind>:<namespace>/<name>
    #[arg(short = 'y', long, env = "KF_EXCLUDE_OBJECT", value_delimiter = ',')]
    exclude_object: Vec<String>,

    /// Label selector to filter watched objects
    #[arg(short = 'l', long, env = "KF_FILTER")]
    filter: Option<String>,

    /// Port answering http healthchecks on /health (0 disables, the default)
    #[arg(short = 'p', long, env = "KF_HEALTHCHECK_PORT")]
    healthcheck_port: Option<u16>,

    /// Full resync interval in seconds, 0 to disable (default: 900)
    #[arg(short = 'i', long, env = "KF_RESYNC_INTERVAL")]
    resync_interval: Option<u64>,

    /// Git commit-and-push interval in seconds (default: 10)
    #[arg(short = 'j', long, env = "KF_CHECK_INTERVAL")]
    check_interval: Option<u64>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the version number
    Version,
}

fn init_logging(settings: &config::Settings) {
    let directive = match settings.log_level.as_str() {
        "warning" => "warn",
        "fatal" | "panic" => "error",
        other => other,
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::from_str(directive)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        });
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    match settings.log_output.as_str() {
        "stdout" => builder.with_writer(std::io::stdout).init(),
        "test" => builder.with_writer(std::io::sink).init(),
        "syslog" => {
            builder.with_writer(std::io::stderr).init();
            warn!(server = ?settings.log_server, "syslog output is not supported; logging to stderr");
        }
        _ => builder.with_writer(std::io::stderr).init(),
    }
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KF_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KF_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let cli = Cli::parse();

    if let Some(Commands::Version) = &cli.command {
        println!("{} version {}", APP_NAME, env!("CARGO_PKG_VERSION"));
        return;
    }

    let settings = match config::Settings::load(cli) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    init_logging(&settings);
    init_metrics();
    info!(version = env!("CARGO_PKG_VERSION"), "starting katafygio");

    if let Err(e) = run::run(settings).await {
        tracing::error!(error = %format!("{:#}", e), "startup failed");
        eprintln!("{}: {:#}", APP_NAME, e);
        std::process::exit(1);
    }
}
