//! Convoy: runs local executables and Kubernetes pod forwards side by side.
//!
//! This is the entry point of the application. It parses command-line arguments,
//! loads configuration, builds the run selection and hands it to the supervisor
//! until the run fails or a shutdown signal arrives.

mod cluster;
mod config;
mod error;
mod frame;
mod memory;
mod merge;
mod message;
mod output;
mod pod;
mod process;
mod runnable;
mod runner;
mod structured;
mod style;
mod supervisor;
mod watch;

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use crate::cluster::{Kube, KubeSettings};
use crate::config::{load_config, Catalog, DEFAULT_CONFIG};
use crate::supervisor::{Selection, Supervisor};

/// Environment variable holding the diagnostics filter.
const LOG_ENV: &str = "CONVOY_LOG";

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "convoy",
    version,
    about = "Runs local executables and Kubernetes pod forwards with merged output",
    styles = help_styles(),
    color = clap::ColorChoice::Always,
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to convoy.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Print debug diagnostics to stderr.
    #[arg(long, global = true)]
    debug: bool,
    /// Disable colors and strip ANSI sequences from task output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Path to the kubeconfig used by pod forwards.
    #[arg(long, global = true)]
    kubeconfig: Option<PathBuf>,
    /// Kubernetes context used by pod forwards.
    #[arg(long, global = true)]
    context: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List configured executables, pods and flows.
    List,
    /// Run executables, pods and flows.
    Run(RunArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Executable or pod ids (or shortcuts).
    ids: Vec<String>,
    /// Executable to run.
    #[arg(long = "exec", value_name = "ID")]
    executables: Vec<String>,
    /// Pod to forward.
    #[arg(long = "pod", value_name = "ID")]
    pods: Vec<String>,
    /// Flow to run.
    #[arg(long = "flow", value_name = "ID")]
    flows: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let catalog = load_config(&path)?;
    debug!(config = %path.display(), "configuration loaded");

    match &cli.command {
        Commands::List => {
            print_catalog(&catalog);
            Ok(())
        }
        Commands::Run(args) => run(&cli, args, catalog).await,
    }
}

async fn run(cli: &Cli, args: &RunArgs, catalog: Catalog) -> Result<()> {
    let selection = build_selection(&catalog, args)?;
    if selection.is_empty() {
        bail!("nothing to run (pass ids, --exec, --pod or --flow)");
    }

    let kube = Kube::new(KubeSettings {
        kubeconfig: cli.kubeconfig.clone(),
        context: cli.context.clone(),
    });
    let color = use_color(cli.no_color, std::env::var_os("NO_COLOR"));
    let mut supervisor = Supervisor::new(
        Arc::new(catalog),
        Arc::new(kube),
        Box::new(std::io::stdout()),
        color,
    );

    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    let result = supervisor.run(&selection, cancel).await;
    let stopped = supervisor.stop().await;
    result.context("run failed")?;
    stopped.context("shutdown failed")?;
    Ok(())
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Builds the run selection. Bare ids resolve to an executable first, then a pod.
fn build_selection(catalog: &Catalog, args: &RunArgs) -> Result<Selection> {
    let mut selection = Selection::default();
    for id in &args.ids {
        if catalog.exec(id).is_none() && catalog.pod(id).is_some() {
            selection.add_pod(id.as_str());
        } else {
            selection.add_exec(id.as_str());
        }
    }
    for id in &args.executables {
        selection.add_exec(id.as_str());
    }
    for id in &args.pods {
        selection.add_pod(id.as_str());
    }
    for id in &args.flows {
        selection.add_flow(catalog, id)?;
    }
    Ok(selection)
}

fn use_color(no_color: bool, no_color_env: Option<OsString>) -> bool {
    !no_color && no_color_env.map_or(true, |value| value.is_empty())
}

fn print_catalog(catalog: &Catalog) {
    fn entry(id: &str, shortcut: Option<&str>, description: Option<&str>) -> String {
        let mut line = format!("  {}", id);
        if let Some(shortcut) = shortcut {
            line.push_str(&format!(" ({})", shortcut));
        }
        if let Some(description) = description {
            line.push_str(&format!(" - {}", description));
        }
        line
    }

    println!("executables:");
    for exec in catalog.executables() {
        println!(
            "{}",
            entry(&exec.id, exec.shortcut.as_deref(), exec.description.as_deref())
        );
    }
    println!("pods:");
    for pod in catalog.pods() {
        println!(
            "{}  [{}/{} {}:{}]",
            entry(&pod.id, pod.shortcut.as_deref(), pod.description.as_deref()),
            pod.namespace,
            pod.pattern,
            pod.local_port,
            pod.pod_port
        );
    }
    println!("flows:");
    for flow in catalog.flows() {
        println!(
            "{}  [{}]",
            entry(&flow.id, flow.shortcut.as_deref(), flow.description.as_deref()),
            flow.executables
                .iter()
                .chain(flow.pods.iter())
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
}

fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    warn!(error = %err, "can't listen for SIGTERM");
                    let _ = tokio::signal::ctrl_c().await;
                    cancel.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => debug!("received SIGINT"),
                _ = sigterm.recv() => debug!("received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        cancel.cancel();
    });
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}
