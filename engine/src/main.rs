use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use cmdgate_channels::{build_channel, supervise, ChannelConfig};
use cmdgate_cloud::{ConohaClient, RebootType};
use cmdgate_core::config::DEFAULT_CONFIG_PATH;
use cmdgate_core::help::{plain_operator, PRODUCT_NAME, VERSION};
use cmdgate_core::{GatewayConfig, RootCommand};
use cmdgate_observability::{
    emit_event, init_process_logging, redact_text, ObservabilityEvent, ProcessKind,
    DEFAULT_RETENTION_DAYS,
};
use cmdgate_server::LogServerState;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "cmdgate")]
#[command(about = "Run configured commands from chat messages")]
struct Cli {
    /// Path of the YAML configuration file.
    #[arg(long, global = true, env = "CMDGATE_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Directory for the process's own JSON-lines logs.
    #[arg(long, global = true, env = "CMDGATE_LOG_DIR", default_value = "./logs/process")]
    log_dir: PathBuf,
    #[arg(long, global = true, default_value_t = DEFAULT_RETENTION_DAYS)]
    log_retention_days: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to the configured chat and serve commands.
    Serve,
    /// Compile the configuration and print the command tree.
    Check,
    /// ConoHa server manipulation.
    Server {
        #[command(subcommand)]
        action: ServerAction,
    },
    Version,
}

#[derive(Subcommand, Debug)]
enum ServerAction {
    /// Reboot a server.
    Restart {
        server_id: String,
        /// SOFT or HARD.
        reboot_type: RebootType,
    },
    /// List servers and the hosts they run on.
    Hosts,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let process = match cli.command {
        Command::Version => {
            println!("{PRODUCT_NAME} v{VERSION}");
            return Ok(());
        }
        Command::Serve => ProcessKind::Gateway,
        Command::Check | Command::Server { .. } => ProcessKind::Cli,
    };
    let (_log_guard, log_info) =
        init_process_logging(process, &cli.log_dir, cli.log_retention_days)?;
    info!("{PRODUCT_NAME} logging initialized: {:?}", log_info);

    let config = GatewayConfig::load(&cli.config)?;
    match cli.command {
        Command::Serve => serve(config).await,
        Command::Check => check(&config),
        Command::Server { action } => server(&config, action).await,
        Command::Version => Ok(()),
    }
}

async fn serve(config: GatewayConfig) -> anyhow::Result<()> {
    log_config(&config);
    let root = Arc::new(RootCommand::compile(&config).context("compiling commands")?);
    let channel = build_channel(ChannelConfig::from_gateway(&config)?).await?;
    emit_event(
        tracing::Level::INFO,
        ProcessKind::Gateway,
        ObservabilityEvent {
            event: "gateway.started",
            component: "cmdgate.main",
            status: Some("ok"),
            detail: Some(&format!(
                "mode={} commands={}",
                config.mode.as_str(),
                root.command_names().count()
            )),
            ..Default::default()
        },
    );

    let cancel = CancellationToken::new();
    let log_server = match (root.logs(), config.logs.as_ref()) {
        (Some(logs), Some(logs_config)) => {
            let addr: SocketAddr = logs_config
                .listen
                .parse()
                .with_context(|| format!("invalid logs.listen `{}`", logs_config.listen))?;
            let state = LogServerState::from_logs(logs);
            let cancel = cancel.clone();
            Some(tokio::spawn(async move {
                if let Err(err) = cmdgate_server::serve(addr, state, cancel).await {
                    error!("log endpoint stopped: {err:#}");
                }
            }))
        }
        _ => None,
    };

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down");
            shutdown.cancel();
        }
    });

    supervise(channel, root, cancel.clone()).await;
    cancel.cancel();
    if let Some(handle) = log_server {
        let _ = handle.await;
    }
    Ok(())
}

fn check(config: &GatewayConfig) -> anyhow::Result<()> {
    let root = RootCommand::compile(config).context("compiling commands")?;
    println!("{}", command_tree(&root).join("\n"));
    Ok(())
}

fn command_tree(root: &RootCommand) -> Vec<String> {
    root.help_lines(&plain_operator, true)
}

async fn server(config: &GatewayConfig, action: ServerAction) -> anyhow::Result<()> {
    let client = ConohaClient::new(&config.servers.conoha)?;
    match action {
        ServerAction::Restart {
            server_id,
            reboot_type,
        } => {
            client.reboot(&server_id, reboot_type).await?;
            println!("{reboot_type} restart of {server_id} accepted");
        }
        ServerAction::Hosts => {
            for host in client.hosts().await? {
                println!("{}: {}", host.name, host.host);
            }
        }
    }
    Ok(())
}

fn log_config(config: &GatewayConfig) {
    info!(
        mode = config.mode.as_str(),
        prefix = %config.prefix,
        traq_token = %redact_text(&config.traq.token),
        slack_oauth_token = %redact_text(&config.slack.oauth_token),
        slack_app_token = %redact_text(&config.slack.app_token),
        work_dir = %display_opt(config.work_dir.as_deref()),
        "loaded configuration"
    );
}

fn display_opt(path: Option<&Path>) -> String {
    path.map(|p| p.display().to_string())
        .unwrap_or_else(|| "<cwd>".to_string())
}
