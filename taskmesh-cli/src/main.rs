use anyhow::Result;
use clap::{Parser, Subcommand};
use taskmesh_core::config::Config;
use taskmesh_core::core_model::{GroupId, Task, TaskTree};
use taskmesh_core::core_signal::RelayServer;
use taskmesh_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use taskmesh_core::{SyncEngine, SyncStrategy};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "taskmesh")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Set the log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    /// Read configuration from a TOML file instead of the environment
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a synchronizing device
    Run {
        /// Peer strategy: proximity or rendezvous
        #[arg(long, default_value = "rendezvous")]
        strategy: String,

        /// Create a new group and print its id
        #[arg(long, conflicts_with = "join")]
        create_group: bool,

        /// Join an existing group by id
        #[arg(long)]
        join: Option<String>,

        /// Device display name
        #[arg(long, default_value = "taskmesh-device")]
        name: String,

        /// Seed the local list with these task titles
        #[arg(long = "task")]
        tasks: Vec<String>,
    },
    /// Run a rendezvous relay service
    Relay {
        /// Listen address
        #[arg(long, default_value = "127.0.0.1:8080")]
        listen: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = LogLevel::from_str(&args.log_level).unwrap_or_else(|| {
        eprintln!("Invalid log level '{}', using 'info'", args.log_level);
        LogLevel::Info
    });
    init_logging_with_config(LogConfig::new(log_level).json_format(args.json_logs))?;

    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    match args.command {
        Command::Run {
            strategy,
            create_group,
            join,
            name,
            tasks,
        } => run_device(config, &strategy, create_group, join, &name, tasks).await,
        Command::Relay { listen } => run_relay(&listen).await,
    }
}

async fn run_device(
    config: Config,
    strategy: &str,
    create_group: bool,
    join: Option<String>,
    name: &str,
    tasks: Vec<String>,
) -> Result<()> {
    let strategy = match strategy {
        "proximity" => SyncStrategy::Proximity,
        "rendezvous" => SyncStrategy::Rendezvous,
        other => anyhow::bail!("unknown strategy: {}", other),
    };

    let mut tree = TaskTree::new();
    for title in tasks {
        tree.add_task(Task::new(title, ""));
    }

    let handle = SyncEngine::start(config, strategy, name, tree.clone()).await?;
    info!(peer_id = %handle.local_peer_id(), "Device running");

    if create_group {
        let group = handle.create_group().await?;
        // The id goes to stdout so it can be passed to other devices.
        println!("{}", group);
        info!(group = %group, "Group created, waiting for peers");
    } else if let Some(group) = join {
        handle.join_group(GroupId::from(group)).await?;
    }

    if !tree.is_empty() {
        handle.notify_local_mutation(tree).await?;
    }

    let mut snapshots = handle.remote_snapshots().await?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            Some(tree) = snapshots.recv() => {
                info!(tasks = tree.tasks.len(), "Replica updated from a peer");
                for task in &tree.tasks {
                    let mark = if task.completed { "x" } else { " " };
                    println!("[{}] {}", mark, task.title);
                }
            }
        }
    }

    handle.shutdown().await?;
    Ok(())
}

async fn run_relay(listen: &str) -> Result<()> {
    let server = RelayServer::bind(listen).await?;
    info!(addr = %server.local_addr(), "Relay running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    server.shutdown();
    Ok(())
}
