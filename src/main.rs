//! Corral - a small Linux container runtime
//!
//! This is the main CLI entry point for Corral.

use anyhow::Context;
use clap::{Parser, Subcommand};
use corral::container::{format_bytes, ContainerInfo, CreateRequest};
use corral::network::PortMap;
use corral::runtime::ResourceLimits;
use corral::{ContainerManager, CorralError, RuntimeConfig};
use regex::Regex;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Exit code reported when a signal arrived during a lifecycle call
const INTERRUPTED_EXIT: i32 = 130;

/// Corral - run commands in isolated Linux containers
#[derive(Parser)]
#[command(name = "corral")]
#[command(version)]
#[command(about = "A small Linux container runtime", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Runtime root directory
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a container
    Create {
        /// Container name, also used as its hostname
        #[arg(long)]
        name: String,
        /// Image whose layers live under <root>/layers
        #[arg(long)]
        image: String,
        /// Command to run, split with shell quoting rules
        #[arg(long, default_value = "/bin/sh")]
        command: String,
        /// Memory limit (512, 512m, 2g); plain numbers are MiB
        #[arg(long)]
        memory: Option<String>,
        /// CPU limit as a fraction of cores (0.5, 2)
        #[arg(long)]
        cpus: Option<f64>,
        /// Maximum number of processes
        #[arg(long)]
        pids: Option<u64>,
        /// Port maps, HOST:CONTAINER[/PROTO] separated by commas
        #[arg(long)]
        ports: Option<String>,
    },

    /// Start a container
    Start {
        /// Container ID
        #[arg(long)]
        id: String,
    },

    /// Stop a container
    Stop {
        /// Container ID
        #[arg(long)]
        id: String,
    },

    /// Remove a container
    Remove {
        /// Container ID
        #[arg(long)]
        id: String,
    },

    /// List containers
    List,

    /// Show details and current usage of a container
    Info {
        /// Container ID
        #[arg(long)]
        id: String,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },

    /// Watch running containers until interrupted
    Monitor {
        /// Only watch this container
        #[arg(long)]
        id: Option<String>,
    },

    /// Check that this host can run containers
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => match e.downcast_ref::<CorralError>() {
            Some(err) => {
                eprintln!("error: {}: {}", err.kind(), err);
                err.exit_code()
            }
            None => return Err(e),
        },
    };
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = RuntimeConfig::load(cli.config.as_deref(), cli.root.as_deref())?;
    tracing::debug!(root = %config.root_dir.display(), "loaded configuration");

    let manager = {
        let config = config.clone();
        blocking(move || ContainerManager::new(&config)).await?
    };
    let manager = Arc::new(manager);

    match cli.command {
        Commands::Create {
            name,
            image,
            command,
            memory,
            cpus,
            pids,
            ports,
        } => {
            let limits = ResourceLimits {
                memory_bytes: memory.as_deref().map(parse_memory).transpose()?.unwrap_or(0),
                cpu_units: cpus.map(parse_cpus).transpose()?.unwrap_or(0),
                max_pids: pids.unwrap_or(0),
            };
            let mut request =
                CreateRequest::new(&name, &image, parse_command(&command)?).limits(limits);
            for map in ports.as_deref().map(parse_ports).transpose()?.unwrap_or_default() {
                request = request.port(map);
            }

            let manager = Arc::clone(&manager);
            lifecycle(move || manager.create(request), |id| println!("{}", id)).await
        }

        Commands::Start { id } => {
            let manager = Arc::clone(&manager);
            let shown = id.clone();
            lifecycle(move || manager.start(&id), move |()| println!("{}", shown)).await
        }

        Commands::Stop { id } => {
            let manager = Arc::clone(&manager);
            let shown = id.clone();
            lifecycle(move || manager.stop(&id), move |()| println!("{}", shown)).await
        }

        Commands::Remove { id } => {
            let manager = Arc::clone(&manager);
            let shown = id.clone();
            lifecycle(move || manager.remove(&id), move |()| println!("{}", shown)).await
        }

        Commands::List => {
            let containers = manager.list()?;
            println!(
                "{:<26} {:<20} {:<20} {:<10} {:<20} {:<15}",
                "CONTAINER ID", "NAME", "IMAGE", "STATUS", "CREATED", "IP"
            );
            for c in containers {
                println!(
                    "{:<26} {:<20} {:<20} {:<10} {:<20} {:<15}",
                    c.id,
                    c.name,
                    c.image,
                    c.status.to_string(),
                    c.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                    c.network.container_ip.to_string()
                );
            }
            Ok(0)
        }

        Commands::Info { id, json } => {
            let info = {
                let manager = Arc::clone(&manager);
                blocking(move || manager.info(&id)).await?
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                print_info(&info);
            }
            Ok(0)
        }

        Commands::Monitor { id } => monitor(&manager, &config, id).await,

        Commands::Check => {
            let mut first_error = None;
            for (name, result) in manager.check_support() {
                match result {
                    Ok(()) => println!("{:<12} ok", name),
                    Err(e) => {
                        println!("{:<12} FAILED: {}", name, e);
                        first_error.get_or_insert(e);
                    }
                }
            }
            match first_error {
                Some(e) => Err(e.into()),
                None => Ok(0),
            }
        }
    }
}

/// Run a blocking runtime call off the async workers
async fn blocking<T, F>(f: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> corral::Result<T> + Send + 'static,
{
    let value = tokio::task::spawn_blocking(f)
        .await
        .context("runtime worker panicked")??;
    Ok(value)
}

/// Run a lifecycle call to completion. A signal that arrives meanwhile is
/// honored once the call has resolved.
async fn lifecycle<T, F, R>(f: F, report: R) -> anyhow::Result<i32>
where
    T: Send + 'static,
    F: FnOnce() -> corral::Result<T> + Send + 'static,
    R: FnOnce(T),
{
    let call = blocking(f);
    tokio::pin!(call);

    let (result, interrupted) = tokio::select! {
        result = &mut call => (result, false),
        _ = shutdown_signal() => {
            eprintln!("interrupted, waiting for the current operation to finish");
            (call.await, true)
        }
    };

    report(result?);
    Ok(if interrupted { INTERRUPTED_EXIT } else { 0 })
}

async fn monitor(
    manager: &Arc<ContainerManager>,
    config: &RuntimeConfig,
    only: Option<String>,
) -> anyhow::Result<i32> {
    if let Some(id) = &only {
        manager.get(id)?;
    }

    let signal = shutdown_signal();
    tokio::pin!(signal);

    loop {
        let running: Vec<String> = manager
            .running_ids()?
            .into_iter()
            .filter(|id| only.as_ref().map_or(true, |only| only == id))
            .collect();
        if running.is_empty() {
            println!("no running containers");
            break;
        }

        for id in running {
            let manager = Arc::clone(manager);
            match blocking(move || manager.info(&id)).await {
                Ok(info) => print_sample(&info),
                Err(e) => tracing::warn!("{:#}", e),
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(config.monitor_interval()) => {}
            _ = &mut signal => {
                println!("shutting down monitor");
                break;
            }
        }
    }

    let manager = Arc::clone(manager);
    tokio::task::spawn_blocking(move || manager.shutdown())
        .await
        .context("runtime worker panicked")?;
    Ok(0)
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

fn print_sample(info: &ContainerInfo) {
    let c = &info.container;
    match info.usage {
        Some(usage) => println!(
            "{:<26} {:<20} mem {:>10}  cpu {:>9.2}s  pids {}",
            c.id,
            c.name,
            format_bytes(usage.memory_bytes),
            usage.cpu_seconds,
            usage.pid_count
        ),
        None => println!("{:<26} {:<20} no sample yet", c.id, c.name),
    }
}

fn print_info(info: &ContainerInfo) {
    let c = &info.container;
    println!("ID:          {}", c.id);
    println!("Name:        {}", c.name);
    println!("Image:       {}", c.image);
    println!("Command:     {}", c.command.join(" "));
    println!("Status:      {}", c.status);
    println!("Created:     {}", c.created_at.to_rfc3339());
    if let Some(started) = c.started_at {
        println!("Started:     {}", started.to_rfc3339());
    }
    if let Some(finished) = c.finished_at {
        println!("Finished:    {}", finished.to_rfc3339());
    }
    if let Some(pid) = c.pid {
        println!("PID:         {}", pid);
    }
    if let Some(code) = c.exit_code {
        println!("Exit code:   {}", code);
    }
    println!("IP:          {}/{}", info.network.ip, c.network.prefix_len);
    println!("Gateway:     {}", info.network.gateway);
    println!(
        "Veth:        {} <-> {}",
        info.network.host_veth, info.network.container_veth
    );
    for map in &info.network.port_maps {
        println!("Port:        {}", map);
    }
    let limits = &c.resource_limits;
    println!(
        "Limits:      memory {}, cpu {}, pids {}",
        limit_text(limits.memory_bytes, format_bytes),
        limit_text(limits.cpu_units, |u| format!("{:.2} cores", u as f64 / 100.0)),
        limit_text(limits.max_pids, |p| p.to_string())
    );
    if let Some(fs) = &info.filesystem {
        println!(
            "Filesystem:  {} layer(s), {} written, {} inodes",
            fs.layer_count,
            format_bytes(fs.upper_size_bytes),
            fs.inode_count
        );
    }
    if let Some(usage) = &info.usage {
        println!(
            "Usage:       memory {}, cpu {:.2}s, {} pid(s)",
            format_bytes(usage.memory_bytes),
            usage.cpu_seconds,
            usage.pid_count
        );
    }
}

fn limit_text(value: u64, show: impl Fn(u64) -> String) -> String {
    if value == 0 {
        "unlimited".to_string()
    } else {
        show(value)
    }
}

/// Parse a memory size; `m`/`M` is MiB, `g`/`G` GiB, no suffix MiB
fn parse_memory(value: &str) -> corral::Result<u64> {
    let invalid = || CorralError::InvalidArgument(format!("invalid memory size '{}'", value));
    let pattern = Regex::new(r"^(\d+(?:\.\d+)?)([mMgG]?)$")
        .map_err(|e| CorralError::InvalidArgument(e.to_string()))?;
    let captures = pattern.captures(value.trim()).ok_or_else(invalid)?;

    let amount: f64 = captures[1].parse().map_err(|_| invalid())?;
    let unit: f64 = match &captures[2] {
        "g" | "G" => 1024.0 * 1024.0 * 1024.0,
        _ => 1024.0 * 1024.0,
    };
    Ok((amount * unit).round() as u64)
}

/// Convert a fraction of cores into CPU units (hundredths of a core)
fn parse_cpus(cpus: f64) -> corral::Result<u64> {
    if !cpus.is_finite() || cpus < 0.0 {
        return Err(CorralError::InvalidArgument(format!(
            "invalid cpu limit {}",
            cpus
        )));
    }
    Ok((cpus * 100.0).round() as u64)
}

/// Split `--command` into argv the way `sh` would, quotes included
fn parse_command(value: &str) -> corral::Result<Vec<String>> {
    let argv = shell_words::split(value)
        .map_err(|e| CorralError::InvalidArgument(format!("invalid command '{}': {}", value, e)))?;
    if argv.is_empty() {
        return Err(CorralError::InvalidArgument("empty command".to_string()));
    }
    Ok(argv)
}

fn parse_ports(value: &str) -> corral::Result<Vec<PortMap>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral::network::Protocol;

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("512").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory("64m").unwrap(), 64 * 1024 * 1024);
        assert_eq!(parse_memory("64M").unwrap(), 64 * 1024 * 1024);
        assert_eq!(parse_memory("2g").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory("1.5G").unwrap(), 1536 * 1024 * 1024);
        assert_eq!(parse_memory("0").unwrap(), 0);
        for bad in ["", "-1", "12k", "lots", "1.2.3m"] {
            assert_eq!(parse_memory(bad).unwrap_err().kind(), "invalid_argument");
        }
    }

    #[test]
    fn test_parse_cpus() {
        assert_eq!(parse_cpus(0.5).unwrap(), 50);
        assert_eq!(parse_cpus(2.0).unwrap(), 200);
        assert_eq!(parse_cpus(0.0).unwrap(), 0);
        assert!(parse_cpus(-1.0).is_err());
        assert!(parse_cpus(f64::NAN).is_err());
    }

    #[test]
    fn test_parse_command_keeps_quoted_arguments() {
        assert_eq!(parse_command("/bin/sh").unwrap(), ["/bin/sh"]);
        assert_eq!(
            parse_command("sh -c 'sleep 5'").unwrap(),
            ["sh", "-c", "sleep 5"]
        );
        assert_eq!(
            parse_command(r"sh -c 'yes | tr \n x | head -c 400m | grep z'").unwrap(),
            ["sh", "-c", r"yes | tr \n x | head -c 400m | grep z"]
        );
        assert_eq!(
            parse_command(r#"echo "two words" three"#).unwrap(),
            ["echo", "two words", "three"]
        );
        for bad in ["", "   ", "sh -c 'unterminated"] {
            assert_eq!(parse_command(bad).unwrap_err().kind(), "invalid_argument");
        }
    }

    #[test]
    fn test_quoted_command_runs_as_one_script() {
        let argv = parse_command("sh -c 'exit 7'").unwrap();
        let status = std::process::Command::new(&argv[0])
            .args(&argv[1..])
            .status()
            .unwrap();
        assert_eq!(status.code(), Some(7));
    }

    #[test]
    fn test_parse_ports() {
        let maps = parse_ports("8080:80, 5353:53/udp").unwrap();
        assert_eq!(maps.len(), 2);
        assert_eq!(maps[0], PortMap::tcp(8080, 80));
        assert_eq!(maps[1].protocol, Protocol::Udp);
        assert!(parse_ports("8080").is_err());
    }

    #[test]
    fn test_cli_parses_create() {
        let cli = Cli::try_parse_from([
            "corral", "--root", "/tmp/c", "create", "--name", "web", "--image", "alpine",
            "--memory", "64m", "--ports", "8080:80", "--command", "sh -c 'sleep 5'",
        ])
        .unwrap();
        assert_eq!(cli.root, Some(PathBuf::from("/tmp/c")));
        match cli.command {
            Commands::Create { name, command, .. } => {
                assert_eq!(name, "web");
                assert_eq!(parse_command(&command).unwrap(), ["sh", "-c", "sleep 5"]);
            }
            _ => panic!("expected create"),
        }
    }

    #[test]
    fn test_cli_rejects_missing_id() {
        assert!(Cli::try_parse_from(["corral", "start"]).is_err());
    }
}
