//! Build Cache Daemon - Remote build caches for CI jobs
//!
//! Saves workspace directories under cache keys in a local or Backblaze B2
//! object store and restores them by exact key or restore-key prefix.

mod cache;
mod config;
mod ipc;
mod manager;
mod store;

use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use cache::{is_interrupted, CacheRequest, SaveStatus};
use config::DaemonConfig;
use ipc::IpcServer;
use manager::CacheManager;

/// Exit code after Ctrl+C
const EXIT_INTERRUPTED: i32 = 130;

/// CLI command
#[derive(Debug, PartialEq, Eq)]
enum Command {
    /// Run IPC server mode (default)
    Server,
    Restore {
        request: PathBuf,
    },
    Save {
        request: PathBuf,
        build_failed: bool,
    },
    /// Restore, run a command in the workspace, then save
    Run {
        request: PathBuf,
        program: String,
        args: Vec<String>,
    },
    Size {
        job: String,
    },
    Purge {
        job: String,
    },
    Health,
}

fn print_help() {
    eprintln!(
        r#"Build Cache Daemon - Remote build caches for CI jobs

USAGE:
    buildcache-daemon [server]                    # Run IPC server (default)
    buildcache-daemon restore <request.json>
    buildcache-daemon save <request.json> [--build-failed]
    buildcache-daemon run <request.json> -- <command> [args...]
    buildcache-daemon size <job>
    buildcache-daemon purge <job>
    buildcache-daemon health
    buildcache-daemon help

COMMANDS:
    server   Serve cache requests on the Unix socket
    restore  Restore the caches described by a request file
    save     Save the caches of a request file (skipped with --build-failed)
    run      Restore, run the command in the workspace, save if it succeeded
    size     Print the bytes stored for a job
    purge    Delete every cache of a job
    health   Check that the configured bucket is reachable
    help     Show this help message

ENVIRONMENT:
    BUILDCACHE_BACKEND     local | b2 (default: local)
    BUILDCACHE_LOCAL_ROOT  Root directory of the local backend
    BUILDCACHE_BUCKET      Bucket name (default: buildcache)
    BUILDCACHE_PREFIX      Prefix under which job scopes live
    BUILDCACHE_SOCKET      Unix socket path (default: /tmp/buildcache.sock)
    B2_KEY_ID              B2 application key ID
    B2_KEY                 B2 application key
    RUST_LOG               Log filter (trace, debug, info, warn, error)
"#
    );
}

fn required<'a>(args: &'a [String], index: usize, usage: &str) -> Result<&'a String> {
    args.get(index)
        .ok_or_else(|| anyhow!("Usage: buildcache-daemon {}", usage))
}

/// Parse the command line; `None` asks for help
fn parse_args(args: &[String]) -> Result<Option<Command>> {
    let Some(name) = args.get(1) else {
        return Ok(Some(Command::Server));
    };

    let command = match name.as_str() {
        "server" => Command::Server,
        "restore" => Command::Restore {
            request: PathBuf::from(required(args, 2, "restore <request.json>")?),
        },
        "save" => {
            let request = required(args, 2, "save <request.json> [--build-failed]")?;
            let build_failed = args[3..].iter().any(|a| a == "--build-failed");
            Command::Save {
                request: PathBuf::from(request),
                build_failed,
            }
        }
        "run" => {
            let usage = "run <request.json> -- <command> [args...]";
            let request = required(args, 2, usage)?;
            // The separator must follow the request path
            let separator = args
                .iter()
                .skip(3)
                .position(|a| a == "--")
                .map(|i| i + 3)
                .ok_or_else(|| anyhow!("Usage: buildcache-daemon {}", usage))?;
            let program = required(args, separator + 1, usage)?;
            Command::Run {
                request: PathBuf::from(request),
                program: program.clone(),
                args: args[separator + 2..].to_vec(),
            }
        }
        "size" => Command::Size {
            job: required(args, 2, "size <job>")?.clone(),
        },
        "purge" => Command::Purge {
            job: required(args, 2, "purge <job>")?.clone(),
        },
        "health" => Command::Health,
        "help" | "--help" | "-h" => return Ok(None),
        other => return Err(anyhow!("Unknown command: {}", other)),
    };
    Ok(Some(command))
}

fn load_request(path: &Path) -> Result<CacheRequest> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read request file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Invalid request file {}", path.display()))
}

fn print_lines(lines: &[String]) {
    for line in lines {
        println!("{}", line);
    }
}

/// Exit code for a failed cache operation
fn failure_code(e: &anyhow::Error) -> i32 {
    if is_interrupted(e) {
        EXIT_INTERRUPTED
    } else {
        1
    }
}

async fn run_server(manager: Arc<CacheManager>, config: &DaemonConfig) -> Result<i32> {
    info!(backend = manager.store().kind(), "Starting build cache daemon in IPC server mode");

    match manager.preflight().await {
        Ok(true) => {}
        Ok(false) => warn!(bucket = %config.bucket, "Bucket not found, cache requests will fail"),
        Err(e) => warn!(error = %e, "Bucket preflight failed"),
    }

    let mut ipc_server = IpcServer::new(Arc::clone(&manager), &config.socket_path);
    if let Err(e) = ipc_server.start().await {
        error!(error = %e, "Failed to start IPC server");
        return Err(e);
    }
    let ipc_server = Arc::new(ipc_server);

    info!("Daemon ready. Waiting for cache requests...");

    let running = Arc::clone(&ipc_server);
    let ipc_handle = tokio::spawn(async move {
        if let Err(e) = running.run().await {
            error!(error = %e, "IPC server error");
        }
    });

    manager.cancel_token().cancelled().await;

    info!("Received shutdown signal, stopping...");
    ipc_handle.abort();
    ipc_server.stop().await?;
    info!("Shutdown complete.");
    Ok(0)
}

async fn run_command(
    manager: &CacheManager,
    request: CacheRequest,
    program: &str,
    args: &[String],
) -> Result<i32> {
    let workspace = request.workspace.clone();
    let mut session = manager.session(request)?;
    let mut exit_code = 0;

    let result = session
        .run(async {
            let status = tokio::process::Command::new(program)
                .args(args)
                .current_dir(&workspace)
                .status()
                .await
                .with_context(|| format!("Failed to start '{}'", program))?;
            if status.success() {
                Ok::<(), anyhow::Error>(())
            } else {
                exit_code = status.code().unwrap_or(1);
                Err(anyhow!("'{}' exited with {}", program, status))
            }
        })
        .await;

    print_lines(session.report().lines());
    let result = match result {
        Ok(result) => result,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return Ok(failure_code(&e));
        }
    };

    if let Err(e) = result.body {
        eprintln!("Error: {:#}", e);
        return Ok(if exit_code != 0 { exit_code } else { 1 });
    }
    match result.save {
        SaveStatus::Failed(error) => {
            eprintln!("Error: {}", error);
            Ok(1)
        }
        _ => Ok(0),
    }
}

async fn execute(command: Command, config: &DaemonConfig, cancel: CancellationToken) -> Result<i32> {
    let manager = Arc::new(CacheManager::from_config(config, cancel).await?);

    match command {
        Command::Server => run_server(manager, config).await,
        Command::Restore { request } => match manager.restore(load_request(&request)?).await {
            Ok(lines) => {
                print_lines(&lines);
                Ok(0)
            }
            Err(e) => {
                eprintln!("Error: {:#}", e);
                Ok(failure_code(&e))
            }
        },
        Command::Save {
            request,
            build_failed,
        } => {
            let (lines, status) = manager.save(load_request(&request)?, !build_failed).await?;
            print_lines(&lines);
            match status {
                SaveStatus::Failed(error) => {
                    eprintln!("Error: {}", error);
                    Ok(1)
                }
                _ => Ok(0),
            }
        }
        Command::Run {
            request,
            program,
            args,
        } => run_command(&manager, load_request(&request)?, &program, &args).await,
        Command::Size { job } => {
            println!("{}", manager.size(&job).await?);
            Ok(0)
        }
        Command::Purge { job } => {
            let deleted = manager.purge(&job).await?;
            println!("Deleted {} objects of job '{}'", deleted, job);
            Ok(0)
        }
        Command::Health => {
            let reachable = manager.preflight().await?;
            println!(
                "Bucket '{}' on {} backend: {}",
                config.bucket,
                manager.store().kind(),
                if reachable { "reachable" } else { "not found" }
            );
            Ok(if reachable { 0 } else { 1 })
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries status lines
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args: Vec<String> = env::args().collect();
    let command = match parse_args(&args) {
        Ok(Some(command)) => command,
        Ok(None) => {
            print_help();
            return Ok(());
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(2);
        }
    };

    let config = DaemonConfig::from_env()?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling in-flight transfers");
                cancel.cancel();
            }
        });
    }

    let code = execute(command, &config, cancel).await?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("buildcache-daemon")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_parse_defaults_to_server() {
        assert_eq!(parse_args(&args(&[])).unwrap(), Some(Command::Server));
    }

    #[test]
    fn test_parse_save_flag() {
        assert_eq!(
            parse_args(&args(&["save", "req.json", "--build-failed"])).unwrap(),
            Some(Command::Save {
                request: PathBuf::from("req.json"),
                build_failed: true,
            })
        );
        assert!(parse_args(&args(&["save"])).is_err());
    }

    #[test]
    fn test_parse_run_command() {
        assert_eq!(
            parse_args(&args(&["run", "req.json", "--", "mvn", "-B", "package"])).unwrap(),
            Some(Command::Run {
                request: PathBuf::from("req.json"),
                program: "mvn".to_string(),
                args: vec!["-B".to_string(), "package".to_string()],
            })
        );
        assert!(parse_args(&args(&["run", "req.json", "--"])).is_err());
        assert!(parse_args(&args(&["run", "req.json", "mvn"])).is_err());
    }

    #[test]
    fn test_run_separator_must_follow_request() {
        assert!(parse_args(&args(&["run", "--", "mvn"])).is_err());
        assert_eq!(
            parse_args(&args(&["run", "req.json", "--", "sh", "--", "-x"])).unwrap(),
            Some(Command::Run {
                request: PathBuf::from("req.json"),
                program: "sh".to_string(),
                args: vec!["--".to_string(), "-x".to_string()],
            })
        );
    }

    #[test]
    fn test_unknown_command_is_an_error() {
        let err = parse_args(&args(&["mount"])).unwrap_err();
        assert_eq!(err.to_string(), "Unknown command: mount");
        assert_eq!(parse_args(&args(&["help"])).unwrap(), None);
        assert_eq!(parse_args(&args(&["--help"])).unwrap(), None);
    }
}
