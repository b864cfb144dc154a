//! mcp-toolpipe: tool invocation between processes over MCP
//!
//! `serve` runs a stdio tool server; `list` and `call` spawn a server and
//! act as its client.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use mcp_toolpipe::config::{self, Config};
use mcp_toolpipe::error::{Error, Result};
use mcp_toolpipe::mcp::protocol::Implementation;
use mcp_toolpipe::mcp::{
    Arguments, ClientSession, McpServer, ProcessConfig, SessionOptions, Transport,
};
use mcp_toolpipe::tools;

/// How long the runtime waits for stray blocking reads on exit.
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

/// Tool invocation between processes over MCP.
///
/// Serves built-in tools on stdio, or spawns a tool server and calls it.
#[derive(Parser, Debug)]
#[command(name = "mcp-toolpipe")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(long, global = true, value_name = "CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Increase logging verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Decrease logging verbosity (only show errors)
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve built-in tools over stdin/stdout
    Serve {
        /// Tool to expose (repeatable; default: the configured set, or all)
        #[arg(long = "tool", value_name = "NAME")]
        tools: Vec<String>,

        /// Server name reported in the handshake
        #[arg(long)]
        name: Option<String>,
    },

    /// Spawn a server and list its tools
    List {
        /// Environment variable for the server (repeatable)
        #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
        env: Vec<(String, String)>,

        /// Server command and its arguments
        #[arg(last = true, required = true, value_name = "COMMAND")]
        command: Vec<String>,
    },

    /// Spawn a server and call one tool
    Call {
        /// Tool to call
        #[arg(long)]
        tool: String,

        /// Arguments as a JSON object
        #[arg(long, value_name = "JSON", default_value = "{}")]
        args: String,

        /// Time bound for the call, in milliseconds
        #[arg(long, value_name = "MILLIS")]
        timeout_ms: Option<u64>,

        /// Environment variable for the server (repeatable)
        #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
        env: Vec<(String, String)>,

        /// Server command and its arguments
        #[arg(last = true, required = true, value_name = "COMMAND")]
        command: Vec<String>,
    },
}

fn parse_env(pair: &str) -> std::result::Result<(String, String), String> {
    match pair.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{pair}'")),
    }
}

/// Determines the log level from CLI arguments.
#[allow(clippy::match_same_arms)] // Explicit "warn" arm for clarity
fn get_log_level(verbose: u8, quiet: bool, config_level: &str) -> Level {
    if quiet {
        return Level::ERROR;
    }

    match verbose {
        0 => match config_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN, // Default to warn for unknown levels
        },
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Initialises the tracing subscriber for logging.
///
/// Logs go to stderr; stdout carries protocol frames when serving.
fn init_tracing(level: Level) {
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn session_options(cfg: &Config) -> SessionOptions {
    SessionOptions {
        handshake_timeout: cfg.session.handshake_timeout(),
        call_timeout: cfg.session.call_timeout(),
        ..SessionOptions::default()
    }
}

fn process_config(command: Vec<String>, env: Vec<(String, String)>) -> Result<ProcessConfig> {
    let mut parts = command.into_iter();
    let program = parts
        .next()
        .ok_or_else(|| Error::InvalidArgument("missing server command".to_string()))?;
    let mut process = ProcessConfig::new(program).args(parts);
    process.env = env;
    Ok(process)
}

async fn serve(cfg: Config, requested: Vec<String>, name: Option<String>) -> Result<()> {
    let selected = if requested.is_empty() {
        cfg.server.tools
    } else {
        requested
    };
    let registry = tools::builtin_registry(selected.as_slice())?;
    let name = name.unwrap_or(cfg.server.name);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        server = %name,
        "Starting mcp-toolpipe server"
    );

    let mut server = McpServer::with_info(Arc::new(registry), Implementation::new(name));
    server.run(Transport::stdio()).await?;
    Ok(())
}

async fn list(cfg: Config, process: ProcessConfig) -> Result<()> {
    let session = ClientSession::connect(&process, session_options(&cfg)).await?;
    let listed = session.list_tools().await;
    let status = session.close().await;
    info!(status = ?status, "Server exited");

    for tool in listed? {
        println!("{}\t{}", tool.name, tool.description);
        for param in &tool.params {
            let required = if param.required { "required" } else { "optional" };
            println!("    {}: {} ({required})", param.name, param.kind);
        }
    }
    Ok(())
}

async fn call(
    cfg: Config,
    process: ProcessConfig,
    tool: &str,
    args: &str,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let arguments: Arguments = match serde_json::from_str(args) {
        Ok(Value::Object(map)) => map,
        Ok(_) => return Err(Error::InvalidArgument("--args must be a JSON object".to_string())),
        Err(e) => return Err(Error::InvalidArgument(format!("--args is not valid JSON: {e}"))),
    };
    let timeout = timeout_ms
        .map(Duration::from_millis)
        .or_else(|| cfg.session.call_timeout());

    let session = ClientSession::connect(&process, session_options(&cfg)).await?;
    let result = session
        .call_tool_with_timeout(tool, arguments, timeout)
        .await;
    let status = session.close().await;
    info!(status = ?status, "Server exited");

    println!("{}", result?.to_text());
    Ok(())
}

async fn run(command: Command, cfg: Config) -> Result<()> {
    match command {
        Command::Serve { tools: requested, name } => serve(cfg, requested, name).await,
        Command::List { env, command } => list(cfg, process_config(command, env)?).await,
        Command::Call {
            tool,
            args,
            timeout_ms,
            env,
            command,
        } => {
            let process = process_config(command, env)?;
            call(cfg, process, &tool, &args, timeout_ms).await
        }
    }
}

/// Entry point for mcp-toolpipe.
fn main() -> ExitCode {
    let args = Args::parse();

    // Load configuration
    let cfg = match config::load_or_default(args.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            if args.config.is_none() {
                if let Some(default_path) = config::default_config_path() {
                    eprintln!("\nConfig read from: {}", default_path.display());
                }
            }
            return ExitCode::FAILURE;
        }
    };

    // Initialise logging
    let log_level = get_log_level(args.verbose, args.quiet, &cfg.logging.level);
    init_tracing(log_level);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(run(args.command, cfg));
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }

    #[test]
    fn parse_call_with_trailing_command() {
        let args = Args::try_parse_from([
            "mcp-toolpipe",
            "-v",
            "call",
            "--tool",
            "echo",
            "--args",
            r#"{"text":"hi"}"#,
            "--env",
            "RUST_LOG=debug",
            "--",
            "server-bin",
            "serve",
            "--tool",
            "echo",
        ])
        .unwrap();

        assert_eq!(args.verbose, 1);
        let Command::Call {
            tool, env, command, ..
        } = args.command
        else {
            panic!("expected call");
        };
        assert_eq!(tool, "echo");
        assert_eq!(env, [("RUST_LOG".to_string(), "debug".to_string())]);
        assert_eq!(command, ["server-bin", "serve", "--tool", "echo"]);
    }

    #[test]
    fn parse_env_rejects_missing_separator() {
        assert!(parse_env("NOVALUE").is_err());
        assert!(parse_env("=x").is_err());
        assert_eq!(
            parse_env("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
    }

    #[test]
    fn log_level_precedence() {
        assert_eq!(get_log_level(0, true, "trace"), Level::ERROR);
        assert_eq!(get_log_level(2, false, "warn"), Level::DEBUG);
        assert_eq!(get_log_level(0, false, "info"), Level::INFO);
        assert_eq!(get_log_level(0, false, "loud"), Level::WARN);
    }
}
