//! Ember CLI - invoke JavaScript modules in out-of-process workers.

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use ember::{CancellationToken, Ember, EmberConfig, InvocationRequest};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "ember")]
#[command(about = "Invoke JavaScript modules in out-of-process workers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Invoke a module and print its result as JSON
    Invoke {
        /// Module path, relative to the project directory
        module: String,

        /// Export to call (default export when omitted)
        #[arg(short, long)]
        export: Option<String>,

        /// Arguments as a JSON array (a single value is passed as one argument)
        #[arg(short, long)]
        args: Option<String>,

        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Project directory (overrides the configuration)
        #[arg(short, long)]
        project: Option<PathBuf>,
    },

    /// Start a worker, wait for its handshake and report it
    Check {
        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Surface the worker's stack trace along with the message
    let format_error =
        |err: ember::Error| -> anyhow::Error { anyhow::anyhow!("{}", err.with_stack()) };

    match cli.command {
        Commands::Invoke {
            module,
            export,
            args,
            config,
            project,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(project) = project {
                config.process.project_path = project;
            }
            let args = parse_args(args.as_deref())?;

            let mut request = InvocationRequest::file(module).with_args(args);
            if let Some(export) = export {
                request = request.with_export(export);
            }

            let ember = Ember::new(&config).map_err(format_error)?;
            let cancel = cancel_on_ctrl_c();
            let result = ember.invoke::<Value>(request, &cancel).await;
            ember.dispose();

            match result.map_err(format_error)? {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => println!("cache miss"),
            }
        }

        Commands::Check { config } => {
            let config = load_config(config.as_deref())?;
            let ember = Ember::new(&config).map_err(format_error)?;
            let cancel = cancel_on_ctrl_c();
            let worker = ember.connect(&cancel).await.map_err(format_error)?;

            println!("pid:      {}", worker.pid());
            println!("endpoint: {}", worker.endpoint().unwrap_or("-"));
            ember.dispose();
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EmberConfig> {
    match path {
        Some(path) => Ok(EmberConfig::from_json_file(path)?),
        None => Ok(EmberConfig::default()),
    }
}

fn parse_args(args: Option<&str>) -> anyhow::Result<Vec<Value>> {
    let Some(args) = args else {
        return Ok(Vec::new());
    };
    let value: Value = serde_json::from_str(args).context("--args must be valid JSON")?;
    match value {
        Value::Array(values) => Ok(values),
        Value::Null => bail!("--args must not be null; omit it to pass no arguments"),
        other => Ok(vec![other]),
    }
}

/// Token cancelled on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling...");
            trigger.cancel();
        }
    });
    cancel
}
