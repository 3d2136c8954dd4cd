use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use dotenvy::dotenv;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use warden::config::Config;
use warden::sandbox::{ExecOptions, SandboxConfig, SandboxRuntime, TerminateOptions};
use warden::script::{self, EvalOptions};

#[derive(Parser)]
#[command(name = "warden", about = "Sandbox facade and restricted script runner")]
enum Cli {
    /// Evaluate a Lua script and print its result as JSON
    Eval {
        /// Override the evaluation deadline
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Inline script text
        #[arg(long, conflicts_with = "file")]
        script: Option<String>,
        /// Script file to evaluate
        file: Option<PathBuf>,
    },
    /// Run one command in a fresh sandbox, then tear it down
    Exec {
        /// Adapter to provision with
        #[arg(long, default_value = "local")]
        adapter: String,
        /// Working directory inside the sandbox
        #[arg(long)]
        cwd: Option<String>,
        /// Shell command to run
        command: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warden=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_tree::HierarchicalLayer::new(2)
                .with_targets(true)
                .with_bracketed_fields(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = Config::from_env();

    match Cli::parse() {
        Cli::Eval {
            timeout_ms,
            script,
            file,
        } => run_eval(&config, timeout_ms, script, file).await,
        Cli::Exec {
            adapter,
            cwd,
            command,
        } => run_exec(&config, &adapter, cwd, &command).await,
    }
}

async fn run_eval(
    config: &Config,
    timeout_ms: Option<u64>,
    script: Option<String>,
    file: Option<PathBuf>,
) -> Result<()> {
    let source = match (script, file) {
        (Some(text), _) => text,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read script file: {}", path.display()))?,
        (None, None) => bail!("provide --script TEXT or a script FILE"),
    };

    let mut options = EvalOptions::from_config(config);
    if let Some(ms) = timeout_ms {
        options = options.timeout_ms(ms);
    }

    let value = script::eval(&source, options).await?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn run_exec(config: &Config, adapter: &str, cwd: Option<String>, command: &str) -> Result<()> {
    let runtime = SandboxRuntime::from_config(config)?;
    let handle = runtime
        .create(adapter, SandboxConfig::new())
        .await
        .with_context(|| format!("failed to provision sandbox on '{adapter}'"))?;

    let mut opts = ExecOptions::default();
    if let Some(cwd) = cwd {
        opts = opts.cwd(cwd);
    }
    let outcome = runtime.exec(&handle, command, &opts).await;

    if let Err(e) = runtime.terminate(&handle, &TerminateOptions::default()).await {
        tracing::warn!(sandbox_id = %handle.id(), error = %e, "failed to terminate sandbox");
    }

    let result = outcome.context("command failed to run")?;
    print!("{}", result.stdout);
    eprint!("{}", result.stderr);
    if !result.success() {
        std::process::exit(result.exit_code as i32);
    }
    Ok(())
}
