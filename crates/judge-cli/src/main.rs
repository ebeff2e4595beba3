use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use bollard::Docker;
use clap::{Parser, Subcommand};
use judge_core::{Sandbox, SandboxInvocation};

#[derive(Parser, Debug)]
#[command(name = "judge-cli", version, about = "One-shot judging sandbox runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a single Python script through the sandbox and print the result.
    Run(RunArgs),
    /// Query a running ingress adapter's status endpoint.
    Status(StatusArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Path to a standalone Python script, copied into the sandbox as main.py.
    script_path: PathBuf,
    #[arg(long, default_value = "registry.gitlab.com/pyshare/judger")]
    image: String,
}

#[derive(clap::Args, Debug)]
struct StatusArgs {
    #[arg(long)]
    addr: String,
    #[arg(long)]
    token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_one_submission(args).await,
        Command::Status(args) => query_status(args).await,
    }
}

/// Mirrors the original one-shot submission runner: copy the script into a
/// scratch directory as `main.py`, run it with the same fixed resource
/// limits the judging service itself uses, print the result as JSON.
async fn run_one_submission(args: RunArgs) -> Result<()> {
    if !args.script_path.is_file() {
        anyhow::bail!("{} is not a file", args.script_path.display());
    }

    let scratch_dir = tempfile::Builder::new()
        .prefix("judge-one-shot-submission-")
        .tempdir()
        .context("failed to create scratch directory")?;
    std::fs::copy(&args.script_path, scratch_dir.path().join("main.py"))
        .context("failed to stage script as main.py")?;

    let docker = Docker::connect_with_local_defaults().context("failed to connect to the Docker daemon")?;
    let invocation = SandboxInvocation {
        time_limit_ms: 10_000,
        mem_limit_kb: 128_000,
        output_size_limit_bytes: 4_096,
        file_size_limit_bytes: 64_000_000,
        host_src_dir: scratch_dir.path().to_path_buf(),
        container_src_dir: scratch_dir.path().to_path_buf(),
        ignores: HashSet::from(["__pycache__".to_string(), "main.py".to_string()]),
        oj_input_file: None,
    };

    let result = Sandbox::new(docker, args.image, invocation).run().await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn query_status(args: StatusArgs) -> Result<()> {
    let url = format!("{}/status", args.addr.trim_end_matches('/'));
    let client = reqwest::Client::new();
    let mut request = client.get(&url);
    if let Some(token) = &args.token {
        request = request.header("x-judge-token", token);
    }
    let response = request.send().await.context("failed to reach ingress adapter")?;
    let body: serde_json::Value = response.json().await.context("failed to parse status response")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
