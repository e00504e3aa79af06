use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::Path;
use std::process::{Command, Stdio};

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Extension bridge task runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tests
    Test {
        #[command(subcommand)]
        test_type: Option<TestType>,
    },

    /// Run clippy linter
    Clippy,

    /// Format the workspace
    Fmt {
        /// Only check, do not rewrite files
        #[arg(long)]
        check: bool,
    },

    /// Generate a host config with a fresh extension id
    GenConfig {
        /// Output path
        #[arg(short, long, default_value = "config.toml")]
        output: String,

        /// Origin of the simulated dApp page
        #[arg(long, default_value = "https://app.uniswap.org")]
        page_origin: String,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Run the bridge host
    Run {
        /// Config file (defaults to config.toml)
        #[arg(short, long, default_value = "config.toml")]
        config: String,

        /// Log filter passed as RUST_LOG
        #[arg(long)]
        log: Option<String>,
    },
}

#[derive(Subcommand)]
enum TestType {
    /// Unit tests inside each crate
    Unit,

    /// Cross-context scenarios in bridge-core/tests
    Integration,

    /// Everything
    All,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Test { test_type } => test(test_type),
        Commands::Clippy => clippy(),
        Commands::Fmt { check } => fmt(check),
        Commands::GenConfig {
            output,
            page_origin,
            force,
        } => gen_config(&output, &page_origin, force),
        Commands::Run { config, log } => run(&config, log.as_deref()),
    }
}

fn test(test_type: Option<TestType>) -> Result<()> {
    match test_type {
        Some(TestType::Unit) => {
            println!("🧪 Running unit tests...");
            run_cmd("cargo", &["test", "--workspace", "--lib", "--bins"])?;
        }
        Some(TestType::Integration) => {
            println!("🧪 Running cross-context scenarios...");
            run_cmd("cargo", &["test", "-p", "bridge-core", "--tests"])?;
        }
        Some(TestType::All) | None => {
            println!("🧪 Running all tests...");
            run_cmd("cargo", &["test", "--workspace"])?;
        }
    }
    Ok(())
}

fn clippy() -> Result<()> {
    println!("🔍 Running clippy on workspace (warnings as errors)...");
    run_cmd(
        "cargo",
        &[
            "clippy",
            "--workspace",
            "--all-targets",
            "--",
            "-D",
            "warnings",
        ],
    )?;
    Ok(())
}

fn fmt(check: bool) -> Result<()> {
    let mut args = vec!["fmt", "--all"];
    if check {
        println!("🔍 Checking formatting...");
        args.extend(["--", "--check"]);
    } else {
        println!("🎨 Formatting workspace...");
    }
    run_cmd("cargo", &args)
}

fn gen_config(output: &str, page_origin: &str, force: bool) -> Result<()> {
    use std::fs;

    if Path::new(output).exists() && !force {
        anyhow::bail!("{} already exists, pass --force to overwrite", output);
    }

    let extension_id = generate_extension_id();
    let config_content = format!(
        r#"[host]
extension_origin = "chrome-extension://{extension_id}"
page_origin = "{page_origin}"
store_path = "./data/bridge-store.json"
stats_interval_secs = 30

[bridge.keepalive]
interval_ms = 5000
pong_timeout_ms = 2000
max_missed = 2

[bridge.router]
queue_capacity = 16
relay_ttl_ms = 300000

[bridge.correlator]
default_timeout_ms = 30000

[wallet]
name = "OneKey"
version = "5.0.0"
accounts = []
"#,
        extension_id = extension_id,
        page_origin = page_origin,
    );

    fs::write(output, config_content).with_context(|| format!("Failed to write {}", output))?;

    println!("  ✅ Created {} (extension id {})", output, extension_id);
    println!();
    println!("Next steps:");
    println!("  cargo xtask run --config {}", output);

    Ok(())
}

fn run(config: &str, log: Option<&str>) -> Result<()> {
    if !Path::new(config).exists() {
        anyhow::bail!("{} not found, generate one with: cargo xtask gen-config", config);
    }

    println!("🚀 Starting bridge host with {}...", config);
    let mut cmd = Command::new("cargo");
    cmd.args(["run", "-p", "bridge-host", "--"])
        .env("CONFIG_PATH", config)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());
    if let Some(filter) = log {
        cmd.env("RUST_LOG", filter);
    }

    let status = cmd.status().context("Failed to run bridge host")?;
    if !status.success() {
        anyhow::bail!("Bridge host exited with {}", status);
    }
    Ok(())
}

fn run_cmd(program: &str, args: &[&str]) -> Result<()> {
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .with_context(|| format!("Failed to run: {} {}", program, args.join(" ")))?;

    if !status.success() {
        anyhow::bail!("Command failed: {} {}", program, args.join(" "));
    }

    Ok(())
}

/// Chrome extension ids are 32 letters from a to p.
fn generate_extension_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..32)
        .map(|_| (b'a' + rng.gen_range(0..16u8)) as char)
        .collect()
}
