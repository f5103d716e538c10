// InfraBench validator production entry point.

use anyhow::Result;
use clap::{Parser, Subcommand};
use infrabench_chain::HttpChainClient;
use infrabench_protocol::{HttpMinerTransport, Signer};
use infrabench_sandbox::HttpSandboxApi;
use infrabench_validator::config::Config;
use infrabench_validator::generation::HttpTaskSource;
use infrabench_validator::service::{ServiceDeps, ValidatorService};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[clap(name = "infrabench-validator")]
#[clap(author, version, about = "InfraBench - decentralized infrastructure benchmarking validator", long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the validator loop
    Start,

    /// Write the default configuration as TOML for reference
    Init {
        /// Output file path
        #[clap(short, long, default_value = "infrabench.toml")]
        output: String,
    },

    /// Show version information
    Version,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Init { output }) => init_config(&output),
        Some(Commands::Version) => {
            show_version();
            Ok(())
        }
        Some(Commands::Start) | None => start_validator().await,
    }
}

/// Dump the effective defaults. Runtime configuration is read from
/// `INFRABENCH_*` environment variables; the TOML file documents what the
/// knobs are and what they default to.
fn init_config(output: &str) -> Result<()> {
    let config = Config::default();
    std::fs::write(output, toml::to_string_pretty(&config)?)?;
    println!("Reference configuration written: {output}");
    println!("Set INFRABENCH_* environment variables to override, then run: infrabench-validator start");
    Ok(())
}

fn show_version() {
    println!("InfraBench Validator");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Build: {}", env!("CARGO_PKG_NAME"));
}

async fn start_validator() -> Result<()> {
    let config = Config::from_env().validate()?;
    init_logging(&config)?;

    // Wallet identity is the one thing we refuse to improvise: a validator
    // signing with a throwaway key would fail every miner's verification.
    let seed = std::env::var("INFRABENCH_HOTKEY_SEED")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            anyhow::anyhow!(
                "INFRABENCH_HOTKEY_SEED is not set; provide the validator hotkey seed (32-byte hex)"
            )
        })?;
    let seed_bytes: [u8; 32] = hex::decode(&seed)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| anyhow::anyhow!("INFRABENCH_HOTKEY_SEED must be 32 bytes of hex"))?;
    let signer = Signer::new(ed25519_signing_key(seed_bytes));
    let hotkey = signer.hotkey().to_string();

    info!(
        netuid = config.node.netuid,
        mode = ?config.gate.loop_mode,
        hotkey = %hotkey,
        "starting validator"
    );

    let transport = Arc::new(HttpMinerTransport::new(
        signer,
        Duration::from_secs_f64(config.timeouts.task_timeout_seconds),
    )?);
    let chain = Arc::new(HttpChainClient::new(
        &config.node.chain_endpoint,
        Duration::from_secs(30),
    )?);
    let task_source = Arc::new(HttpTaskSource::new(
        &config.tasks.generator_endpoint,
        Duration::from_secs(120),
    )?);
    let sandbox_api = if config.validation.enabled {
        Some(Arc::new(HttpSandboxApi::new(
            &config.validation.endpoint,
            Duration::from_secs(config.validation.timeout_seconds),
        )?) as Arc<dyn infrabench_sandbox::SandboxApi>)
    } else {
        None
    };

    let mut service = ValidatorService::new(
        config,
        ServiceDeps {
            chain,
            transport,
            task_source,
            sandbox_api,
            // Weight extrinsics are submitted by the substrate tooling that
            // watches the rolling scores; the core only updates the EMA.
            weight_emitter: None,
            hotkey: Some(hotkey),
        },
    );
    service.startup().await?;
    service.run().await;
    Ok(())
}

fn ed25519_signing_key(seed: [u8; 32]) -> ed25519_dalek::SigningKey {
    ed25519_dalek::SigningKey::from_bytes(&seed)
}

fn init_logging(config: &Config) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
    Ok(())
}
