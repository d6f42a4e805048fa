use bulencoin::config::{NodeConfig, NodeRole};
use bulencoin::crypto::keys::NodeIdentity;
use bulencoin::node::NodeHandle;

use colored::*;
use tracing::info;
use tracing_subscriber::EnvFilter;

const IDENTITY_FILE: &str = "identity.seed";

fn banner() {
    println!("{}", " ██████╗ ██╗   ██╗██╗     ███████╗███╗   ██╗".bright_cyan());
    println!("{}", " ██╔══██╗██║   ██║██║     ██╔════╝████╗  ██║".bright_cyan());
    println!("{}", " ██████╔╝██║   ██║██║     █████╗  ██╔██╗ ██║".bright_cyan().bold());
    println!("{}", " ██╔══██╗██║   ██║██║     ██╔══╝  ██║╚██╗██║".bright_cyan().bold());
    println!("{}", " ██████╔╝╚██████╔╝███████╗███████╗██║ ╚████║".blue());
    println!("{}", " ╚═════╝  ╚═════╝ ╚══════╝╚══════╝╚═╝  ╚═══╝".blue());
    println!();
    println!(
        "{}",
        "        Proof-of-Stake Node, v0.4 devnet        "
            .bright_green()
            .on_black()
            .bold()
    );
    println!();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    banner();

    let config = NodeConfig::from_env();
    println!(
        "{} data dir: {}",
        "[init]".bright_blue().bold(),
        config.data_dir.display()
    );
    println!(
        "{} chain: {}  role: {:?}",
        "[init]".bright_blue().bold(),
        config.consensus.chain_id,
        config.role
    );

    let identity = match config.role {
        NodeRole::Validator => Some(NodeIdentity::load_or_create(
            &config.data_dir.join(IDENTITY_FILE),
        )?),
        NodeRole::Observer => None,
    };
    if let Some(id) = &identity {
        println!(
            "{} validator address: {}",
            "[security]".bright_yellow().bold(),
            id.address
        );
    }

    let node = NodeHandle::open(config, identity)?;
    let checkpoint = node.checkpoint().await;
    if let Some(tip) = node.tip().await {
        println!(
            "{} chain height: {}  finalized: {}",
            "[init]".bright_blue().bold(),
            tip.index,
            checkpoint.finalized_height
        );
    }

    let producer = node.run_producer();
    if producer.is_some() {
        println!(
            "{} producing every {} ms, up to {} txs per block",
            "[producer]".bright_magenta().bold(),
            node.config().block_interval_ms,
            node.config().max_block_transactions
        );
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    if let Some(handle) = producer {
        handle.abort();
    }

    let checkpoint = node.checkpoint().await;
    println!(
        "{} done at finalized height {}",
        "[shutdown]".bright_red().bold(),
        checkpoint.finalized_height
    );
    Ok(())
}
