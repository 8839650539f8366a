use std::sync::Arc;

use anyhow::Result;
use cdn_ledger::{
    address::Address, config::MinerConfig, logging, memory::MemoryLedger, mining::LedgerMiner,
    stopper,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    logging::setup();
    let config = MinerConfig::load()?;
    let storage = Arc::new(MemoryLedger::new());
    let miner = LedgerMiner::new(storage, config.signing_key()?, config.schedule());

    let owner = miner.public_key();
    let genesis = miner.init_genesis_block(config.genesis_coins, &owner)?;
    info!(
        block_id = %genesis.block_id(),
        owner = %Address::from_public_key(config.address_version, &owner),
        coins = config.genesis_coins,
        "Genesis block created"
    );

    let cancel_token = CancellationToken::new();
    let stopper_handle = stopper::run(cancel_token.clone());
    let miner_handle = miner.spawn(cancel_token.clone());

    let miner_result = stopper::join("miner", miner_handle).await;
    cancel_token.cancel();
    let stopper_result = stopper::join("stopper", stopper_handle).await;
    miner_result?;
    stopper_result?;
    info!("Goodbye.");
    Ok(())
}
