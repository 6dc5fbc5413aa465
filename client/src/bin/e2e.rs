//! End-to-end run: deposit → confirm → withdraw against a deployed mixer.
//!
//!   1. Opens the local record store and connects to the mixer contract
//!   2. Deposits into a fresh commitment and waits for confirmation
//!   3. Withdraws it to the recipient and waits for confirmation
//!   4. Prints the reconciled ledger state after each step
//!
//! Usage:
//!   cargo run --release -p mixer-client --bin e2e
//!
//! Reads the same environment as `MixerConfig::from_env`, plus:
//!   DEPOSIT_AMOUNT     - Ether to deposit (default: 1.0)
//!   RECIPIENT_ADDRESS  - Withdrawal recipient (default: the wallet address)

use std::sync::Arc;

use alloy::signers::local::PrivateKeySigner;
use anyhow::{ensure, Context, Result};
use mixer_client::{logging, AlloyLedger, LedgerSnapshot, Mixer, MixerConfig, RecordStore};
use mixer_lib::{Amount, CommitmentStatus, Recipient};

fn print_state(snapshot: &LedgerSnapshot) {
    println!(
        "    Deposited: {} ETH   Withdrawn: {} ETH",
        snapshot.total_deposited, snapshot.total_withdrawn
    );
    for deposit in &snapshot.deposits {
        let flag = if deposit.approximate { " (approx)" } else { "" };
        println!(
            "    deposit    {}  {:>9}  {} ETH{flag}",
            deposit.commitment,
            deposit.status.as_str(),
            deposit.amount
        );
    }
    for withdrawal in &snapshot.withdrawals {
        let flag = if withdrawal.approximate { " (approx)" } else { "" };
        println!(
            "    withdrawal {}  {:?}  {} ETH → {}{flag}",
            withdrawal.nullifier, withdrawal.status, withdrawal.amount, withdrawal.recipient
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    // ── Step 0: Load config ────────────────────────────────────────────
    println!("\n=== Mixer E2E Test ===\n");
    let config = MixerConfig::from_env()?;
    let deposit_amount = Amount::parse_positive(
        &std::env::var("DEPOSIT_AMOUNT").unwrap_or_else(|_| "1.0".to_string()),
    )
    .context("DEPOSIT_AMOUNT must be a positive amount")?;

    let signer: PrivateKeySigner = config.chain.private_key.parse().context("invalid PRIVATE_KEY")?;
    let wallet_address = signer.address();
    let recipient: Recipient = match std::env::var("RECIPIENT_ADDRESS") {
        Ok(address) => address.parse().context("invalid RECIPIENT_ADDRESS")?,
        Err(_) => Recipient::new(wallet_address.0 .0)?,
    };

    println!("RPC:              {}", config.chain.rpc_url);
    println!("Mixer:            {}", config.chain.mixer_address);
    println!("Store:            {}", config.store_path.display());
    println!("Deposit amount:   {deposit_amount} ETH");
    println!("Recipient:        {recipient}\n");

    // ── Step 1: Connect ────────────────────────────────────────────────
    println!("[1] Wallet: {wallet_address}");
    let store = RecordStore::open(&config.store_path, &config.store_key)?;
    let ledger = Arc::new(AlloyLedger::connect(&config.chain)?);
    let mixer = Mixer::start(store, ledger, config.engine.clone()).await?;
    print_state(&mixer.state()?);

    // ── Step 2: Deposit ────────────────────────────────────────────────
    println!("[2] Depositing {deposit_amount} ETH...");
    let commitment = mixer.deposit(deposit_amount, recipient).await?;
    println!("    Commitment: {commitment}");
    let state = mixer.state()?;
    let status = state.deposit(&commitment).map(|d| d.status);
    ensure!(
        status == Some(CommitmentStatus::Confirmed),
        "deposit not confirmed (status {status:?})"
    );
    print_state(&state);

    // ── Step 3: Withdraw ───────────────────────────────────────────────
    println!("[3] Withdrawing to {recipient}...");
    let nullifier = mixer.withdraw(commitment).await?;
    println!("    Nullifier: {nullifier}");

    // ── Step 4: Verify ─────────────────────────────────────────────────
    println!("[4] Verifying local records...");
    let record = mixer
        .store()
        .get(&commitment)?
        .context("deposit record missing after withdrawal")?;
    ensure!(
        record.status == CommitmentStatus::Withdrawn,
        "deposit not marked withdrawn"
    );
    ensure!(record.secret.is_none(), "secret still present after withdrawal");
    println!("    Deposit withdrawn, secret erased");
    print_state(&mixer.state()?);

    mixer.shutdown().await;
    println!("\n=== E2E complete ===\n");
    Ok(())
}
