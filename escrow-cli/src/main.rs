//! escrow: host process for the escrow engine
//!
//! `run` keeps the stale-resource reaper going until Ctrl-C, `simulate`
//! walks a funded trade through the lifecycle on a manual clock, and
//! `show-config` prints the effective settings.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Duration;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

use escrow_engine::{
    admin::AdjustBalanceRequest,
    dispute::{DisputeResolution, RaiseDisputeRequest, ResolveDisputeRequest},
    logging::init_tracing,
    models::{Actor, Role, TransactionStatus},
    time::ManualTimeSource,
    transaction_manager::{CreateTransactionRequest, TransitionRequest},
    EscrowNode, EscrowSettings,
};

/// Escrow marketplace engine
#[derive(Parser, Debug)]
#[command(name = "escrow")]
#[command(about = "Run and inspect the escrow settlement engine")]
struct Args {
    /// Settings file (TOML); ESCROW__* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the node and run the reaper until interrupted
    Run,
    /// Play trade scenarios on a manual clock and print the balances
    Simulate {
        /// Transaction amount in minor units
        #[arg(long, default_value = "500000")]
        amount: i64,

        /// Override the platform fee, in percent
        #[arg(long)]
        fee_percent: Option<Decimal>,
    },
    /// Print the effective settings as JSON
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log).context("failed to initialise logging")?;

    let settings =
        EscrowSettings::load(args.config.as_deref()).context("failed to load settings")?;

    match args.command {
        Command::Run => run(settings).await,
        Command::Simulate {
            amount,
            fee_percent,
        } => {
            let mut settings = settings;
            if let Some(fee) = fee_percent {
                settings.platform.fee_percent = fee;
            }
            simulate(settings, amount).await
        }
        Command::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

async fn run(settings: EscrowSettings) -> Result<()> {
    let node = EscrowNode::new(settings).context("failed to start escrow node")?;
    let reaper = node.start_reaper();

    info!("Escrow node running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    node.shutdown().await?;
    reaper.await.context("reaper task panicked")?;
    Ok(())
}

async fn simulate(settings: EscrowSettings, amount: i64) -> Result<()> {
    let clock = Arc::new(ManualTimeSource::default());
    let node = EscrowNode::with_time_source(settings, clock.clone())?;

    let admin = Actor::new(Uuid::new_v4(), Role::Admin);
    let buyer = Actor::member(Uuid::new_v4());
    let seller = Actor::member(Uuid::new_v4());

    node.admin()
        .adjust_balance(AdjustBalanceRequest {
            request_id: Uuid::new_v4(),
            actor: admin,
            user_id: buyer.user_id,
            amount: amount * 2,
            note: "simulation top-up".to_string(),
        })
        .await?;

    // Happy path: funded, shipped, window elapses without a dispute.
    let tx = node
        .transactions()
        .create_transaction(CreateTransactionRequest {
            buyer,
            seller_id: seller.user_id,
            product_name: "Simulated item".to_string(),
            amount,
            category: "simulation".to_string(),
            dispute_window_hours: None,
        })
        .await?;
    node.transactions()
        .fund_transaction(TransitionRequest::new(tx.id, TransactionStatus::Pending, buyer))
        .await?;
    node.transactions()
        .mark_shipped(TransitionRequest::new(tx.id, TransactionStatus::Deposited, seller))
        .await?;
    clock.advance(Duration::hours(i64::from(tx.dispute_window_hours) + 1));
    let report = node.reaper().run_once().await;
    println!("{} -> {:?}", tx.code, report);

    // Dispute path: refunded by the arbiter.
    let disputed = node
        .transactions()
        .create_transaction(CreateTransactionRequest {
            buyer,
            seller_id: seller.user_id,
            product_name: "Simulated item".to_string(),
            amount,
            category: "simulation".to_string(),
            dispute_window_hours: None,
        })
        .await?;
    node.transactions()
        .fund_transaction(TransitionRequest::new(disputed.id, TransactionStatus::Pending, buyer))
        .await?;
    node.disputes()
        .raise_dispute(RaiseDisputeRequest {
            transaction_id: disputed.id,
            expected_status: TransactionStatus::Deposited,
            actor: buyer,
            reason: "seller unresponsive".to_string(),
        })
        .await?;
    node.disputes()
        .resolve_dispute(ResolveDisputeRequest {
            transaction_id: disputed.id,
            actor: admin,
            resolution: DisputeResolution::RefundBuyer,
            note: None,
        })
        .await?;

    // Stale pending: never funded, reaped after the timeout.
    let stale = node
        .transactions()
        .create_transaction(CreateTransactionRequest {
            buyer,
            seller_id: seller.user_id,
            product_name: "Forgotten item".to_string(),
            amount,
            category: "simulation".to_string(),
            dispute_window_hours: None,
        })
        .await?;
    clock.advance(Duration::minutes(node.settings().reaper.pending_timeout_minutes + 1));
    let report = node.reaper().run_once().await;
    println!("{} -> {:?}", stale.code, report);

    for (label, id) in [("happy", tx.id), ("disputed", disputed.id), ("stale", stale.id)] {
        let info = node.get_transaction_info(id).await?;
        println!(
            "{:<9} {} status={} log_entries={}",
            label,
            info.transaction.code,
            info.transaction.status,
            info.logs.len()
        );
    }
    println!("buyer balance:    {}", node.get_user_balance(buyer.user_id).await?);
    println!("seller balance:   {}", node.get_user_balance(seller.user_id).await?);
    println!("platform revenue: {}", node.ledger().platform_revenue().await);

    let health = node.health_check().await?;
    println!("ledger consistent: {}", health.ledger.is_consistent());

    node.shutdown().await?;
    Ok(())
}
