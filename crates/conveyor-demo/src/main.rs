// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Conveyor Demo - order payment pipeline
//!
//! Runs the `orderpayment` subsystem until Ctrl+C.
//!
//! Orders come from PostgreSQL when `DEMO_DATABASE_URL` is set (table
//! `DEMO_ORDERS_TABLE`, default `orders`, with `id` and `status` columns),
//! otherwise from a seeded in-memory table.

mod orders;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use conveyor_core::config::Config;
use conveyor_core::registry::Subsystem;
use conveyor_core::runtime::SchedulerRuntime;
use conveyor_core::sentinel::{MemoryStateStore, PgStateStore};

use orders::{Ledger, OrderPayment, SUBSYSTEM, seed_inventory, seed_orders};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conveyor_core=info,conveyor_demo=info".into()),
        )
        .init();

    info!("Starting Conveyor Demo");

    let mut config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;
    if config.enabled_subsystems.is_empty() {
        config.enabled_subsystems.push(SUBSYSTEM.to_string());
    }

    info!(
        subsystems = ?config.enabled_subsystems,
        redis = config.redis_url.is_some(),
        lock_ttl_secs = config.lock_ttl.map(|t| t.as_secs()),
        "Configuration loaded"
    );

    let ledger = Ledger::default();
    let inventory = seed_inventory();
    let scan_interval = Duration::from_secs(2);

    let subsystem: Arc<dyn Subsystem> = match std::env::var("DEMO_DATABASE_URL") {
        Ok(url) => {
            info!("Connecting to database...");
            let pool = PgPoolOptions::new().max_connections(5).connect(&url).await?;
            let table = std::env::var("DEMO_ORDERS_TABLE").unwrap_or_else(|_| "orders".to_string());
            let store = PgStateStore::new(pool, &table, "id", "status")?;
            info!(table = %table, "Using PostgreSQL order table");
            Arc::new(
                OrderPayment::new(store, inventory.clone(), ledger.clone())
                    .with_scan_interval(scan_interval),
            )
        }
        Err(_) => {
            let store = MemoryStateStore::new();
            seed_orders(&store);
            info!("Using seeded in-memory order table");
            Arc::new(
                OrderPayment::new(store, inventory.clone(), ledger.clone())
                    .with_scan_interval(scan_interval),
            )
        }
    };

    let runtime = SchedulerRuntime::builder()
        .config(config)
        .subsystem(subsystem)
        .build()?
        .start()
        .await?;

    info!("Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await;

    for (account, balance) in ledger.balances() {
        info!(account = %account, balance = %balance, "Final balance");
    }
    info!("Shutdown complete");
    Ok(())
}
