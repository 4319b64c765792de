// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The `orderpayment` subsystem.
//!
//! Orders waiting for payment are flipped to `CheckPayment` by the sentinel.
//! The executor compares the paid amount with the order total, the
//! persistent stage reserves stock and marks the order paid in one saga, the
//! reward stage splits the total between merchant and platform, and the
//! notification stage announces the outcome.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use conveyor_core::error::{PipelineError, Result};
use conveyor_core::executor::{Exec, Outcome};
use conveyor_core::handler::Handler;
use conveyor_core::notif::Notify;
use conveyor_core::persistent::Persistenter;
use conveyor_core::registry::{Subsystem, SubsystemContext};
use conveyor_core::reward::Rewarded;
use conveyor_core::saga::{SagaDispose, SagaStep};
use conveyor_core::sentinel::{CheckStateScanner, MemoryStateStore, StateRow, StateStore};

pub const SUBSYSTEM: &str = "orderpayment";

pub const WAIT_PAYMENT: &str = "WaitPayment";
pub const CHECK_PAYMENT: &str = "CheckPayment";
pub const PAID: &str = "Paid";

/// Account credited with the platform commission.
pub const PLATFORM_ACCOUNT: &str = "platform";

/// Commission rate: 2.5%
const COMMISSION_RATE: Decimal = Decimal::from_parts(25, 0, 0, false, 3);

/// Order columns the payment check reads.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderPayload {
    pub sku: String,
    pub quantity: u32,
    pub total: Decimal,
    pub paid: Decimal,
    pub merchant: String,
}

/// A settled (or rejected) payment.
#[derive(Debug, Clone)]
pub struct Payment {
    pub order_id: String,
    pub sku: String,
    pub quantity: u32,
    pub total: Decimal,
    pub paid: Decimal,
    pub merchant: String,
    pub checked_at: DateTime<Utc>,
}

/// Split `total` into the merchant share and the platform commission.
pub fn split_commission(total: Decimal) -> (Decimal, Decimal) {
    let fee = (total * COMMISSION_RATE).round_dp(2);
    (total - fee, fee)
}

/// Stock per SKU. Cloning shares the table.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    stock: Arc<Mutex<HashMap<String, u32>>>,
}

impl Inventory {
    pub fn new(stock: impl IntoIterator<Item = (String, u32)>) -> Self {
        Self {
            stock: Arc::new(Mutex::new(stock.into_iter().collect())),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, u32>>> {
        self.stock
            .lock()
            .map_err(|_| PipelineError::Store("inventory poisoned".into()))
    }

    pub fn take(&self, sku: &str, quantity: u32) -> Result<()> {
        let mut stock = self.lock()?;
        let available = stock
            .get_mut(sku)
            .ok_or_else(|| PipelineError::Data(format!("unknown sku {sku}")))?;
        if *available < quantity {
            return Err(PipelineError::Data(format!(
                "insufficient stock for {sku}: {available} < {quantity}"
            )));
        }
        *available -= quantity;
        Ok(())
    }

    pub fn put(&self, sku: &str, quantity: u32) -> Result<()> {
        *self.lock()?.entry(sku.to_string()).or_default() += quantity;
        Ok(())
    }

    pub fn available(&self, sku: &str) -> u32 {
        self.lock()
            .ok()
            .and_then(|stock| stock.get(sku).copied())
            .unwrap_or(0)
    }
}

/// Account balances credited by the reward stage.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    balances: Arc<Mutex<HashMap<String, Decimal>>>,
}

impl Ledger {
    pub fn credit(&self, account: &str, amount: Decimal) -> Result<()> {
        let mut balances = self
            .balances
            .lock()
            .map_err(|_| PipelineError::Store("ledger poisoned".into()))?;
        *balances.entry(account.to_string()).or_default() += amount;
        Ok(())
    }

    /// Balances sorted by account.
    pub fn balances(&self) -> Vec<(String, Decimal)> {
        let mut balances: Vec<_> = self
            .balances
            .lock()
            .map(|b| b.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default();
        balances.sort();
        balances
    }
}

/// Compares the paid amount with the order total.
pub struct PaymentCheck;

#[async_trait]
impl Exec<StateRow, Payment> for PaymentCheck {
    async fn exec(&self, row: StateRow) -> Outcome<StateRow, Payment> {
        let order: OrderPayload = match serde_json::from_value(row.payload.clone()) {
            Ok(order) => order,
            Err(e) => {
                warn!(order_id = %row.id, error = %e, "Malformed order, skipping");
                return Outcome::Unchanged;
            }
        };
        if order.quantity == 0 || order.total <= Decimal::ZERO {
            warn!(order_id = %row.id, total = %order.total, "Empty order, skipping");
            return Outcome::Unchanged;
        }

        if order.paid < order.total {
            debug!(order_id = %row.id, paid = %order.paid, total = %order.total, "Payment incomplete");
            return Outcome::Requeue(row);
        }

        let overpaid = order.paid > order.total;
        let payment = Payment {
            order_id: row.id,
            sku: order.sku,
            quantity: order.quantity,
            total: order.total,
            paid: order.paid,
            merchant: order.merchant,
            checked_at: Utc::now(),
        };
        if overpaid {
            let reason = format!("overpaid by {}", payment.paid - payment.total);
            return Outcome::Failed(payment, PipelineError::Data(reason));
        }
        Outcome::Persist(payment)
    }
}

/// Reserves stock and marks the order paid, as one saga.
pub struct PaymentCommit<S> {
    store: S,
    inventory: Inventory,
    timeout: Duration,
}

impl<S: StateStore + Clone + 'static> PaymentCommit<S> {
    pub fn new(store: S, inventory: Inventory) -> Self {
        Self {
            store,
            inventory,
            timeout: Duration::from_secs(5),
        }
    }

    fn saga(&self, payment: &Payment) -> SagaDispose {
        let (sku, quantity) = (payment.sku.clone(), payment.quantity);

        let reserve = {
            let inventory = self.inventory.clone();
            let sku = sku.clone();
            move || {
                let inventory = inventory.clone();
                let sku = sku.clone();
                async move { inventory.take(&sku, quantity) }
            }
        };
        let release = {
            let inventory = self.inventory.clone();
            move || {
                let inventory = inventory.clone();
                let sku = sku.clone();
                async move { inventory.put(&sku, quantity) }
            }
        };
        let mark_paid = {
            let store = self.store.clone();
            let order_id = payment.order_id.clone();
            move || {
                let store = store.clone();
                let order_id = order_id.clone();
                async move {
                    if store.compare_and_set(&order_id, CHECK_PAYMENT, PAID).await? {
                        Ok(())
                    } else {
                        Err(PipelineError::Data(format!(
                            "order {order_id} is no longer in {CHECK_PAYMENT}"
                        )))
                    }
                }
            }
        };

        SagaDispose::new("order-payment")
            .with_timeout(self.timeout)
            .step(SagaStep::new("reserve_stock", reserve).with_compensate(release))
            .step(SagaStep::new("mark_paid", mark_paid))
    }
}

#[async_trait]
impl<S: StateStore + Clone + 'static> Persistenter<Payment> for PaymentCommit<S> {
    async fn update(&self, payment: &Payment) -> Result<()> {
        self.saga(payment).execute().await
    }
}

/// Credits the merchant share and the platform commission.
pub struct MerchantPayout {
    ledger: Ledger,
}

#[async_trait]
impl Rewarded<Payment> for MerchantPayout {
    async fn update(&self, payment: &Payment) -> Result<()> {
        let (share, fee) = split_commission(payment.total);
        self.ledger.credit(&payment.merchant, share)?;
        self.ledger.credit(PLATFORM_ACCOUNT, fee)?;
        info!(
            order_id = %payment.order_id,
            merchant = %payment.merchant,
            share = %share,
            fee = %fee,
            "Payout credited"
        );
        Ok(())
    }
}

/// Announces payment outcomes.
pub struct PaymentNotice;

#[async_trait]
impl Notify<Payment> for PaymentNotice {
    async fn notify(&self, payment: &Payment) -> Result<()> {
        info!(
            order_id = %payment.order_id,
            merchant = %payment.merchant,
            total = %payment.total,
            paid = %payment.paid,
            checked_at = %payment.checked_at.to_rfc3339(),
            "Payment event"
        );
        Ok(())
    }
}

/// The `orderpayment` subsystem over any state store.
pub struct OrderPayment<S> {
    store: S,
    inventory: Inventory,
    ledger: Ledger,
    scan_interval: Duration,
    executors: usize,
}

impl<S: StateStore + Clone + 'static> OrderPayment<S> {
    pub fn new(store: S, inventory: Inventory, ledger: Ledger) -> Self {
        Self {
            store,
            inventory,
            ledger,
            scan_interval: Duration::from_secs(5),
            executors: 4,
        }
    }

    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }
}

#[async_trait]
impl<S: StateStore + Clone + 'static> Subsystem for OrderPayment<S> {
    fn name(&self) -> &str {
        SUBSYSTEM
    }

    async fn initialize(&self, ctx: &SubsystemContext) -> Result<Option<Handler>> {
        Handler::builder::<StateRow, Payment>(SUBSYSTEM)
            .context(ctx)
            .scanner(CheckStateScanner::new(self.store.clone(), WAIT_PAYMENT, CHECK_PAYMENT))
            .scan_interval(self.scan_interval)
            .exec(PaymentCheck)
            .executor_number(self.executors)
            .running_concurrent(64)
            .persistenter(PaymentCommit::new(self.store.clone(), self.inventory.clone()))
            .rewarded(MerchantPayout {
                ledger: self.ledger.clone(),
            })
            .notify(PaymentNotice)
            .initialize()
            .await
    }
}

/// Seed an in-memory order table.
pub fn seed_orders(store: &MemoryStateStore) {
    let orders = [
        ("ord-1001", "kbd-01", 1, "49.90", "49.90", "acme"),
        ("ord-1002", "mse-02", 2, "39.80", "39.80", "acme"),
        ("ord-1003", "mon-27", 1, "219.00", "219.00", "northwind"),
        // Underpaid: requeued until the retry budget runs out.
        ("ord-1004", "kbd-01", 1, "49.90", "20.00", "acme"),
        // Overpaid: notified for a manual refund, left for a later check.
        ("ord-1005", "mse-02", 1, "19.90", "25.00", "northwind"),
        // Out of stock: the saga fails before the order is marked paid.
        ("ord-1006", "mon-27", 5, "1095.00", "1095.00", "northwind"),
    ];
    for (id, sku, quantity, total, paid, merchant) in orders {
        store.insert(
            id,
            WAIT_PAYMENT,
            json!({
                "sku": sku,
                "quantity": quantity,
                "total": total,
                "paid": paid,
                "merchant": merchant,
            }),
        );
    }
}

/// Inventory matching [`seed_orders`].
pub fn seed_inventory() -> Inventory {
    Inventory::new([
        ("kbd-01".to_string(), 10),
        ("mse-02".to_string(), 10),
        ("mon-27".to_string(), 2),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn row(paid: &str) -> StateRow {
        StateRow {
            id: "ord-1".into(),
            state: CHECK_PAYMENT.into(),
            payload: json!({
                "sku": "kbd-01",
                "quantity": 1,
                "total": "49.90",
                "paid": paid,
                "merchant": "acme",
            }),
        }
    }

    #[test]
    fn test_split_commission() {
        assert_eq!(split_commission(dec("100.00")), (dec("97.50"), dec("2.50")));
        assert_eq!(split_commission(dec("49.90")), (dec("48.65"), dec("1.25")));
    }

    #[tokio::test]
    async fn test_payment_check_outcomes() {
        assert!(matches!(PaymentCheck.exec(row("49.90")).await, Outcome::Persist(_)));
        assert!(matches!(PaymentCheck.exec(row("10.00")).await, Outcome::Requeue(_)));
        assert!(matches!(
            PaymentCheck.exec(row("60.00")).await,
            Outcome::Failed(_, PipelineError::Data(_))
        ));

        let mut malformed = row("49.90");
        malformed.payload = json!({ "sku": "kbd-01" });
        assert!(matches!(PaymentCheck.exec(malformed).await, Outcome::Unchanged));
    }

    #[tokio::test]
    async fn test_commit_rolls_back_stock_when_order_moved() {
        let store = MemoryStateStore::new();
        store.insert("ord-1", WAIT_PAYMENT, json!({}));
        let inventory = seed_inventory();
        let commit = PaymentCommit::new(store.clone(), inventory.clone());
        let payment = Payment {
            order_id: "ord-1".into(),
            sku: "kbd-01".into(),
            quantity: 2,
            total: dec("99.80"),
            paid: dec("99.80"),
            merchant: "acme".into(),
            checked_at: Utc::now(),
        };

        // Still in WaitPayment, so the state CAS fails.
        assert!(commit.update(&payment).await.is_err());
        assert_eq!(inventory.available("kbd-01"), 10);

        store.set_state("ord-1", CHECK_PAYMENT).unwrap();
        commit.update(&payment).await.unwrap();
        assert_eq!(inventory.available("kbd-01"), 8);
        assert_eq!(store.state("ord-1").as_deref(), Some(PAID));
    }

    #[test]
    fn test_inventory_rejects_oversell() {
        let inventory = seed_inventory();
        assert!(matches!(inventory.take("mon-27", 3), Err(PipelineError::Data(_))));
        assert!(inventory.take("nope", 1).is_err());
        inventory.take("mon-27", 2).unwrap();
        assert_eq!(inventory.available("mon-27"), 0);
    }
}
