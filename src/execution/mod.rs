//! Execution collaborator seam.
//!
//! The trading core only decides what to order and when; placing orders,
//! quoting prices and reporting positions is the job of an `ExecutionClient`
//! (a live broker adapter or the in-memory `PaperBroker`).

mod paper;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::models::{BrokerPosition, OrderAck, OrderRequest};

pub use paper::PaperBroker;

#[async_trait]
pub trait ExecutionClient: Send + Sync {
    /// Send an order. `Err` means the order was not sent.
    ///
    /// Adapters that fill synchronously return the fill in the ack; others
    /// deliver it later through the session's fill path.
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck>;

    /// Latest price for a symbol.
    async fn market_price(&self, symbol: &str) -> Result<Decimal>;

    /// Net positions by symbol.
    async fn positions(&self) -> Result<HashMap<String, BrokerPosition>>;

    /// Market data observed by the session. Simulated adapters price fills
    /// from it; live adapters have their own feed.
    async fn on_market_price(&self, _symbol: &str, _price: Decimal) {}
}
