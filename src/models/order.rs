//! Order requests and fills exchanged with the execution collaborator.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{ExitReason, StrategyId};

/// Direction of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderAction {
    Buy,
    Sell,
}

impl OrderAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderAction::Buy => "BUY",
            OrderAction::Sell => "SELL",
        }
    }

    /// Signed quantity contribution of this action.
    pub fn signed(&self, quantity: Decimal) -> Decimal {
        match self {
            OrderAction::Buy => quantity,
            OrderAction::Sell => -quantity,
        }
    }
}

/// Order type requested from the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
}

/// Why the engine is sending an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderPurpose {
    /// Leg 1 of a new cycle
    Entry,
    /// Leg `n` (2-based) of an open cycle
    AddLeg(usize),
    /// Flatten the whole cycle
    Exit(ExitReason),
}

/// Order request emitted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub action: OrderAction,
    pub quantity: Decimal,
    pub order_type: OrderType,
    /// Reference price at decision time (limit price for limit orders)
    pub reference_price: Decimal,
    pub strategy: StrategyId,
    pub purpose: OrderPurpose,
}

/// Fill reported back by the execution collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Broker acknowledgement of a placed order.
///
/// Brokers that fill synchronously attach the fill; others deliver it later
/// as a separate notification.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
    pub fill: Option<Fill>,
}

/// Net broker position for a symbol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub quantity: Decimal,
    pub avg_cost: Decimal,
}

impl BrokerPosition {
    pub fn market_value(&self, price: Decimal) -> Decimal {
        self.quantity.abs() * price
    }
}
