//! In-memory paper broker used for replays and tests.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tracing::debug;

use super::ExecutionClient;
use crate::models::{BrokerPosition, Fill, OrderAck, OrderAction, OrderRequest, OrderType};

#[derive(Default)]
struct PaperState {
    prices: HashMap<String, Decimal>,
    positions: HashMap<String, BrokerPosition>,
    orders_placed: u64,
}

/// Fills marketable orders immediately at the last known price.
///
/// Limit orders that are not marketable are rejected rather than rested.
#[derive(Default)]
pub struct PaperBroker {
    state: RwLock<PaperState>,
}

impl PaperBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the last known price for a symbol.
    pub fn set_price(&self, symbol: &str, price: Decimal) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.prices.insert(symbol.to_string(), price);
    }

    pub fn orders_placed(&self) -> u64 {
        self.state.read().unwrap_or_else(PoisonError::into_inner).orders_placed
    }

    pub fn position(&self, symbol: &str) -> Option<BrokerPosition> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.positions.get(symbol).cloned()
    }
}

/// Apply a signed quantity change at `price` to a net position.
fn apply_to_position(position: &mut BrokerPosition, delta: Decimal, price: Decimal) {
    let current = position.quantity;
    let next = current + delta;

    if current.is_zero() || current.is_sign_positive() == delta.is_sign_positive() {
        let total = current.abs() + delta.abs();
        position.avg_cost = (current.abs() * position.avg_cost + delta.abs() * price) / total;
    } else if next.is_zero() {
        position.avg_cost = Decimal::ZERO;
    } else if next.is_sign_positive() != current.is_sign_positive() {
        // Flipped through flat
        position.avg_cost = price;
    }
    position.quantity = next;
}

#[async_trait]
impl ExecutionClient for PaperBroker {
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck> {
        if order.quantity <= Decimal::ZERO {
            bail!("Order quantity must be positive, got {}", order.quantity);
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let last = *state
            .prices
            .get(&order.symbol)
            .with_context(|| format!("No price for {}", order.symbol))?;

        let price = match order.order_type {
            OrderType::Market => last,
            OrderType::Limit => {
                let marketable = match order.action {
                    OrderAction::Buy => last <= order.reference_price,
                    OrderAction::Sell => last >= order.reference_price,
                };
                if !marketable {
                    bail!(
                        "Limit {} {} @ {} not marketable at {}",
                        order.action.as_str(),
                        order.symbol,
                        order.reference_price,
                        last
                    );
                }
                last
            }
        };

        state.orders_placed += 1;
        let order_id = format!("paper-{}", state.orders_placed);

        let position = state.positions.entry(order.symbol.clone()).or_default();
        apply_to_position(position, order.action.signed(order.quantity), price);
        if position.quantity.is_zero() {
            state.positions.remove(&order.symbol);
        }

        debug!(
            order_id = %order_id,
            symbol = %order.symbol,
            side = order.action.as_str(),
            quantity = %order.quantity,
            price = %price,
            "Paper order filled"
        );

        Ok(OrderAck {
            fill: Some(Fill {
                order_id: order_id.clone(),
                price,
                quantity: order.quantity,
                timestamp: Utc::now(),
            }),
            order_id,
        })
    }

    async fn market_price(&self, symbol: &str) -> Result<Decimal> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state
            .prices
            .get(symbol)
            .copied()
            .with_context(|| format!("No price for {}", symbol))
    }

    async fn positions(&self) -> Result<HashMap<String, BrokerPosition>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state.positions.clone())
    }

    async fn on_market_price(&self, symbol: &str, price: Decimal) {
        self.set_price(symbol, price);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderPurpose, StrategyId, StrategyKind};
    use rust_decimal_macros::dec;
    use tokio_test::assert_err;

    fn order(action: OrderAction, quantity: Decimal, order_type: OrderType, reference: Decimal) -> OrderRequest {
        OrderRequest {
            symbol: "AAPL".to_string(),
            action,
            quantity,
            order_type,
            reference_price: reference,
            strategy: StrategyId::new(StrategyKind::ContrarianDca, "AAPL"),
            purpose: OrderPurpose::Entry,
        }
    }

    #[tokio::test]
    async fn test_market_orders_track_average_cost() {
        let broker = PaperBroker::new();
        broker.set_price("AAPL", dec!(100));
        let ack = broker
            .place_order(&order(OrderAction::Buy, dec!(10), OrderType::Market, dec!(100)))
            .await
            .unwrap();
        assert_eq!(ack.order_id, "paper-1");
        assert_eq!(ack.fill.unwrap().price, dec!(100));

        broker.set_price("AAPL", dec!(90));
        broker
            .place_order(&order(OrderAction::Buy, dec!(10), OrderType::Market, dec!(90)))
            .await
            .unwrap();
        let position = broker.position("AAPL").unwrap();
        assert_eq!(position.quantity, dec!(20));
        assert_eq!(position.avg_cost, dec!(95));

        // Partial close keeps the cost basis
        broker
            .place_order(&order(OrderAction::Sell, dec!(5), OrderType::Market, dec!(90)))
            .await
            .unwrap();
        assert_eq!(broker.position("AAPL").unwrap().avg_cost, dec!(95));

        broker
            .place_order(&order(OrderAction::Sell, dec!(15), OrderType::Market, dec!(90)))
            .await
            .unwrap();
        assert!(broker.position("AAPL").is_none());
        assert!(broker.positions().await.unwrap().is_empty());
        assert_eq!(broker.orders_placed(), 4);
    }

    #[tokio::test]
    async fn test_short_position() {
        let broker = PaperBroker::new();
        broker.set_price("AAPL", dec!(50));
        broker
            .place_order(&order(OrderAction::Sell, dec!(4), OrderType::Market, dec!(50)))
            .await
            .unwrap();
        let position = broker.position("AAPL").unwrap();
        assert_eq!(position.quantity, dec!(-4));
        assert_eq!(position.avg_cost, dec!(50));
    }

    #[tokio::test]
    async fn test_rejections() {
        let broker = PaperBroker::new();
        assert_err!(
            broker
                .place_order(&order(OrderAction::Buy, dec!(1), OrderType::Market, dec!(1)))
                .await
        );
        assert_err!(broker.market_price("AAPL").await);

        broker.set_price("AAPL", dec!(100));
        assert!(broker
            .place_order(&order(OrderAction::Buy, dec!(0), OrderType::Market, dec!(100)))
            .await
            .is_err());
        assert!(broker
            .place_order(&order(OrderAction::Buy, dec!(1), OrderType::Limit, dec!(99)))
            .await
            .is_err());
        let ack = broker
            .place_order(&order(OrderAction::Buy, dec!(1), OrderType::Limit, dec!(101)))
            .await
            .unwrap();
        assert_eq!(ack.fill.unwrap().price, dec!(100));
        assert_eq!(broker.orders_placed(), 1);
    }
}
