//! Strategy identity and ladder geometry.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::OrderAction;

/// The closed set of ladder strategies.
///
/// Kinds differ only in leg-trigger geometry and zone anchoring; the cycle
/// mechanics are shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Counter-direction DCA: buys dips below the entry
    #[serde(alias = "cdm", alias = "CDM")]
    ContrarianDca,
    /// With-direction DCA: pyramids into strength above the entry
    #[serde(alias = "wdm", alias = "WDM")]
    WeightedDca,
    /// Zone recovery ladder anchored at a zone center, long side
    #[serde(alias = "zrm", alias = "ZRM")]
    ZeroRiskMartingale,
    /// Inverse zone recovery ladder anchored at a zone center, short side
    #[serde(alias = "izrm", alias = "IZRM")]
    InverseZeroRiskMartingale,
}

/// Side of the cycle's net position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

/// Which way price must travel for the next leg to trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegStep {
    /// Against the position (classic averaging down)
    Adverse,
    /// With the position (pyramiding)
    Favorable,
}

/// What the trigger distances are measured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnchorMode {
    /// Fill price of leg 1
    EntryFill,
    /// Configured zone center (falls back to the entry fill when unset)
    ZoneCenter,
}

/// Static ladder shape of a strategy kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LadderGeometry {
    pub direction: Direction,
    pub step: LegStep,
    pub anchor: AnchorMode,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 4] = [
        StrategyKind::ContrarianDca,
        StrategyKind::WeightedDca,
        StrategyKind::ZeroRiskMartingale,
        StrategyKind::InverseZeroRiskMartingale,
    ];

    /// Lookup table from kind to ladder geometry.
    pub fn geometry(&self) -> LadderGeometry {
        use AnchorMode::*;
        use Direction::*;
        use LegStep::*;

        let (direction, step, anchor) = match self {
            Self::ContrarianDca => (Long, Adverse, EntryFill),
            Self::WeightedDca => (Long, Favorable, EntryFill),
            Self::ZeroRiskMartingale => (Long, Adverse, ZoneCenter),
            Self::InverseZeroRiskMartingale => (Short, Adverse, ZoneCenter),
        };
        LadderGeometry { direction, step, anchor }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::ContrarianDca => "cdm",
            Self::WeightedDca => "wdm",
            Self::ZeroRiskMartingale => "zrm",
            Self::InverseZeroRiskMartingale => "izrm",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Error for a strategy kind string outside the closed set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown strategy kind '{0}' (expected cdm, wdm, zrm or izrm)")]
pub struct UnknownStrategyKind(pub String);

impl FromStr for StrategyKind {
    type Err = UnknownStrategyKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cdm" | "contrarian_dca" => Ok(Self::ContrarianDca),
            "wdm" | "weighted_dca" => Ok(Self::WeightedDca),
            "zrm" | "zero_risk_martingale" => Ok(Self::ZeroRiskMartingale),
            "izrm" | "inverse_zero_risk_martingale" => Ok(Self::InverseZeroRiskMartingale),
            other => Err(UnknownStrategyKind(other.to_string())),
        }
    }
}

impl Direction {
    /// +1 for long, -1 for short.
    pub fn sign(&self) -> Decimal {
        match self {
            Direction::Long => Decimal::ONE,
            Direction::Short => Decimal::NEGATIVE_ONE,
        }
    }

    pub fn entry_action(&self) -> OrderAction {
        match self {
            Direction::Long => OrderAction::Buy,
            Direction::Short => OrderAction::Sell,
        }
    }

    pub fn exit_action(&self) -> OrderAction {
        match self {
            Direction::Long => OrderAction::Sell,
            Direction::Short => OrderAction::Buy,
        }
    }
}

impl LadderGeometry {
    /// Sign of the price move that triggers the next leg.
    pub fn trigger_sign(&self) -> Decimal {
        match self.step {
            LegStep::Adverse => -self.direction.sign(),
            LegStep::Favorable => self.direction.sign(),
        }
    }

    /// Price at which a leg with the given cumulative distance triggers.
    pub fn trigger_price(&self, anchor: Decimal, cumulative_distance_pct: Decimal) -> Decimal {
        anchor * (Decimal::ONE + self.trigger_sign() * cumulative_distance_pct / Decimal::ONE_HUNDRED)
    }

    /// Whether `price` has reached `trigger`.
    pub fn is_triggered(&self, price: Decimal, trigger: Decimal) -> bool {
        if self.trigger_sign().is_sign_negative() {
            price <= trigger
        } else {
            price >= trigger
        }
    }
}

/// Identity of a strategy instance: one kind trading one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StrategyId {
    pub kind: StrategyKind,
    pub symbol: String,
}

impl StrategyId {
    pub fn new(kind: StrategyKind, symbol: impl Into<String>) -> Self {
        Self {
            kind,
            symbol: symbol.into(),
        }
    }
}

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.kind, self.symbol)
    }
}
