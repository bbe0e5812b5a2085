//! Normalization & Derivation - Raw Tick to Canonical Update
//!
//! Pure functions. Every provider's tick goes through `normalize`, which
//! produces the uniform `CanonicalPriceUpdate` shape and fills in the
//! fields a source omits:
//!
//! - previous close from 24h percent change (streaming sources)
//! - 24h percent change from previous close (quote sources)
//!
//! A field that cannot be derived is left empty; the update is still
//! produced, partial data beats a dropped tick.

use rust_decimal::Decimal;
use serde_json::Value;

use super::price::{CanonicalPriceUpdate, PriceTick};

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// Reasons a tick is rejected outright at the normalization boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizeError {
    #[error("tick from {provider} has an empty symbol")]
    EmptySymbol { provider: String },
    #[error("tick for {symbol} has a negative volume")]
    NegativeVolume { symbol: String },
}

/// Back-compute the previous close from the current price and 24h change.
///
/// - `change != 0` and `price > 0`: `price / (1 + change / 100)`
/// - `change == 0` and `price > 0`: exactly `price`
/// - `price <= 0`: `None`
///
/// Also `None` when `1 + change / 100` is not positive (a change of -100% or
/// worse has no meaningful previous close) or the division overflows.
pub fn derive_previous_close(price: Decimal, change_percent: Decimal) -> Option<Decimal> {
    if price <= Decimal::ZERO {
        return None;
    }
    if change_percent.is_zero() {
        return Some(price);
    }

    let factor = Decimal::ONE + change_percent / HUNDRED;
    if factor <= Decimal::ZERO {
        return None;
    }
    price.checked_div(factor)
}

/// Forward formula: percent change of `price` relative to `previous_close`.
///
/// `None` when the previous close is not positive.
pub fn change_percent(price: Decimal, previous_close: Decimal) -> Option<Decimal> {
    if previous_close <= Decimal::ZERO {
        return None;
    }
    (price - previous_close)
        .checked_div(previous_close)
        .and_then(|ratio| ratio.checked_mul(HUNDRED))
}

/// Convert one raw tick into the canonical update.
///
/// Field precedence when a source reports both previous close and percent
/// change: the previous close wins and the change is recomputed from it, so
/// the invariant between the two always holds. The source's own figure is
/// kept in `metadata.sourceChangePercent`.
pub fn normalize(tick: PriceTick) -> Result<CanonicalPriceUpdate, NormalizeError> {
    let symbol = tick.symbol.trim().to_ascii_uppercase();
    if symbol.is_empty() {
        return Err(NormalizeError::EmptySymbol {
            provider: tick.provider,
        });
    }

    let volume = tick.volume.unwrap_or(Decimal::ZERO);
    if volume < Decimal::ZERO {
        return Err(NormalizeError::NegativeVolume { symbol });
    }

    let source_close = tick.previous_close.filter(|close| *close > Decimal::ZERO);

    let (previous_close, change) = match (source_close, tick.change_percent_24h) {
        (Some(close), reported) => {
            let change = change_percent(tick.price, close)
                .or(reported)
                .unwrap_or(Decimal::ZERO);
            (Some(close), change)
        }
        (None, Some(pct)) => (derive_previous_close(tick.price, pct), pct),
        (None, None) => (None, Decimal::ZERO),
    };

    let mut metadata = tick.extras;
    metadata.insert("provider".to_string(), Value::String(tick.provider));
    if let (Some(_), Some(reported)) = (source_close, tick.change_percent_24h) {
        metadata.insert(
            "sourceChangePercent".to_string(),
            Value::String(reported.normalize().to_string()),
        );
    }

    Ok(CanonicalPriceUpdate {
        symbol,
        asset_class: tick.asset_class,
        price: tick.price,
        previous_close,
        change_percent_24h: change,
        volume,
        timestamp: tick.exchange_time.unwrap_or(tick.received_at),
        metadata,
    })
}
