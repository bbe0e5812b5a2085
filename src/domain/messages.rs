//! Client wire protocol.
//!
//! JSON text frames, tagged by `type`. Field names are camelCase on both
//! directions; the server never emits any other casing.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::price::{AssetClass, CanonicalPriceUpdate};

/// Client-to-server request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join the asset-class group (empty `symbols`) or per-symbol groups.
    Subscribe {
        #[serde(rename = "assetClass")]
        asset_class: String,
        #[serde(default)]
        symbols: Vec<String>,
    },
    /// Leave groups; unknown interests are ignored.
    Unsubscribe {
        #[serde(rename = "assetClass")]
        asset_class: String,
        #[serde(default)]
        symbols: Vec<String>,
    },
    /// Keepalive.
    Ping,
}

/// Server-to-client message.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage<'a> {
    /// One canonical update.
    PriceUpdate { data: &'a CanonicalPriceUpdate },
    /// Several updates from one poll, in normalization order.
    BatchPriceUpdate { data: Vec<&'a CanonicalPriceUpdate> },
    /// Subscribe acknowledged; lists the interests now held for the call.
    Subscribed {
        #[serde(rename = "assetClass")]
        asset_class: AssetClass,
        symbols: Vec<String>,
    },
    /// Unsubscribe acknowledged.
    Unsubscribed {
        #[serde(rename = "assetClass")]
        asset_class: AssetClass,
        symbols: Vec<String>,
    },
    Pong,
    /// Request could not be processed.
    Error { message: String },
}

impl ServerMessage<'_> {
    /// Serialize once into a frame that can be shared across recipients.
    pub fn to_frame(&self) -> Result<Arc<str>, serde_json::Error> {
        serde_json::to_string(self).map(Arc::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_subscribe() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"subscribe","assetClass":"STOCK","symbols":["AAPL","MSFT"]}"#,
        )
        .unwrap();

        assert_eq!(
            msg,
            ClientMessage::Subscribe {
                asset_class: "STOCK".to_string(),
                symbols: vec!["AAPL".to_string(), "MSFT".to_string()],
            }
        );
    }

    #[test]
    fn test_parse_subscribe_without_symbols() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","assetClass":"CRYPTO"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Subscribe { symbols, .. } if symbols.is_empty()));
    }

    #[test]
    fn test_price_update_frame_shape() {
        let update = CanonicalPriceUpdate {
            symbol: "BTCUSDT".to_string(),
            asset_class: AssetClass::Crypto,
            price: dec!(50000),
            previous_close: Some(dec!(48780.49)),
            change_percent_24h: dec!(2.5),
            volume: dec!(10),
            timestamp: Utc::now(),
            metadata: Default::default(),
        };

        let frame = ServerMessage::PriceUpdate { data: &update }.to_frame().unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "price_update");
        assert_eq!(value["data"]["symbol"], "BTCUSDT");
        assert_eq!(value["data"]["previousClose"], "48780.49");
    }

    #[test]
    fn test_ack_and_pong_frames() {
        let ack = ServerMessage::Subscribed {
            asset_class: AssetClass::Stock,
            symbols: vec!["AAPL".to_string()],
        }
        .to_frame()
        .unwrap();
        assert_eq!(&*ack, r#"{"type":"subscribed","assetClass":"STOCK","symbols":["AAPL"]}"#);

        assert_eq!(&*ServerMessage::Pong.to_frame().unwrap(), r#"{"type":"pong"}"#);
    }
}
