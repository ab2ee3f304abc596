//! Upstream feed frame model.
//!
//! Inbound WebSocket frames are binary protobuf. The message shapes are
//! declared here with prost derives; there is no codegen step. Only the
//! fields the engine consumes are modeled; unknown fields are skipped
//! by the decoder, so richer upstream frames decode cleanly.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// FeedResponse is the top-level frame: one entry per instrument.
#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
pub struct FeedResponse {
    #[prost(map = "string, message", tag = "1")]
    pub feeds: HashMap<String, FeedBody>,
}

// FeedBody carries either a bare LTPC quote or a full feed with a
// market/index branch.
#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
pub struct FeedBody {
    #[prost(message, optional, tag = "1")]
    pub ltpc: Option<Ltpc>,
    #[serde(rename = "fullFeed")]
    #[prost(message, optional, tag = "2")]
    pub full_feed: Option<FullFeed>,
}

#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
pub struct FullFeed {
    #[serde(rename = "marketFF")]
    #[prost(message, optional, tag = "1")]
    pub market_ff: Option<MarketFullFeed>,
    #[serde(rename = "indexFF")]
    #[prost(message, optional, tag = "2")]
    pub index_ff: Option<IndexFullFeed>,
}

#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
pub struct MarketFullFeed {
    #[prost(message, optional, tag = "1")]
    pub ltpc: Option<Ltpc>,
}

#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
pub struct IndexFullFeed {
    #[prost(message, optional, tag = "1")]
    pub ltpc: Option<Ltpc>,
}

// Ltpc is the last-traded-price block: price, trade time, quantity and
// the previous close.
#[derive(Clone, PartialEq, Serialize, Deserialize, ::prost::Message)]
pub struct Ltpc {
    #[prost(double, tag = "1")]
    pub ltp: f64,
    #[prost(int64, tag = "2")]
    pub ltt: i64,
    #[prost(int64, tag = "3")]
    pub ltq: i64,
    #[prost(double, tag = "4")]
    pub cp: f64,
}

impl FeedBody {
    fn ltpc_block(&self) -> Option<&Ltpc> {
        if let Some(full) = &self.full_feed {
            if let Some(market) = &full.market_ff {
                if market.ltpc.is_some() {
                    return market.ltpc.as_ref();
                }
            }
            if let Some(index) = &full.index_ff {
                if index.ltpc.is_some() {
                    return index.ltpc.as_ref();
                }
            }
        }
        self.ltpc.as_ref()
    }

    // Last traded price: market branch wins over index, full feed over
    // the bare quote. None when the frame carries no finite price.
    pub fn ltp(&self) -> Option<f64> {
        self.ltpc_block()
            .map(|l| l.ltp)
            .filter(|ltp| ltp.is_finite())
    }

    // Previous close, when the frame carries one.
    pub fn close(&self) -> Option<f64> {
        self.ltpc_block()
            .map(|l| l.cp)
            .filter(|cp| cp.is_finite() && *cp != 0.0)
    }

    // A body carrying just a price, used by the testing-only tick
    // injection path.
    pub fn from_ltp(ltp: f64, close: Option<f64>) -> Self {
        FeedBody {
            ltpc: Some(Ltpc {
                ltp,
                ltt: 0,
                ltq: 0,
                cp: close.unwrap_or(0.0),
            }),
            full_feed: None,
        }
    }
}
