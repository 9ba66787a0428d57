pub mod client;

pub use client::{
    ClobCredentials, ClobOrderResponse, MarketInfo, MarketParams, PolymarketClient, RawActivity,
};
