pub mod abort;
pub mod amount;
pub mod assertions;
pub mod bitcoin_rpc;
pub mod chain;
pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod lightning;
pub mod logging;
pub mod plugin;
pub mod price;
pub mod service;
pub mod storage;
pub mod swap;
