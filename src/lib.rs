pub mod block_cache;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod fees;
pub mod mock;
pub mod models;
pub mod prices;
pub mod query;
pub mod repository;
pub mod rpc;
pub mod scanner;
pub mod tokens;
