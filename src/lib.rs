pub mod auth;
pub mod bus;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod kv;
pub mod log;
pub mod metrics;
pub mod ratelimit;
pub mod server;
pub mod services;
pub mod span;
pub mod websocket;
