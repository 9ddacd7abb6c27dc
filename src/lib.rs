//! Client-side synchronization engine for a broker web terminal:
//! keeps candle series, quotes, and the open-position set of one
//! bridge account current over a push channel with REST polling
//! underneath.

pub mod aggregator;
pub mod bridge;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod history;
pub mod model;
pub mod positions;
pub mod scheduler;
pub mod session;
pub mod ticket;
