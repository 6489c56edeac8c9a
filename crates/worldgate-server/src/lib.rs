//! worldgate server library: a request-relay broker for game worlds.
//!
//! Stateless REST callers name a target world by `clientId`; the broker
//! forwards the operation over that world's authenticated WebSocket,
//! correlates the asynchronous reply by `requestId`, and answers the
//! HTTP call. The broker never interprets world payloads, never persists
//! in-flight requests, and routes every request to exactly one session.
//!
//! ## Core components
//!
//! * [`session::SessionRegistry`] - live sessions, supersession, sweep
//! * [`relay::PendingRequests`] - request/response correlation
//! * [`relay::dispatch`] - the per-endpoint HTTP-to-WebSocket helper
//! * [`ws`] - handshake, ping schedule, inbound pump, close path
//! * [`auth`] - credential/quota adapter and the daily reset job
//! * [`telemetry`] - structured log sink and Prometheus metrics

pub mod auth;
pub mod config;
pub mod relay;
pub mod rest;
pub mod server;
pub mod session;
pub mod telemetry;
pub mod ws;

pub use config::ServerConfig;
pub use server::{run, AppState};
