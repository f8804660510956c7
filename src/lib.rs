//! Gravitygate - A remote-access proxy for a locally running AI-assistant backend
//!
//! This library provides a multi-port reverse proxy that:
//! - Locates the backend's RPC port and auth token from the process table
//! - Forwards UI traffic and rewrites the embedded client configuration so
//!   remote browsers talk back through the proxy
//! - Streams RPC responses while capturing them for passive observers
//! - Pushes captured traffic and sent messages to observers over server-sent events
//! - Probes backend liveness and runs a stabilize-then-restart recovery
//! - Uses connection pooling for efficient backend communication

pub mod admin;
pub mod assets;
pub mod config;
pub mod context;
pub mod control;
pub mod discovery;
pub mod error;
pub mod health;
pub mod hub;
pub mod pool;
pub mod proxy;
pub mod rewrite;
pub mod routes;
