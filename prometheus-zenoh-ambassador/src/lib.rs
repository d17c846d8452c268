//! Prometheus ambassador that tunnels scrapes and remote-write payloads over Zenoh.
//!
//! Prometheus talks plain HTTP on both ends; the ambassador carries the traffic
//! across a Zenoh network in between.
//!
//! # Architecture
//!
//! ```text
//!  Pull path
//! ┌────────────┐ GET /proxy ┌─────────────┐  query   ┌────────────────┐  GET  ┌──────────┐
//! │ Prometheus │──────────> │ ScrapeProxy │ ───────> │ ExporterResp.  │ ────> │ Exporter │
//! └────────────┘            └─────────────┘  (Zenoh) └────────────────┘       └──────────┘
//!
//!  Push path
//! ┌────────────┐ POST /api/v1/write ┌─────────────┐  put   ┌────────────────┐ POST ┌──────────┐
//! │ Prometheus │──────────────────> │   Ingress   │ ─────> │ RemoteWriteRly │ ───> │ Upstream │
//! └────────────┘                    └─────────────┘ (Zenoh)└────────────────┘      └──────────┘
//! ```
//!
//! # Usage
//!
//! ```bash
//! prometheus-zenoh-ambassador --config ambassador.json5
//! ```
//!
//! See [`config::AmbassadorConfig`] for configuration options.

pub mod bus;
pub mod config;
pub mod http;
pub mod metrics;
pub mod proxy;
pub mod remote_write;
pub mod responder;

pub use bus::{Bus, BusError, FatalCondition, FatalReporter, SharedBus, ZenohBus};
pub use config::{AmbassadorConfig, ConfigError};
pub use http::{AppState, HttpServer, create_router};
pub use metrics::{AmbassadorMetrics, SharedMetrics};
pub use proxy::{ProxyError, ScrapeProxy, SharedProxy};
pub use remote_write::{
    IngestError, RelayError, RemoteWriteIngress, RemoteWriteRelay, SharedIngress,
};
pub use responder::{ExporterResponder, ResponderError};
