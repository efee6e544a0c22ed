//! # mqtt-governance-proxy
//!
//! A store-and-forward governance proxy sitting between MQTT producers and
//! an upstream broker: topic allow-listing against wildcard patterns,
//! payload validation against JSON Schema or Protobuf, and quarantine of
//! anything rejected, all observable through structured logging, an audit
//! trail, and Prometheus metrics.
//!
//! ## Architecture
//!
//! Messages flow subscriber → [`pipeline::Pipeline`] → {publisher, quarantine}.
//! Configuration is loaded once at startup via [`config::parse_yaml`] and can
//! be hot-reloaded at message boundaries through [`pipeline::PipelineSnapshot`].

pub mod audit;
pub mod broker;
pub mod config;
pub mod database;
pub mod domain_types;
pub mod error;
pub mod message;
pub mod metrics;
pub mod pipeline;
pub mod quarantine;
pub mod rate_limit;
pub mod schema;
pub mod server;
pub mod topic;

pub use error::ProxyError;
