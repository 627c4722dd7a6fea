//! Standalone resolver for signed operator/account/activation claims: a
//! durable store fronted by an HTTP API, kept in sync with peers over a
//! `$SYS`-rooted pub/sub fabric.

pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod decoded_view;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod telemetry;
pub mod tls;
pub mod validation;
