//! # yarp-core
//!
//! Core library of yarp, a multi-protocol reverse proxy. It forwards traffic
//! from configured endpoints to backend targets over four data planes:
//!
//! - opaque TCP forwarding (fixed target per listener)
//! - opaque UDP session forwarding (per-client virtual circuits over one
//!   datagram socket)
//! - HTTP routing by `Host` header
//! - HTTPS routing by TLS SNI, without terminating TLS
//!
//! ## Architecture
//!
//! - **App layer** ([`app`]): per-protocol connection handling — the
//!   bidirectional pipe, the peek-and-replay stream, the host and SNI
//!   sniffers, the router and the four listeners.
//! - **Service layer** ([`service`]): the statistics registry and its rate
//!   sampler.
//! - **System layer** ([`system`]): listener bind/spawn glue.
//! - **API layer** ([`api`]): the read-only statistics dashboard.
//!
//! The statistics registry is an explicit value created at process start and
//! handed to every listener; there are no global singletons.

pub mod api;
pub mod app;
pub mod config;
pub mod service;
pub mod system;
