//! Launchgate - local gateway and supervisor for a desktop launcher
//!
//! This library provides the two halves of the launcher's network core:
//! - A gateway process serving a fixed family of virtual hostnames over
//!   HTTP and TLS, preferring bundled static assets and transparently
//!   falling back to the real remote origin
//! - A supervisor that spawns the gateway process, scrapes its output for
//!   a readiness marker, enforces a startup timeout, and relays status
//!   and error events to the host UI over a small control API

pub mod config;
pub mod control;
pub mod error;
pub mod router;
pub mod server;
pub mod supervisor;
pub mod tls;
pub mod upstream;
