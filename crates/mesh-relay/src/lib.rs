// Numan Thabit 2025
//! Relay dispatcher colocated with one or more servicer nodes.
//!
//! Clients post signed relays; the dispatcher checks the relay's session
//! with the addressed servicer, runs the payload against the hosted chain,
//! signs the answer with the servicer's key and stores the relay until the
//! servicer acknowledges it.

pub mod auth;
pub mod chains;
pub mod clients;
pub mod codes;
pub mod config;
pub mod crypto;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod http;
pub mod keystore;
pub mod metrics;
pub mod node;
pub mod notify;
pub mod pool;
pub mod protocol;
pub mod relay;
pub mod relay_cache;
pub mod retry;
pub mod runtime;
pub mod servicer;
pub mod session;
pub mod signals;
