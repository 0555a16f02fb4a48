//! HTTP client for the networked artifact store.
//!
//! Talks to either a `polybuild-coordinator` instance or another peer's
//! ingress server; both expose the same `api/v1/cas/*` routes.

#[cfg(feature = "client")]
mod client;

#[cfg(feature = "client")]
pub use client::Client;
