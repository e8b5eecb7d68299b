//! The gitops-autobot reconciliation daemon.
//!
//! `bot` drives the tick loop; `creator`, `reviewer`, and `merger` are the
//! per-tick pipeline stages; `http` is the trigger/health surface.

pub mod bot;
pub mod creator;
pub mod http;
pub mod merger;
pub mod reviewer;
pub mod shutdown;
