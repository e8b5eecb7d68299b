//! Core library for gitops-autobot: configuration, the remote-value cache,
//! the commit-annotation grammar, and the git checkout that change producers
//! work against.

pub mod annotations;
pub mod cache;
pub mod checkout;
pub mod config;
