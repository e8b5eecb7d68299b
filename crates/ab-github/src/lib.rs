//! GitHub integration for gitops-autobot.
//!
//! `api` defines the abstract capability surface the pipeline stages depend
//! on, `client` implements it with a GitHub App identity over octocrab
//! (GraphQL for pull requests and mutations, REST for file contents), and
//! `cached` wraps any implementation in the shared TTL cache with key
//! invalidation on mutations.

pub mod api;
pub mod cached;
pub mod client;
pub mod types;

pub use api::{GithubApi, GithubError};
