//! Upstream source-control API: the fetch contract and its GitHub implementation.

pub mod api_types;
pub mod client;
pub mod fetcher;
pub mod types;

pub use client::GithubFetcher;
pub use fetcher::{FetchError, FetchOutcome, RepoFetcher};
pub use types::{RateLimit, RepoItem};
