//! Source adapters for regulatory announcement feeds and listings.
//!
//! This crate provides:
//! - [`adapters`]: the [`SourceAdapter`] contract and built-in feed/listing adapters
//! - [`AdapterRegistry`]: resolves the adapter for a configured source
//! - [`harness`]: timeout, panic isolation and item/age limits around every call
//! - [`fetch`]: HTTP fetching with transient/permanent error classification
//! - [`dates`]: lenient publication date parsing

pub mod adapters;
pub mod dates;
pub mod fetch;
pub mod harness;

pub use adapters::{AdapterOutput, AdapterRegistry, FeedAdapter, ListingAdapter, SourceAdapter};
pub use dates::parse_date;
pub use fetch::HttpFetcher;
pub use harness::{apply_limits, run_adapter};
