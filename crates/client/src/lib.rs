//! Client code for lumen.
//!
//! This crate provides the HTTP fetch pipeline, request registries, scroll
//! pacing and the image loader that ties them to the caches in `lumen-core`.

pub mod fetch;
pub mod loader;
pub mod pacing;
pub mod registry;
pub mod request;

pub use fetch::{FetchConfig, FetchSource, FetchedResource, Fetcher, HttpFetcher, canonicalize, parse_cache_headers};
pub use loader::{Decoder, ImageLoader, InflightFetch, Load, LoadReceiver, LoaderOptions, Ticket};
pub use pacing::{PauseOnScroll, ScrollPacer, ScrollState, Submission};
pub use registry::{InflightRegistry, SlotRegistry};
pub use request::{CancelFlag, Cancellable, RequestId};
