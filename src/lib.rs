//! Watch containers for newer registry images and recreate them in place,
//! rolling back when the replacement does not come up healthy.
pub mod config;
pub mod digest;
pub mod error;
pub mod jobs;
pub mod outbound;
pub mod recreate;
pub mod runtime;
pub mod scan;
pub mod scheduler;
pub mod service;
pub mod worker;

pub use error::{SentinelError, StoreError};
pub use service::Sentinel;
