//! Services composed from the cache and domain layers.

pub mod error;
pub mod fanout;
pub mod query;
pub mod relay;
pub mod response;
pub mod status;
