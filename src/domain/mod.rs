//! Domain layer types and invariants.

pub mod dates;
pub mod error;
pub mod rows;
pub mod targets;

pub use dates::DateRange;
pub use error::ValidationError;
pub use rows::Row;
pub use targets::{Target, TargetInput, TargetKind};
