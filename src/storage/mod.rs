pub mod collections;
pub mod engine;
pub mod fail_point;

pub use collections::{CollectionData, Collections};
pub use engine::{Store, StoreStats};
pub use fail_point::{FailCommand, FailPoint, FailPointError, FailPointMode, FailPoints};
