pub mod concern;
pub mod document;
pub mod error;

pub use concern::{Acknowledgment, ReadConcern, WriteConcern};
pub use document::{Document, ID_FIELD};
pub use error::{DbError, ErrorLabel, Result};
