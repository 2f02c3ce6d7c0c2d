pub mod collection;
pub mod database;

pub use collection::{Collection, CollectionOptions};
pub use database::Database;
