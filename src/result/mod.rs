mod result;

pub use result::{DeleteResult, InsertManyResult, InsertOneResult, UpdateResult};
