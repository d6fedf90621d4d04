mod sqlite;

pub use sqlite::Storage;
