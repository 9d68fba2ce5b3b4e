pub mod models;
mod queries;
mod sqlite;

pub use queries::PairResultRow;
pub use sqlite::Database;
