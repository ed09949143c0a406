pub mod actions;
pub mod database;
pub mod error;
pub mod events;
pub mod row_helpers;
pub mod schema;
pub mod sessions;
pub mod sink;

pub use database::Database;
pub use error::StoreError;
pub use sink::SqliteSink;
