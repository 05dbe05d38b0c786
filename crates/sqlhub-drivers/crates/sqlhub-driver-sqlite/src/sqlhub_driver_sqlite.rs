//! SQLite driver for SQLHub

mod connection;
mod driver;
mod schema;

pub use connection::{SqliteCancelHandle, SqliteConnection};
pub use driver::SqliteDriver;
