pub mod manager;
pub mod migrate;

pub use manager::{DatabaseError, DatabaseManager};
pub use migrate::{MigrationError, MigrationReport, PolicyMigrator};
