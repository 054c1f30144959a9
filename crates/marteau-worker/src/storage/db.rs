//! Database connection and initialization.

pub use marteau_core::db::DatabaseError;

marteau_core::define_database!(Database, "Database migrations complete");
