mod database;
mod versioned;

pub use database::{
    Database, FromRow, NativeDatabase, Row, SqlValue, StorageError, ToSql, open_database,
};
pub use versioned::{StoreError, VersionedRecord, VersionedStore};
