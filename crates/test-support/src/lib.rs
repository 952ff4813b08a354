pub mod fixtures {
    use std::fs;
    use std::io;
    use std::path::{Path, PathBuf};

    pub fn root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join("..")
            .join("tests")
            .join("fixtures")
    }

    pub fn path(relative: impl AsRef<Path>) -> PathBuf {
        root().join(relative.as_ref())
    }

    pub fn read(relative: impl AsRef<Path>) -> io::Result<String> {
        fs::read_to_string(path(relative))
    }

    /// A disable-list payload as served from `remote-disable/remote-disable.json`.
    pub fn remote_disable(name: &str) -> String {
        read_or_panic(Path::new("remote-disable").join(name))
    }

    pub fn config(name: &str) -> String {
        read_or_panic(Path::new("config").join(name))
    }

    fn read_or_panic(relative: impl AsRef<Path>) -> String {
        let relative = relative.as_ref();
        read(relative).unwrap_or_else(|error| {
            panic!(
                "failed to read fixture {}: {error}",
                relative.to_string_lossy()
            )
        })
    }
}

pub mod store {
    use std::sync::Arc;

    use gocp_storage::{
        Database, FromRow, NativeDatabase, StorageError, ToSql, VersionedStore, open_database,
    };
    use tempfile::TempDir;

    /// A versioned store backed by a fresh SQLite file. Keep the `TempDir`
    /// alive for as long as the store is used.
    pub async fn temp_store() -> (VersionedStore<NativeDatabase>, TempDir) {
        let dir = TempDir::new().expect("failed to create temp dir");
        let db = open_database(&dir.path().join("gocp.db"))
            .await
            .expect("failed to open database");
        (VersionedStore::new(Arc::new(db)), dir)
    }

    /// A database whose every call fails, for exercising I/O error paths.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct UnavailableDatabase;

    impl UnavailableDatabase {
        pub fn store() -> VersionedStore<Self> {
            VersionedStore::new(Arc::new(Self))
        }

        fn error() -> StorageError {
            StorageError::QueryFailed("database is unavailable".to_string())
        }
    }

    impl Database for UnavailableDatabase {
        async fn execute(&self, _sql: &str, _params: &[&dyn ToSql]) -> Result<u64, StorageError> {
            Err(Self::error())
        }

        async fn query<T: FromRow>(
            &self,
            _sql: &str,
            _params: &[&dyn ToSql],
        ) -> Result<Vec<T>, StorageError> {
            Err(Self::error())
        }

        async fn query_one<T: FromRow>(
            &self,
            _sql: &str,
            _params: &[&dyn ToSql],
        ) -> Result<T, StorageError> {
            Err(Self::error())
        }
    }
}
