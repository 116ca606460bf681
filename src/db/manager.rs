use crate::config::{DatabaseConfig as ConfigDatabaseConfig, DbType as ConfigDbType};
use crate::db::{ChannelStore, DatabaseError, MessageStore, UploadStore};
use std::sync::Arc;

#[cfg(feature = "postgres")]
use crate::db::postgres::{PostgresChannelStore, PostgresMessageStore, PostgresUploadStore};
#[cfg(feature = "postgres")]
use diesel::RunQueryDsl;
#[cfg(feature = "postgres")]
use diesel::pg::PgConnection;
#[cfg(feature = "postgres")]
use diesel::r2d2::{self, ConnectionManager};

#[cfg(feature = "postgres")]
pub type Pool = r2d2::Pool<ConnectionManager<PgConnection>>;

#[cfg(feature = "sqlite")]
use crate::db::sqlite::{SqliteChannelStore, SqliteMessageStore, SqliteUploadStore};
#[cfg(feature = "sqlite")]
use diesel::Connection;
#[cfg(feature = "sqlite")]
use diesel::sqlite::SqliteConnection;

#[derive(Clone)]
pub struct DatabaseManager {
    #[cfg(feature = "postgres")]
    postgres_pool: Option<Pool>,
    #[cfg(feature = "sqlite")]
    sqlite_path: Option<String>,
    channel_store: Arc<dyn ChannelStore>,
    message_store: Arc<dyn MessageStore>,
    upload_store: Arc<dyn UploadStore>,
    db_type: DbType,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DbType {
    Postgres,
    Sqlite,
}

impl From<ConfigDbType> for DbType {
    fn from(value: ConfigDbType) -> Self {
        match value {
            ConfigDbType::Postgres => DbType::Postgres,
            ConfigDbType::Sqlite => DbType::Sqlite,
        }
    }
}

#[cfg(feature = "postgres")]
const POSTGRES_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS channel_bindings (
        id BIGSERIAL PRIMARY KEY,
        discord_channel_id TEXT NOT NULL UNIQUE,
        zulip_stream_id BIGINT NOT NULL,
        zulip_topic TEXT,
        include_threads BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS message_correlations (
        id BIGSERIAL PRIMARY KEY,
        discord_message_id TEXT UNIQUE,
        discord_channel_id TEXT NOT NULL,
        zulip_message_id BIGINT UNIQUE,
        zulip_stream_id BIGINT NOT NULL,
        zulip_topic TEXT NOT NULL,
        source TEXT NOT NULL,
        created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS upload_correlations (
        id BIGSERIAL PRIMARY KEY,
        source_file_url TEXT NOT NULL UNIQUE,
        mirrored_file_url TEXT NOT NULL UNIQUE,
        mirrored_file_id BIGINT UNIQUE,
        created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_channel_bindings_stream_topic ON channel_bindings(zulip_stream_id, COALESCE(zulip_topic, ''))",
    "CREATE INDEX IF NOT EXISTS idx_message_correlations_channel ON message_correlations(discord_channel_id)",
];

#[cfg(feature = "sqlite")]
const SQLITE_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS channel_bindings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        discord_channel_id TEXT NOT NULL UNIQUE,
        zulip_stream_id BIGINT NOT NULL,
        zulip_topic TEXT,
        include_threads BOOLEAN NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS message_correlations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        discord_message_id TEXT UNIQUE,
        discord_channel_id TEXT NOT NULL,
        zulip_message_id BIGINT UNIQUE,
        zulip_stream_id BIGINT NOT NULL,
        zulip_topic TEXT NOT NULL,
        source TEXT NOT NULL,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS upload_correlations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source_file_url TEXT NOT NULL UNIQUE,
        mirrored_file_url TEXT NOT NULL UNIQUE,
        mirrored_file_id BIGINT UNIQUE,
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_channel_bindings_stream_topic ON channel_bindings(zulip_stream_id, COALESCE(zulip_topic, ''))",
    "CREATE INDEX IF NOT EXISTS idx_message_correlations_channel ON message_correlations(discord_channel_id)",
];

impl DatabaseManager {
    pub async fn new(config: &ConfigDatabaseConfig) -> Result<Self, DatabaseError> {
        let db_type = DbType::from(config.db_type());

        match db_type {
            #[cfg(feature = "postgres")]
            DbType::Postgres => {
                let connection_string = config.connection_string();
                let max_connections = config.max_connections();
                let min_connections = config.min_connections();

                let manager = ConnectionManager::<PgConnection>::new(connection_string);

                let builder = r2d2::Pool::builder()
                    .max_size(max_connections.unwrap_or(10))
                    .min_idle(Some(min_connections.unwrap_or(1)));

                let pool = builder
                    .build(manager)
                    .map_err(|e| DatabaseError::Connection(e.to_string()))?;

                Ok(Self {
                    channel_store: Arc::new(PostgresChannelStore::new(pool.clone())),
                    message_store: Arc::new(PostgresMessageStore::new(pool.clone())),
                    upload_store: Arc::new(PostgresUploadStore::new(pool.clone())),
                    postgres_pool: Some(pool),
                    #[cfg(feature = "sqlite")]
                    sqlite_path: None,
                    db_type,
                })
            }
            #[cfg(feature = "sqlite")]
            DbType::Sqlite => {
                let path = config.sqlite_path().ok_or_else(|| {
                    DatabaseError::Connection("sqlite path missing from config".to_string())
                })?;
                let path_arc = Arc::new(path.clone());

                Ok(Self {
                    #[cfg(feature = "postgres")]
                    postgres_pool: None,
                    channel_store: Arc::new(SqliteChannelStore::new(path_arc.clone())),
                    message_store: Arc::new(SqliteMessageStore::new(path_arc.clone())),
                    upload_store: Arc::new(SqliteUploadStore::new(path_arc)),
                    sqlite_path: Some(path),
                    db_type,
                })
            }
            #[cfg(not(feature = "postgres"))]
            DbType::Postgres => Err(DatabaseError::Connection(
                "PostgreSQL feature not enabled".to_string(),
            )),
            #[cfg(not(feature = "sqlite"))]
            DbType::Sqlite => Err(DatabaseError::Connection(
                "SQLite feature not enabled".to_string(),
            )),
        }
    }

    /// Builds a manager around already-constructed stores, without a backing database.
    #[cfg(test)]
    pub fn with_stores(
        channel_store: Arc<dyn ChannelStore>,
        message_store: Arc<dyn MessageStore>,
        upload_store: Arc<dyn UploadStore>,
    ) -> Self {
        Self {
            #[cfg(feature = "postgres")]
            postgres_pool: None,
            #[cfg(feature = "sqlite")]
            sqlite_path: None,
            channel_store,
            message_store,
            upload_store,
            db_type: DbType::Sqlite,
        }
    }

    pub async fn migrate(&self) -> Result<(), DatabaseError> {
        match self.db_type {
            #[cfg(feature = "postgres")]
            DbType::Postgres => {
                let pool = self.postgres_pool.as_ref().ok_or_else(|| {
                    DatabaseError::Migration("postgres pool not initialised".to_string())
                })?;
                Self::migrate_postgres(pool).await
            }
            #[cfg(feature = "sqlite")]
            DbType::Sqlite => {
                let path = self.sqlite_path.as_ref().ok_or_else(|| {
                    DatabaseError::Migration("sqlite path not initialised".to_string())
                })?;
                Self::migrate_sqlite(path).await
            }
            #[cfg(not(feature = "postgres"))]
            DbType::Postgres => Err(DatabaseError::Migration(
                "PostgreSQL feature not enabled".to_string(),
            )),
            #[cfg(not(feature = "sqlite"))]
            DbType::Sqlite => Err(DatabaseError::Migration(
                "SQLite feature not enabled".to_string(),
            )),
        }
    }

    #[cfg(feature = "postgres")]
    async fn migrate_postgres(pool: &Pool) -> Result<(), DatabaseError> {
        let pool = pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| DatabaseError::Connection(e.to_string()))?;

            for statement in POSTGRES_SCHEMA {
                diesel::sql_query(*statement)
                    .execute(&mut conn)
                    .map_err(|e| DatabaseError::Migration(e.to_string()))?;
            }

            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Migration(format!("migration task failed: {e}")))?
    }

    #[cfg(feature = "sqlite")]
    async fn migrate_sqlite(path: &str) -> Result<(), DatabaseError> {
        use diesel::RunQueryDsl;

        let path = path.to_string();
        tokio::task::spawn_blocking(move || {
            let mut conn = SqliteConnection::establish(&path)
                .map_err(|e| DatabaseError::Connection(e.to_string()))?;

            for statement in SQLITE_SCHEMA {
                diesel::sql_query(*statement)
                    .execute(&mut conn)
                    .map_err(|e| DatabaseError::Migration(e.to_string()))?;
            }

            Ok(())
        })
        .await
        .map_err(|e| DatabaseError::Migration(format!("migration task failed: {e}")))?
    }

    pub fn channel_store(&self) -> Arc<dyn ChannelStore> {
        self.channel_store.clone()
    }

    pub fn message_store(&self) -> Arc<dyn MessageStore> {
        self.message_store.clone()
    }

    pub fn upload_store(&self) -> Arc<dyn UploadStore> {
        self.upload_store.clone()
    }

    pub fn db_type(&self) -> DbType {
        self.db_type
    }
}
