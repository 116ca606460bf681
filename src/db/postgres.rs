use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;

use crate::db::manager::Pool;
use crate::db::schema::{channel_bindings, message_correlations, upload_correlations};

use super::{
    DatabaseError,
    models::{ChannelBinding, MessageCorrelation, UploadCorrelation},
};

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = channel_bindings)]
struct DbChannelBinding {
    id: i64,
    discord_channel_id: String,
    zulip_stream_id: i64,
    zulip_topic: Option<String>,
    include_threads: bool,
    created_at: DateTime<Utc>,
}

impl From<DbChannelBinding> for ChannelBinding {
    fn from(value: DbChannelBinding) -> Self {
        Self {
            id: value.id,
            discord_channel_id: value.discord_channel_id,
            zulip_stream_id: value.zulip_stream_id,
            zulip_topic: value.zulip_topic,
            include_threads: value.include_threads,
            created_at: value.created_at,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = channel_bindings)]
struct NewChannelBinding<'a> {
    discord_channel_id: &'a str,
    zulip_stream_id: i64,
    zulip_topic: Option<&'a str>,
    include_threads: bool,
    created_at: &'a DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = message_correlations)]
struct DbMessageCorrelation {
    id: i64,
    discord_message_id: Option<String>,
    discord_channel_id: String,
    zulip_message_id: Option<i64>,
    zulip_stream_id: i64,
    zulip_topic: String,
    source: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<DbMessageCorrelation> for MessageCorrelation {
    type Error = DatabaseError;

    fn try_from(value: DbMessageCorrelation) -> Result<Self, Self::Error> {
        Ok(Self {
            id: value.id,
            discord_message_id: value.discord_message_id,
            discord_channel_id: value.discord_channel_id,
            zulip_message_id: value.zulip_message_id,
            zulip_stream_id: value.zulip_stream_id,
            zulip_topic: value.zulip_topic,
            source: value.source.parse()?,
            created_at: value.created_at,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = message_correlations)]
struct NewMessageCorrelation<'a> {
    discord_message_id: Option<&'a str>,
    discord_channel_id: &'a str,
    zulip_message_id: Option<i64>,
    zulip_stream_id: i64,
    zulip_topic: &'a str,
    source: &'a str,
    created_at: &'a DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = upload_correlations)]
struct DbUploadCorrelation {
    id: i64,
    source_file_url: String,
    mirrored_file_url: String,
    mirrored_file_id: Option<i64>,
    created_at: DateTime<Utc>,
}

impl From<DbUploadCorrelation> for UploadCorrelation {
    fn from(value: DbUploadCorrelation) -> Self {
        Self {
            id: value.id,
            source_file_url: value.source_file_url,
            mirrored_file_url: value.mirrored_file_url,
            mirrored_file_id: value.mirrored_file_id,
            created_at: value.created_at,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = upload_correlations)]
struct NewUploadCorrelation<'a> {
    source_file_url: &'a str,
    mirrored_file_url: &'a str,
    mirrored_file_id: Option<i64>,
    created_at: &'a DateTime<Utc>,
}

async fn with_connection<T, F>(pool: Pool, operation: F) -> Result<T, DatabaseError>
where
    T: Send + 'static,
    F: FnOnce(&mut PgConnection) -> Result<T, DatabaseError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut conn = pool
            .get()
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;
        operation(&mut conn)
    })
    .await
    .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
}

fn query_error(e: diesel::result::Error) -> DatabaseError {
    DatabaseError::Query(e.to_string())
}

pub struct PostgresChannelStore {
    pool: Pool,
}

impl PostgresChannelStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::ChannelStore for PostgresChannelStore {
    async fn get_binding_by_discord_channel(
        &self,
        channel_id: &str,
    ) -> Result<Option<ChannelBinding>, DatabaseError> {
        let pool = self.pool.clone();
        let channel_id = channel_id.to_string();
        with_connection(pool, move |conn| {
            use crate::db::schema::channel_bindings::dsl::*;
            channel_bindings
                .filter(discord_channel_id.eq(channel_id))
                .select(DbChannelBinding::as_select())
                .first::<DbChannelBinding>(conn)
                .optional()
                .map(|value| value.map(Into::into))
                .map_err(query_error)
        })
        .await
    }

    async fn get_binding_by_stream_topic(
        &self,
        stream_id: i64,
        topic: Option<&str>,
    ) -> Result<Option<ChannelBinding>, DatabaseError> {
        let pool = self.pool.clone();
        let topic = topic.map(ToOwned::to_owned);
        with_connection(pool, move |conn| {
            let mut query = channel_bindings::table
                .filter(channel_bindings::zulip_stream_id.eq(stream_id))
                .into_boxed();
            query = match topic {
                Some(topic) => query.filter(channel_bindings::zulip_topic.eq(topic)),
                None => query.filter(channel_bindings::zulip_topic.is_null()),
            };
            query
                .select(DbChannelBinding::as_select())
                .first::<DbChannelBinding>(conn)
                .optional()
                .map(|value| value.map(Into::into))
                .map_err(query_error)
        })
        .await
    }

    async fn list_bindings_by_stream(
        &self,
        stream_id: i64,
    ) -> Result<Vec<ChannelBinding>, DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            channel_bindings::table
                .filter(channel_bindings::zulip_stream_id.eq(stream_id))
                .select(DbChannelBinding::as_select())
                .load::<DbChannelBinding>(conn)
                .map(|rows| rows.into_iter().map(Into::into).collect())
                .map_err(query_error)
        })
        .await
    }

    async fn count_bindings(&self) -> Result<i64, DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            channel_bindings::table
                .count()
                .get_result(conn)
                .map_err(query_error)
        })
        .await
    }

    async fn list_bindings(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ChannelBinding>, DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            channel_bindings::table
                .order(channel_bindings::id.desc())
                .limit(limit)
                .offset(offset)
                .select(DbChannelBinding::as_select())
                .load::<DbChannelBinding>(conn)
                .map(|rows| rows.into_iter().map(Into::into).collect())
                .map_err(query_error)
        })
        .await
    }

    async fn create_binding(&self, binding: &ChannelBinding) -> Result<(), DatabaseError> {
        let pool = self.pool.clone();
        let binding = binding.clone();
        with_connection(pool, move |conn| {
            let new_binding = NewChannelBinding {
                discord_channel_id: &binding.discord_channel_id,
                zulip_stream_id: binding.zulip_stream_id,
                zulip_topic: binding.zulip_topic.as_deref(),
                include_threads: binding.include_threads,
                created_at: &binding.created_at,
            };
            diesel::insert_into(channel_bindings::table)
                .values(&new_binding)
                .execute(conn)
                .map(|_| ())
                .map_err(query_error)
        })
        .await
    }

    async fn set_include_threads(
        &self,
        channel_id: &str,
        include: bool,
    ) -> Result<bool, DatabaseError> {
        let pool = self.pool.clone();
        let channel_id = channel_id.to_string();
        with_connection(pool, move |conn| {
            diesel::update(
                channel_bindings::table
                    .filter(channel_bindings::discord_channel_id.eq(channel_id)),
            )
            .set(channel_bindings::include_threads.eq(include))
            .execute(conn)
            .map(|updated| updated > 0)
            .map_err(query_error)
        })
        .await
    }

    async fn delete_binding_by_discord_channel(
        &self,
        channel_id: &str,
    ) -> Result<Option<ChannelBinding>, DatabaseError> {
        let pool = self.pool.clone();
        let channel_id = channel_id.to_string();
        with_connection(pool, move |conn| {
            conn.transaction::<_, diesel::result::Error, _>(|conn| {
                diesel::delete(
                    message_correlations::table
                        .filter(message_correlations::discord_channel_id.eq(&channel_id)),
                )
                .execute(conn)?;
                diesel::delete(
                    channel_bindings::table
                        .filter(channel_bindings::discord_channel_id.eq(&channel_id)),
                )
                .returning(DbChannelBinding::as_returning())
                .get_result::<DbChannelBinding>(conn)
                .optional()
            })
            .map(|value| value.map(Into::into))
            .map_err(query_error)
        })
        .await
    }

    async fn delete_bindings_by_stream(
        &self,
        stream_id: i64,
    ) -> Result<Vec<ChannelBinding>, DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            conn.transaction::<_, diesel::result::Error, _>(|conn| {
                let bindings = diesel::delete(
                    channel_bindings::table
                        .filter(channel_bindings::zulip_stream_id.eq(stream_id)),
                )
                .returning(DbChannelBinding::as_returning())
                .get_results::<DbChannelBinding>(conn)?;
                let channel_ids: Vec<String> = bindings
                    .iter()
                    .map(|b| b.discord_channel_id.clone())
                    .collect();
                diesel::delete(
                    message_correlations::table
                        .filter(message_correlations::discord_channel_id.eq_any(channel_ids)),
                )
                .execute(conn)?;
                Ok(bindings)
            })
            .map(|rows| rows.into_iter().map(Into::into).collect())
            .map_err(query_error)
        })
        .await
    }
}

pub struct PostgresMessageStore {
    pool: Pool,
}

impl PostgresMessageStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::MessageStore for PostgresMessageStore {
    async fn get_by_discord_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<MessageCorrelation>, DatabaseError> {
        let pool = self.pool.clone();
        let message_id = message_id.to_string();
        with_connection(pool, move |conn| {
            message_correlations::table
                .filter(message_correlations::discord_message_id.eq(message_id))
                .select(DbMessageCorrelation::as_select())
                .first::<DbMessageCorrelation>(conn)
                .optional()
                .map_err(query_error)?
                .map(MessageCorrelation::try_from)
                .transpose()
        })
        .await
    }

    async fn get_by_zulip_message_id(
        &self,
        message_id: i64,
    ) -> Result<Option<MessageCorrelation>, DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            message_correlations::table
                .filter(message_correlations::zulip_message_id.eq(message_id))
                .select(DbMessageCorrelation::as_select())
                .first::<DbMessageCorrelation>(conn)
                .optional()
                .map_err(query_error)?
                .map(MessageCorrelation::try_from)
                .transpose()
        })
        .await
    }

    async fn insert_correlation(
        &self,
        correlation: &MessageCorrelation,
    ) -> Result<(), DatabaseError> {
        let pool = self.pool.clone();
        let correlation = correlation.clone();
        with_connection(pool, move |conn| {
            let new_correlation = NewMessageCorrelation {
                discord_message_id: correlation.discord_message_id.as_deref(),
                discord_channel_id: &correlation.discord_channel_id,
                zulip_message_id: correlation.zulip_message_id,
                zulip_stream_id: correlation.zulip_stream_id,
                zulip_topic: &correlation.zulip_topic,
                source: correlation.source.as_str(),
                created_at: &correlation.created_at,
            };
            diesel::insert_into(message_correlations::table)
                .values(&new_correlation)
                .execute(conn)
                .map(|_| ())
                .map_err(query_error)
        })
        .await
    }

    async fn delete_by_discord_message_id(
        &self,
        message_id: &str,
    ) -> Result<Vec<MessageCorrelation>, DatabaseError> {
        let pool = self.pool.clone();
        let message_id = message_id.to_string();
        with_connection(pool, move |conn| {
            diesel::delete(
                message_correlations::table
                    .filter(message_correlations::discord_message_id.eq(message_id)),
            )
            .returning(DbMessageCorrelation::as_returning())
            .get_results::<DbMessageCorrelation>(conn)
            .map_err(query_error)?
            .into_iter()
            .map(MessageCorrelation::try_from)
            .collect()
        })
        .await
    }

    async fn delete_by_zulip_message_id(
        &self,
        message_id: i64,
    ) -> Result<Vec<MessageCorrelation>, DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            diesel::delete(
                message_correlations::table
                    .filter(message_correlations::zulip_message_id.eq(message_id)),
            )
            .returning(DbMessageCorrelation::as_returning())
            .get_results::<DbMessageCorrelation>(conn)
            .map_err(query_error)?
            .into_iter()
            .map(MessageCorrelation::try_from)
            .collect()
        })
        .await
    }
}

pub struct PostgresUploadStore {
    pool: Pool,
}

impl PostgresUploadStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl super::UploadStore for PostgresUploadStore {
    async fn get_by_source_url(
        &self,
        source_url: &str,
    ) -> Result<Option<UploadCorrelation>, DatabaseError> {
        let pool = self.pool.clone();
        let source_url = source_url.to_string();
        with_connection(pool, move |conn| {
            upload_correlations::table
                .filter(upload_correlations::source_file_url.eq(source_url))
                .select(DbUploadCorrelation::as_select())
                .first::<DbUploadCorrelation>(conn)
                .optional()
                .map(|value| value.map(Into::into))
                .map_err(query_error)
        })
        .await
    }

    async fn get_by_mirrored_url(
        &self,
        mirrored_url: &str,
    ) -> Result<Option<UploadCorrelation>, DatabaseError> {
        let pool = self.pool.clone();
        let mirrored_url = mirrored_url.to_string();
        with_connection(pool, move |conn| {
            upload_correlations::table
                .filter(upload_correlations::mirrored_file_url.eq(mirrored_url))
                .select(DbUploadCorrelation::as_select())
                .first::<DbUploadCorrelation>(conn)
                .optional()
                .map(|value| value.map(Into::into))
                .map_err(query_error)
        })
        .await
    }

    async fn insert_upload(&self, upload: &UploadCorrelation) -> Result<(), DatabaseError> {
        let pool = self.pool.clone();
        let upload = upload.clone();
        with_connection(pool, move |conn| {
            let new_upload = NewUploadCorrelation {
                source_file_url: &upload.source_file_url,
                mirrored_file_url: &upload.mirrored_file_url,
                mirrored_file_id: upload.mirrored_file_id,
                created_at: &upload.created_at,
            };
            diesel::insert_into(upload_correlations::table)
                .values(&new_upload)
                .execute(conn)
                .map(|_| ())
                .map_err(query_error)
        })
        .await
    }

    async fn set_mirrored_file_id(
        &self,
        mirrored_url: &str,
        file_id: i64,
    ) -> Result<bool, DatabaseError> {
        let pool = self.pool.clone();
        let mirrored_url = mirrored_url.to_string();
        with_connection(pool, move |conn| {
            diesel::update(
                upload_correlations::table
                    .filter(upload_correlations::mirrored_file_url.eq(mirrored_url)),
            )
            .set(upload_correlations::mirrored_file_id.eq(Some(file_id)))
            .execute(conn)
            .map(|updated| updated > 0)
            .map_err(query_error)
        })
        .await
    }

    async fn delete_by_mirrored_file_id(
        &self,
        file_id: i64,
    ) -> Result<Vec<UploadCorrelation>, DatabaseError> {
        let pool = self.pool.clone();
        with_connection(pool, move |conn| {
            diesel::delete(
                upload_correlations::table
                    .filter(upload_correlations::mirrored_file_id.eq(file_id)),
            )
            .returning(DbUploadCorrelation::as_returning())
            .get_results::<DbUploadCorrelation>(conn)
            .map(|rows| rows.into_iter().map(Into::into).collect())
            .map_err(query_error)
        })
        .await
    }
}
