use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use std::sync::Arc;

use crate::db::schema_sqlite::{channel_bindings, message_correlations, upload_correlations};

use super::{
    DatabaseError,
    models::{ChannelBinding, MessageCorrelation, UploadCorrelation},
};

fn datetime_to_string(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn string_to_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Query(format!("invalid datetime format: {}", e)))
}

// SQLite INTEGER primary keys come back as i32; the public models keep i64.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = channel_bindings)]
struct DbChannelBinding {
    id: i32,
    discord_channel_id: String,
    zulip_stream_id: i64,
    zulip_topic: Option<String>,
    include_threads: bool,
    created_at: String,
}

impl DbChannelBinding {
    fn to_binding(&self) -> Result<ChannelBinding, DatabaseError> {
        Ok(ChannelBinding {
            id: self.id as i64,
            discord_channel_id: self.discord_channel_id.clone(),
            zulip_stream_id: self.zulip_stream_id,
            zulip_topic: self.zulip_topic.clone(),
            include_threads: self.include_threads,
            created_at: string_to_datetime(&self.created_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = channel_bindings)]
struct NewChannelBinding<'a> {
    discord_channel_id: &'a str,
    zulip_stream_id: i64,
    zulip_topic: Option<&'a str>,
    include_threads: bool,
    created_at: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = message_correlations)]
struct DbMessageCorrelation {
    id: i32,
    discord_message_id: Option<String>,
    discord_channel_id: String,
    zulip_message_id: Option<i64>,
    zulip_stream_id: i64,
    zulip_topic: String,
    source: String,
    created_at: String,
}

impl DbMessageCorrelation {
    fn to_correlation(&self) -> Result<MessageCorrelation, DatabaseError> {
        Ok(MessageCorrelation {
            id: self.id as i64,
            discord_message_id: self.discord_message_id.clone(),
            discord_channel_id: self.discord_channel_id.clone(),
            zulip_message_id: self.zulip_message_id,
            zulip_stream_id: self.zulip_stream_id,
            zulip_topic: self.zulip_topic.clone(),
            source: self.source.parse()?,
            created_at: string_to_datetime(&self.created_at)?,
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
    created_at: String,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = upload_correlations)]
struct DbUploadCorrelation {
    id: i32,
    source_file_url: String,
    mirrored_file_url: String,
    mirrored_file_id: Option<i64>,
    created_at: String,
}

impl DbUploadCorrelation {
    fn to_upload(&self) -> Result<UploadCorrelation, DatabaseError> {
        Ok(UploadCorrelation {
            id: self.id as i64,
            source_file_url: self.source_file_url.clone(),
            mirrored_file_url: self.mirrored_file_url.clone(),
            mirrored_file_id: self.mirrored_file_id,
            created_at: string_to_datetime(&self.created_at)?,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = upload_correlations)]
struct NewUploadCorrelation<'a> {
    source_file_url: &'a str,
    mirrored_file_url: &'a str,
    mirrored_file_id: Option<i64>,
    created_at: String,
}

fn establish_connection(path: &str) -> Result<SqliteConnection, DatabaseError> {
    SqliteConnection::establish(path).map_err(|e| DatabaseError::Connection(e.to_string()))
}

async fn with_connection<T, F>(db_path: Arc<String>, operation: F) -> Result<T, DatabaseError>
where
    T: Send + 'static,
    F: FnOnce(&mut SqliteConnection) -> Result<T, DatabaseError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut conn = establish_connection(&db_path)?;
        operation(&mut conn)
    })
    .await
    .map_err(|e| DatabaseError::Query(format!("database task failed: {e}")))?
}

fn query_error(e: diesel::result::Error) -> DatabaseError {
    DatabaseError::Query(e.to_string())
}

pub struct SqliteChannelStore {
    db_path: Arc<String>,
}

impl SqliteChannelStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl super::ChannelStore for SqliteChannelStore {
    async fn get_binding_by_discord_channel(
        &self,
        channel_id: &str,
    ) -> Result<Option<ChannelBinding>, DatabaseError> {
        let channel_id = channel_id.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            use crate::db::schema_sqlite::channel_bindings::dsl::*;
            channel_bindings
                .filter(discord_channel_id.eq(channel_id))
                .select(DbChannelBinding::as_select())
                .first::<DbChannelBinding>(conn)
                .optional()
                .map_err(query_error)?
                .map(|b| b.to_binding())
                .transpose()
        })
        .await
    }

    async fn get_binding_by_stream_topic(
        &self,
        stream_id: i64,
        topic: Option<&str>,
    ) -> Result<Option<ChannelBinding>, DatabaseError> {
        let topic = topic.map(ToOwned::to_owned);
        with_connection(self.db_path.clone(), move |conn| {
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
                .map_err(query_error)?
                .map(|b| b.to_binding())
                .transpose()
        })
        .await
    }

    async fn list_bindings_by_stream(
        &self,
        stream_id: i64,
    ) -> Result<Vec<ChannelBinding>, DatabaseError> {
        with_connection(self.db_path.clone(), move |conn| {
            let results = channel_bindings::table
                .filter(channel_bindings::zulip_stream_id.eq(stream_id))
                .select(DbChannelBinding::as_select())
                .load::<DbChannelBinding>(conn)
                .map_err(query_error)?;
            results.iter().map(DbChannelBinding::to_binding).collect()
        })
        .await
    }

    async fn count_bindings(&self) -> Result<i64, DatabaseError> {
        with_connection(self.db_path.clone(), move |conn| {
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
        with_connection(self.db_path.clone(), move |conn| {
            let results = channel_bindings::table
                .order(channel_bindings::id.desc())
                .limit(limit)
                .offset(offset)
                .select(DbChannelBinding::as_select())
                .load::<DbChannelBinding>(conn)
                .map_err(query_error)?;
            results.iter().map(DbChannelBinding::to_binding).collect()
        })
        .await
    }

    async fn create_binding(&self, binding: &ChannelBinding) -> Result<(), DatabaseError> {
        let binding = binding.clone();
        with_connection(self.db_path.clone(), move |conn| {
            let new_binding = NewChannelBinding {
                discord_channel_id: &binding.discord_channel_id,
                zulip_stream_id: binding.zulip_stream_id,
                zulip_topic: binding.zulip_topic.as_deref(),
                include_threads: binding.include_threads,
                created_at: datetime_to_string(&binding.created_at),
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
        let channel_id = channel_id.to_string();
        with_connection(self.db_path.clone(), move |conn| {
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
        let channel_id = channel_id.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            let deleted = conn
                .transaction::<_, diesel::result::Error, _>(|conn| {
                    let binding = channel_bindings::table
                        .filter(channel_bindings::discord_channel_id.eq(&channel_id))
                        .select(DbChannelBinding::as_select())
                        .first::<DbChannelBinding>(conn)
                        .optional()?;
                    if binding.is_some() {
                        diesel::delete(
                            message_correlations::table
                                .filter(message_correlations::discord_channel_id.eq(&channel_id)),
                        )
                        .execute(conn)?;
                        diesel::delete(
                            channel_bindings::table
                                .filter(channel_bindings::discord_channel_id.eq(&channel_id)),
                        )
                        .execute(conn)?;
                    }
                    Ok(binding)
                })
                .map_err(query_error)?;
            deleted.map(|b| b.to_binding()).transpose()
        })
        .await
    }

    async fn delete_bindings_by_stream(
        &self,
        stream_id: i64,
    ) -> Result<Vec<ChannelBinding>, DatabaseError> {
        with_connection(self.db_path.clone(), move |conn| {
            let deleted = conn
                .transaction::<_, diesel::result::Error, _>(|conn| {
                    let bindings = channel_bindings::table
                        .filter(channel_bindings::zulip_stream_id.eq(stream_id))
                        .select(DbChannelBinding::as_select())
                        .load::<DbChannelBinding>(conn)?;
                    let channel_ids: Vec<String> = bindings
                        .iter()
                        .map(|b| b.discord_channel_id.clone())
                        .collect();
                    diesel::delete(
                        message_correlations::table
                            .filter(message_correlations::discord_channel_id.eq_any(channel_ids)),
                    )
                    .execute(conn)?;
                    diesel::delete(
                        channel_bindings::table
                            .filter(channel_bindings::zulip_stream_id.eq(stream_id)),
                    )
                    .execute(conn)?;
                    Ok(bindings)
                })
                .map_err(query_error)?;
            deleted.iter().map(DbChannelBinding::to_binding).collect()
        })
        .await
    }
}

pub struct SqliteMessageStore {
    db_path: Arc<String>,
}

impl SqliteMessageStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl super::MessageStore for SqliteMessageStore {
    async fn get_by_discord_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<MessageCorrelation>, DatabaseError> {
        let message_id = message_id.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            message_correlations::table
                .filter(message_correlations::discord_message_id.eq(message_id))
                .select(DbMessageCorrelation::as_select())
                .first::<DbMessageCorrelation>(conn)
                .optional()
                .map_err(query_error)?
                .map(|m| m.to_correlation())
                .transpose()
        })
        .await
    }

    async fn get_by_zulip_message_id(
        &self,
        message_id: i64,
    ) -> Result<Option<MessageCorrelation>, DatabaseError> {
        with_connection(self.db_path.clone(), move |conn| {
            message_correlations::table
                .filter(message_correlations::zulip_message_id.eq(message_id))
                .select(DbMessageCorrelation::as_select())
                .first::<DbMessageCorrelation>(conn)
                .optional()
                .map_err(query_error)?
                .map(|m| m.to_correlation())
                .transpose()
        })
        .await
    }

    async fn insert_correlation(
        &self,
        correlation: &MessageCorrelation,
    ) -> Result<(), DatabaseError> {
        let correlation = correlation.clone();
        with_connection(self.db_path.clone(), move |conn| {
            let new_correlation = NewMessageCorrelation {
                discord_message_id: correlation.discord_message_id.as_deref(),
                discord_channel_id: &correlation.discord_channel_id,
                zulip_message_id: correlation.zulip_message_id,
                zulip_stream_id: correlation.zulip_stream_id,
                zulip_topic: &correlation.zulip_topic,
                source: correlation.source.as_str(),
                created_at: datetime_to_string(&correlation.created_at),
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
        let message_id = message_id.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            let deleted = conn
                .transaction::<_, diesel::result::Error, _>(|conn| {
                    let rows = message_correlations::table
                        .filter(message_correlations::discord_message_id.eq(&message_id))
                        .select(DbMessageCorrelation::as_select())
                        .load::<DbMessageCorrelation>(conn)?;
                    diesel::delete(
                        message_correlations::table
                            .filter(message_correlations::discord_message_id.eq(&message_id)),
                    )
                    .execute(conn)?;
                    Ok(rows)
                })
                .map_err(query_error)?;
            deleted.iter().map(DbMessageCorrelation::to_correlation).collect()
        })
        .await
    }

    async fn delete_by_zulip_message_id(
        &self,
        message_id: i64,
    ) -> Result<Vec<MessageCorrelation>, DatabaseError> {
        with_connection(self.db_path.clone(), move |conn| {
            let deleted = conn
                .transaction::<_, diesel::result::Error, _>(|conn| {
                    let rows = message_correlations::table
                        .filter(message_correlations::zulip_message_id.eq(message_id))
                        .select(DbMessageCorrelation::as_select())
                        .load::<DbMessageCorrelation>(conn)?;
                    diesel::delete(
                        message_correlations::table
                            .filter(message_correlations::zulip_message_id.eq(message_id)),
                    )
                    .execute(conn)?;
                    Ok(rows)
                })
                .map_err(query_error)?;
            deleted.iter().map(DbMessageCorrelation::to_correlation).collect()
        })
        .await
    }
}

pub struct SqliteUploadStore {
    db_path: Arc<String>,
}

impl SqliteUploadStore {
    pub fn new(db_path: Arc<String>) -> Self {
        Self { db_path }
    }
}

#[async_trait]
impl super::UploadStore for SqliteUploadStore {
    async fn get_by_source_url(
        &self,
        source_url: &str,
    ) -> Result<Option<UploadCorrelation>, DatabaseError> {
        let source_url = source_url.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            upload_correlations::table
                .filter(upload_correlations::source_file_url.eq(source_url))
                .select(DbUploadCorrelation::as_select())
                .first::<DbUploadCorrelation>(conn)
                .optional()
                .map_err(query_error)?
                .map(|u| u.to_upload())
                .transpose()
        })
        .await
    }

    async fn get_by_mirrored_url(
        &self,
        mirrored_url: &str,
    ) -> Result<Option<UploadCorrelation>, DatabaseError> {
        let mirrored_url = mirrored_url.to_string();
        with_connection(self.db_path.clone(), move |conn| {
            upload_correlations::table
                .filter(upload_correlations::mirrored_file_url.eq(mirrored_url))
                .select(DbUploadCorrelation::as_select())
                .first::<DbUploadCorrelation>(conn)
                .optional()
                .map_err(query_error)?
                .map(|u| u.to_upload())
                .transpose()
        })
        .await
    }

    async fn insert_upload(&self, upload: &UploadCorrelation) -> Result<(), DatabaseError> {
        let upload = upload.clone();
        with_connection(self.db_path.clone(), move |conn| {
            let new_upload = NewUploadCorrelation {
                source_file_url: &upload.source_file_url,
                mirrored_file_url: &upload.mirrored_file_url,
                mirrored_file_id: upload.mirrored_file_id,
                created_at: datetime_to_string(&upload.created_at),
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
        let mirrored_url = mirrored_url.to_string();
        with_connection(self.db_path.clone(), move |conn| {
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
        with_connection(self.db_path.clone(), move |conn| {
            let deleted = conn
                .transaction::<_, diesel::result::Error, _>(|conn| {
                    let rows = upload_correlations::table
                        .filter(upload_correlations::mirrored_file_id.eq(file_id))
                        .select(DbUploadCorrelation::as_select())
                        .load::<DbUploadCorrelation>(conn)?;
                    diesel::delete(
                        upload_correlations::table
                            .filter(upload_correlations::mirrored_file_id.eq(file_id)),
                    )
                    .execute(conn)?;
                    Ok(rows)
                })
                .map_err(query_error)?;
            deleted.iter().map(DbUploadCorrelation::to_upload).collect()
        })
        .await
    }
}
