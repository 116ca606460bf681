// Mirrors schema.rs with SQLite column types; timestamps are RFC 3339 text.

diesel::table! {
    channel_bindings (id) {
        id -> Integer,
        discord_channel_id -> Text,
        zulip_stream_id -> BigInt,
        zulip_topic -> Nullable<Text>,
        include_threads -> Bool,
        created_at -> Text,
    }
}

diesel::table! {
    message_correlations (id) {
        id -> Integer,
        discord_message_id -> Nullable<Text>,
        discord_channel_id -> Text,
        zulip_message_id -> Nullable<BigInt>,
        zulip_stream_id -> BigInt,
        zulip_topic -> Text,
        source -> Text,
        created_at -> Text,
    }
}

diesel::table! {
    upload_correlations (id) {
        id -> Integer,
        source_file_url -> Text,
        mirrored_file_url -> Text,
        mirrored_file_id -> Nullable<BigInt>,
        created_at -> Text,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    channel_bindings,
    message_correlations,
    upload_correlations,
);
