diesel::table! {
    channel_bindings (id) {
        id -> BigInt,
        discord_channel_id -> Text,
        zulip_stream_id -> BigInt,
        zulip_topic -> Nullable<Text>,
        include_threads -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    message_correlations (id) {
        id -> BigInt,
        discord_message_id -> Nullable<Text>,
        discord_channel_id -> Text,
        zulip_message_id -> Nullable<BigInt>,
        zulip_stream_id -> BigInt,
        zulip_topic -> Text,
        source -> Text,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    upload_correlations (id) {
        id -> BigInt,
        source_file_url -> Text,
        mirrored_file_url -> Text,
        mirrored_file_id -> Nullable<BigInt>,
        created_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(
    channel_bindings,
    message_correlations,
    upload_correlations,
);
