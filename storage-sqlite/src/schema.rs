// We use Bigint here instead of Integer, even though Sqlite does not have the concept of Bigint,
// to allow diesel to assume that integer is i64. See https://github.com/diesel-rs/diesel/issues/852

table! {
    batch_uploads (batch_id, user_id) {
        #[sql_name="batch"]
        batch_id -> BigInt,
        #[sql_name="userid"]
        user_id -> BigInt,
        #[sql_name="collection"]
        collection_id -> Integer,
    }
}

table! {
    batch_upload_items (batch_id, user_id, id) {
        #[sql_name="batch"]
        batch_id -> BigInt,
        #[sql_name="userid"]
        user_id -> BigInt,
        id -> Text,
        sortindex -> Nullable<Integer>,
        payload -> Nullable<Text>,
        payload_size -> Nullable<BigInt>,
        ttl_offset -> Nullable<Integer>,
    }
}

table! {
    bso (user_id, collection_id, id) {
        #[sql_name="userid"]
        user_id -> BigInt,
        #[sql_name="collection"]
        collection_id -> Integer,
        id -> Text,
        sortindex -> Nullable<Integer>,
        payload -> Text,
        // not used, but legacy
        payload_size -> BigInt,
        modified -> BigInt,
        #[sql_name="ttl"]
        expiry -> BigInt,
    }
}

table! {
    collections (id) {
        id -> Integer,
        name -> Text,
    }
}

table! {
    user_collections (user_id, collection_id) {
        #[sql_name="userid"]
        user_id -> BigInt,
        #[sql_name="collection"]
        collection_id -> Integer,
        #[sql_name="last_modified"]
        modified -> BigInt,
        #[sql_name="count"]
        count -> Integer,
        #[sql_name="total_bytes"]
        total_bytes -> BigInt,
    }
}

allow_tables_to_appear_in_same_query!(
    batch_uploads,
    batch_upload_items,
    bso,
    collections,
    user_collections,
);
