diesel::table! {
    pgq_jobs (id) {
        id -> Int8,
        queue_name -> Text,
        data -> Bytea,
        run_after -> Timestamptz,
        retry_waits -> Array<Interval>,
        ran_at -> Nullable<Timestamptz>,
        last_error -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}
