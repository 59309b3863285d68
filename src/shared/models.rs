pub mod schema {
    diesel::table! {
        jobs (id) {
            id -> Uuid,
            servicem8_uuid -> Nullable<Text>,
            job_code -> Nullable<Text>,
            description -> Nullable<Text>,
            company_name -> Nullable<Text>,
            contact_name -> Nullable<Text>,
            contact_phone -> Nullable<Text>,
            contact_email -> Nullable<Text>,
            address -> Nullable<Text>,
            lifecycle_phase -> Text,
            status -> Text,
            sales_stage -> Nullable<Text>,
            scheduler_stage -> Nullable<Text>,
            install_stage -> Nullable<Text>,
            work_type_id -> Nullable<Uuid>,
            quote_value -> Nullable<Float8>,
            purchase_order_status -> Text,
            quote_sent -> Bool,
            quote_sent_at -> Nullable<Timestamptz>,
            hours_since_quote_sent -> Nullable<Int8>,
            days_since_quote_sent -> Nullable<Int8>,
            post_install_date -> Nullable<Date>,
            panel_install_date -> Nullable<Date>,
            tentative_post_date -> Nullable<Date>,
            tentative_panel_date -> Nullable<Date>,
            post_duration_hours -> Nullable<Float8>,
            panel_duration_hours -> Nullable<Float8>,
            post_crew_size -> Nullable<Int4>,
            panel_crew_size -> Nullable<Int4>,
            production_duration_days -> Nullable<Int4>,
            last_contact_at -> Nullable<Timestamptz>,
            last_contact_type -> Nullable<Text>,
            last_contact_direction -> Nullable<Text>,
            last_client_contact_at -> Nullable<Timestamptz>,
            last_client_contact_type -> Nullable<Text>,
            created_at -> Timestamptz,
            updated_at -> Timestamptz,
        }
    }

    diesel::table! {
        work_types (id) {
            id -> Uuid,
            name -> Text,
            color -> Text,
            is_default -> Bool,
            is_active -> Bool,
            created_at -> Timestamptz,
            updated_at -> Timestamptz,
        }
    }

    diesel::table! {
        work_type_stages (id) {
            id -> Uuid,
            work_type_id -> Uuid,
            name -> Text,
            stage_key -> Text,
            order_index -> Int4,
            category -> Text,
            triggers_scheduler -> Bool,
            triggers_purchase_order -> Bool,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        job_stage_progress (id) {
            id -> Uuid,
            job_id -> Uuid,
            stage_id -> Uuid,
            status -> Text,
            notes -> Nullable<Text>,
            timer_running -> Bool,
            timer_started_at -> Nullable<Timestamptz>,
            total_time_seconds -> Int8,
            created_at -> Timestamptz,
            updated_at -> Timestamptz,
        }
    }

    diesel::table! {
        sync_logs (id) {
            id -> Uuid,
            sync_type -> Text,
            status -> Text,
            jobs_processed -> Int4,
            error_message -> Nullable<Text>,
            started_at -> Timestamptz,
            finished_at -> Nullable<Timestamptz>,
        }
    }

    diesel::table! {
        oauth_tokens (id) {
            id -> Uuid,
            provider -> Text,
            access_token -> Text,
            refresh_token -> Nullable<Text>,
            expires_at -> Nullable<Timestamptz>,
            created_at -> Timestamptz,
            updated_at -> Timestamptz,
        }
    }

    diesel::table! {
        app_settings (key) {
            key -> Text,
            value -> Jsonb,
            updated_at -> Timestamptz,
        }
    }

    diesel::joinable!(work_type_stages -> work_types (work_type_id));
    diesel::joinable!(job_stage_progress -> jobs (job_id));
    diesel::joinable!(job_stage_progress -> work_type_stages (stage_id));

    diesel::allow_tables_to_appear_in_same_query!(
        jobs,
        work_types,
        work_type_stages,
        job_stage_progress,
        sync_logs,
        oauth_tokens,
        app_settings,
    );
}
