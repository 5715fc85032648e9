//! Diesel table definitions for the reviewer roulette service.
//!
//! Tables: users, ooo_status, mr_reviews, reviewer_assignments,
//! review_metrics, badges, user_badges, configuration.

diesel::table! {
    users (id) {
        id -> Int8,
        gitlab_id -> Int8,
        username -> Varchar,
        email -> Varchar,
        role -> Varchar,
        team -> Varchar,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    ooo_status (id) {
        id -> Int8,
        user_id -> Int8,
        start_date -> Timestamptz,
        end_date -> Timestamptz,
        reason -> Text,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    mr_reviews (id) {
        id -> Int8,
        gitlab_project_id -> Int8,
        gitlab_mr_iid -> Int8,
        mr_url -> Text,
        mr_title -> Text,
        mr_author_id -> Nullable<Int8>,
        team -> Varchar,
        roulette_triggered_at -> Nullable<Timestamptz>,
        roulette_triggered_by -> Nullable<Int8>,
        first_review_at -> Nullable<Timestamptz>,
        approved_at -> Nullable<Timestamptz>,
        merged_at -> Nullable<Timestamptz>,
        closed_at -> Nullable<Timestamptz>,
        status -> Varchar,
        bot_comment_id -> Nullable<Int8>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    reviewer_assignments (id) {
        id -> Int8,
        mr_review_id -> Int8,
        user_id -> Int8,
        role -> Varchar,
        assigned_at -> Timestamptz,
        started_review_at -> Nullable<Timestamptz>,
        first_comment_at -> Nullable<Timestamptz>,
        approved_at -> Nullable<Timestamptz>,
        comment_count -> Int4,
        comment_total_length -> Int8,
        last_note_id -> Nullable<Int8>,
    }
}

diesel::table! {
    review_metrics (id) {
        id -> Int8,
        date -> Date,
        team -> Varchar,
        user_id -> Nullable<Int8>,
        project_id -> Nullable<Int8>,
        total_reviews -> Int4,
        completed_reviews -> Int4,
        avg_ttfr -> Nullable<Int4>,
        avg_time_to_approval -> Nullable<Int4>,
        avg_comment_count -> Nullable<Float8>,
        avg_comment_length -> Nullable<Float8>,
        engagement_score -> Nullable<Float8>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    badges (id) {
        id -> Int8,
        name -> Varchar,
        description -> Text,
        icon -> Varchar,
        criteria -> Jsonb,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    user_badges (id) {
        id -> Int8,
        user_id -> Int8,
        badge_id -> Int8,
        earned_at -> Timestamptz,
    }
}

diesel::table! {
    configuration (id) {
        id -> Int8,
        key -> Varchar,
        value -> Jsonb,
        updated_at -> Timestamptz,
    }
}

// Foreign key relationships
diesel::joinable!(ooo_status -> users (user_id));
diesel::joinable!(reviewer_assignments -> mr_reviews (mr_review_id));
diesel::joinable!(reviewer_assignments -> users (user_id));
diesel::joinable!(user_badges -> users (user_id));
diesel::joinable!(user_badges -> badges (badge_id));
diesel::joinable!(review_metrics -> users (user_id));

diesel::allow_tables_to_appear_in_same_query!(
    users,
    ooo_status,
    mr_reviews,
    reviewer_assignments,
    review_metrics,
    badges,
    user_badges,
    configuration,
);
