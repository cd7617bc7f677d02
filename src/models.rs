use chrono::NaiveDateTime;
use diesel::prelude::*;
use uuid::Uuid;

use crate::schema::*;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = jobs)]
pub struct Job {
    pub id: String,
    pub payment_session_id: String,
    pub payment_intent_id: String,
    pub customer_email: String,
    pub customer_name: Option<String>,
    pub status: String,
    pub payment_status: String,
    pub selected_style: String,
    pub input_image_refs: Vec<String>,
    pub output_image_refs: Vec<String>,
    pub processing_execution_ref: Option<String>,
    pub error_message: Option<String>,
    pub progress: i32,
    pub amount_total: Option<i64>,
    pub currency: Option<String>,
    pub is_downloaded: bool,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub completed_at: Option<NaiveDateTime>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = jobs)]
pub struct NewJob {
    pub id: String,
    pub payment_session_id: String,
    pub payment_intent_id: String,
    pub customer_email: String,
    pub customer_name: Option<String>,
    pub status: String,
    pub payment_status: String,
    pub selected_style: String,
    pub input_image_refs: Vec<String>,
    pub amount_total: Option<i64>,
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = uploads)]
#[diesel(primary_key(file_id))]
pub struct Upload {
    pub file_id: String,
    pub owner_id: Uuid,
    pub s3_key: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub original_name: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = uploads)]
pub struct NewUpload {
    pub file_id: String,
    pub owner_id: Uuid,
    pub s3_key: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub original_name: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = job_claims)]
#[diesel(belongs_to(Job))]
pub struct JobClaim {
    pub id: Uuid,
    pub job_id: String,
    pub token_hash: String,
    pub expires_at: NaiveDateTime,
    pub used_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = job_claims)]
pub struct NewJobClaim {
    pub id: Uuid,
    pub job_id: String,
    pub token_hash: String,
    pub expires_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = job_readers)]
pub struct NewJobReader {
    pub job_id: String,
    pub user_id: Uuid,
}
