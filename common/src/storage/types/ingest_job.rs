use crate::error::AppError;
use crate::storage::db::SurrealDbClient;
use crate::stored_object;

/// Fallback lease length when `queue.lease_seconds` is unconfigured (§4.9a).
pub const DEFAULT_LEASE_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Processing,
    Done,
    DeadLetter,
}

stored_object!(IngestJob, "ingest_job", {
    document_id: String,
    state: JobState,
    attempts: u32,
    available_at: chrono::DateTime<chrono::Utc>,
    locked_by: Option<String>,
    locked_at: Option<chrono::DateTime<chrono::Utc>>,
    last_error: Option<String>
});

impl IngestJob {
    /// Insert a new row in `queued` state, immediately available.
    pub async fn enqueue(db: &SurrealDbClient, document_id: String) -> Result<Self, AppError> {
        let now = chrono::Utc::now();
        let job = IngestJob {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            document_id,
            state: JobState::Queued,
            attempts: 0,
            available_at: now,
            locked_by: None,
            locked_at: None,
            last_error: None,
        };
        db.store_item(job.clone()).await?;
        Ok(job)
    }

    /// Atomically claim the oldest ready row: `state = queued AND
    /// available_at <= now`, or a `processing` row whose lease has expired
    /// (crashed-worker recovery). Returns `None` if nothing is ready.
    pub async fn claim_next_ready(
        db: &SurrealDbClient,
        worker_id: &str,
        lease_seconds: i64,
    ) -> Result<Option<Self>, AppError> {
        let sql = r#"
            LET $candidate = (
                SELECT * FROM ingest_job
                WHERE
                    (state = 'queued' AND available_at <= time::now())
                    OR (state = 'processing' AND locked_at <= time::now() - $lease)
                ORDER BY available_at ASC
                LIMIT 1
            )[0];

            IF $candidate IS NONE {
                RETURN NONE;
            } ELSE {
                RETURN (
                    UPDATE $candidate.id SET
                        state = 'processing',
                        locked_by = $worker_id,
                        locked_at = time::now(),
                        updated_at = time::now()
                );
            };
        "#;

        let lease = surrealdb::sql::Duration::from_secs(lease_seconds.max(0) as u64);
        let mut response = db
            .client
            .query(sql)
            .bind(("worker_id", worker_id.to_string()))
            .bind(("lease", lease))
            .await?;

        let claimed: Option<Vec<Self>> = response.take(1)?;
        Ok(claimed.and_then(|mut rows| rows.pop()))
    }

    pub async fn mark_succeeded(db: &SurrealDbClient, job_id: &str) -> Result<(), AppError> {
        db.client
            .query("UPDATE type::thing('ingest_job', $id) SET state = 'done', updated_at = time::now()")
            .bind(("id", job_id.to_string()))
            .await?;
        Ok(())
    }

    /// Retry with backoff if attempts remain, otherwise dead-letter (§4.9a).
    pub async fn mark_failed(
        db: &SurrealDbClient,
        job_id: &str,
        error_info: &str,
        retry_delay_secs: i64,
        max_attempts: u32,
    ) -> Result<(), AppError> {
        let job = db
            .get_item::<Self>(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(job_id.to_string()))?;

        let attempts = job.attempts + 1;
        if attempts < max_attempts {
            let available_at = chrono::Utc::now() + chrono::Duration::seconds(retry_delay_secs);
            db.client
                .query(
                    "UPDATE type::thing('ingest_job', $id) SET
                        state = 'queued',
                        attempts = $attempts,
                        available_at = $available_at,
                        last_error = $error,
                        locked_by = NONE,
                        locked_at = NONE,
                        updated_at = time::now()",
                )
                .bind(("id", job_id.to_string()))
                .bind(("attempts", attempts))
                .bind(("available_at", available_at))
                .bind(("error", error_info.to_string()))
                .await?;
            Ok(())
        } else {
            Self::mark_dead_letter_with_attempts(db, job_id, error_info, attempts).await
        }
    }

    pub async fn mark_dead_letter(
        db: &SurrealDbClient,
        job_id: &str,
        error_info: &str,
    ) -> Result<(), AppError> {
        let job = db
            .get_item::<Self>(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(job_id.to_string()))?;
        Self::mark_dead_letter_with_attempts(db, job_id, error_info, job.attempts).await
    }

    async fn mark_dead_letter_with_attempts(
        db: &SurrealDbClient,
        job_id: &str,
        error_info: &str,
        attempts: u32,
    ) -> Result<(), AppError> {
        db.client
            .query(
                "UPDATE type::thing('ingest_job', $id) SET
                    state = 'dead_letter',
                    attempts = $attempts,
                    last_error = $error,
                    updated_at = time::now()",
            )
            .bind(("id", job_id.to_string()))
            .bind(("attempts", attempts))
            .bind(("error", error_info.to_string()))
            .await?;
        Ok(())
    }

    pub fn can_retry(&self, max_attempts: u32) -> bool {
        self.attempts < max_attempts
    }

    pub fn lease_duration(configured_seconds: Option<i64>) -> i64 {
        configured_seconds.unwrap_or(DEFAULT_LEASE_SECS)
    }
}
