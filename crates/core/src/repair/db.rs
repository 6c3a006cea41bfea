use sqlx::PgPool;
use uuid::Uuid;

use crate::types::{RepairStatus, RuntimeRepairRequest};

fn status_tag(status: RepairStatus) -> &'static str {
    match status {
        RepairStatus::Pending => "pending",
        RepairStatus::Succeeded => "succeeded",
        RepairStatus::Failed => "failed",
    }
}

/// Write a terminal repair attempt.
pub async fn write_attempt(
    pool: &PgPool,
    session_id: Uuid,
    request: &RuntimeRepairRequest,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO repair_attempts (session_id, attempt_id, error_id, error_kind, message, status, failure, patched_paths, started_at, finished_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
         ON CONFLICT (session_id, attempt_id) DO NOTHING",
    )
    .bind(session_id)
    .bind(i64::try_from(request.attempt_id).unwrap_or(i64::MAX))
    .bind(request.error.id)
    .bind(request.error.kind.as_str())
    .bind(&request.error.message)
    .bind(status_tag(request.status))
    .bind(&request.failure)
    .bind(serde_json::json!(request.patched_paths))
    .bind(request.started_at)
    .bind(request.finished_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Fetch recent failure reasons for the same fault, across sessions.
pub async fn fetch_failure_summaries(
    pool: &PgPool,
    kind: &str,
    message: &str,
    limit: i64,
) -> Result<Vec<String>, sqlx::Error> {
    let rows: Vec<(Option<String>,)> = sqlx::query_as(
        "SELECT failure FROM repair_attempts
         WHERE error_kind = $1 AND message = $2 AND status = 'failed' AND failure IS NOT NULL
         ORDER BY started_at DESC LIMIT $3",
    )
    .bind(kind)
    .bind(message)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().filter_map(|r| r.0).collect())
}
