//! SQLite-backed [`JobStore`] implementation.
//!
//! Each lifecycle transition is a single conditional `UPDATE ... WHERE
//! status = ?`, so two writers racing on the same job cannot both win.
//! Progress appends are a single `INSERT ... SELECT` that computes the next
//! `seq` and a timestamp no earlier than the previous entry's; SQLite's write
//! lock serializes concurrent appends for the same job.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::{invalid_state, JobStore, INTERRUPTED_MESSAGE, STARTED_MESSAGE};
use crate::error::{ErrorKind, JobError, JobFailure, JobResult};
use crate::models::{
    ms_to_datetime, now_ms, Job, JobFilter, JobOutput, JobStatus, JobSummary, JobType, Page,
    ProgressEntry, ProgressUpdate,
};

const JOB_COLUMNS: &str = "id, job_type, parameters_json, status, has_credential, created_at, \
                           started_at, finished_at, result_json, error_kind, error_message";

pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Explains why a conditional update touched no row.
    async fn diagnose(&self, id: &str, action: &'static str) -> JobError {
        let status: Result<Option<String>, sqlx::Error> =
            sqlx::query_scalar("SELECT status FROM jobs WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await;

        match status {
            Ok(Some(s)) => match s.parse::<JobStatus>() {
                Ok(status) => invalid_state(id, status, action),
                Err(e) => e,
            },
            Ok(None) => JobError::NotFound(id.to_string()),
            Err(e) => JobError::Store(e),
        }
    }

    async fn append_entry<'e, E>(
        executor: E,
        id: &str,
        update: &ProgressUpdate,
    ) -> JobResult<Option<ProgressEntry>>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        let data_json = update
            .data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let row = sqlx::query(
            r#"
            INSERT INTO job_progress (job_id, seq, at, message, data_json)
            SELECT j.id,
                   COALESCE((SELECT MAX(p.seq) FROM job_progress p WHERE p.job_id = j.id), 0) + 1,
                   MAX(?, COALESCE((SELECT MAX(p.at) FROM job_progress p WHERE p.job_id = j.id), 0)),
                   ?,
                   ?
            FROM jobs j
            WHERE j.id = ? AND j.status = 'running'
            RETURNING seq, at
            "#,
        )
        .bind(now_ms())
        .bind(&update.message)
        .bind(&data_json)
        .bind(id)
        .fetch_optional(executor)
        .await?;

        Ok(row.map(|row| ProgressEntry {
            seq: row.get("seq"),
            at: ms_to_datetime(row.get("at")),
            message: update.message.clone(),
            data: update.data.clone(),
        }))
    }
}

fn corrupt(what: &str, detail: impl std::fmt::Display) -> JobError {
    JobError::Other(anyhow::anyhow!("corrupt {} in job table: {}", what, detail))
}

fn row_to_job(row: &SqliteRow) -> JobResult<Job> {
    let job_type: String = row.get("job_type");
    let status: String = row.get("status");
    let parameters_json: String = row.get("parameters_json");
    let result_json: Option<String> = row.get("result_json");
    let error_kind: Option<String> = row.get("error_kind");
    let error_message: Option<String> = row.get("error_message");

    let job_type = job_type
        .parse::<JobType>()
        .map_err(|_| corrupt("job type", &job_type))?;
    let status = status
        .parse::<JobStatus>()
        .map_err(|_| corrupt("status", &status))?;

    let result = result_json
        .map(|s| serde_json::from_str::<JobOutput>(&s))
        .transpose()?;

    let error = match error_kind {
        Some(kind) => Some(JobFailure {
            kind: ErrorKind::parse(&kind).ok_or_else(|| corrupt("error kind", &kind))?,
            message: error_message.unwrap_or_default(),
        }),
        None => None,
    };

    Ok(Job {
        id: row.get("id"),
        job_type,
        parameters: serde_json::from_str(&parameters_json)?,
        status,
        has_credential: row.get::<i64, _>("has_credential") != 0,
        created_at: ms_to_datetime(row.get("created_at")),
        started_at: row.get::<Option<i64>, _>("started_at").map(ms_to_datetime),
        finished_at: row.get::<Option<i64>, _>("finished_at").map(ms_to_datetime),
        result,
        error,
    })
}

/// Appends `WHERE` clauses for `filter` and returns the values to bind, in order.
fn filter_clause(filter: &JobFilter) -> (String, Vec<&'static str>) {
    let mut clauses = Vec::new();
    let mut binds = Vec::new();
    if let Some(t) = filter.job_type {
        clauses.push("job_type = ?");
        binds.push(t.as_str());
    }
    if let Some(s) = filter.status {
        clauses.push("status = ?");
        binds.push(s.as_str());
    }
    if clauses.is_empty() {
        (String::new(), binds)
    } else {
        (format!(" WHERE {}", clauses.join(" AND ")), binds)
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create(
        &self,
        job_type: JobType,
        parameters: serde_json::Value,
        has_credential: bool,
    ) -> JobResult<Job> {
        let id = Uuid::new_v4().to_string();
        let created_at = now_ms();

        sqlx::query(
            r#"
            INSERT INTO jobs (id, job_type, parameters_json, status, has_credential, created_at)
            VALUES (?, ?, ?, 'pending', ?, ?)
            "#,
        )
        .bind(&id)
        .bind(job_type.as_str())
        .bind(serde_json::to_string(&parameters)?)
        .bind(has_credential as i64)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        Ok(Job {
            id,
            job_type,
            parameters,
            status: JobStatus::Pending,
            has_credential,
            created_at: ms_to_datetime(created_at),
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
        })
    }

    async fn transition_to_running(&self, id: &str) -> JobResult<Job> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE jobs SET status = 'running', started_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(now_ms())
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(self.diagnose(id, "start").await);
        }

        Self::append_entry(&mut *tx, id, &ProgressUpdate::text(STARTED_MESSAGE)).await?;
        tx.commit().await?;

        self.get(id).await
    }

    async fn append_progress(&self, id: &str, update: ProgressUpdate) -> JobResult<ProgressEntry> {
        match Self::append_entry(&self.pool, id, &update).await? {
            Some(entry) => Ok(entry),
            None => Err(self.diagnose(id, "append progress").await),
        }
    }

    async fn complete(&self, id: &str, result: JobOutput) -> JobResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs SET status = 'succeeded', finished_at = ?, result_json = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(now_ms())
        .bind(serde_json::to_string(&result)?)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(self.diagnose(id, "complete").await);
        }
        Ok(())
    }

    async fn fail(&self, id: &str, failure: JobFailure) -> JobResult<()> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs SET status = 'failed', finished_at = ?, error_kind = ?, error_message = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(now_ms())
        .bind(failure.kind.as_str())
        .bind(&failure.message)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(self.diagnose(id, "fail").await);
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> JobResult<Job> {
        let row = sqlx::query(&format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row_to_job(&row),
            None => Err(JobError::NotFound(id.to_string())),
        }
    }

    async fn progress(&self, id: &str, after_seq: Option<i64>) -> JobResult<Vec<ProgressEntry>> {
        let found: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        if found == 0 {
            return Err(JobError::NotFound(id.to_string()));
        }

        let rows = sqlx::query(
            r#"
            SELECT seq, at, message, data_json FROM job_progress
            WHERE job_id = ? AND seq > ?
            ORDER BY seq ASC
            "#,
        )
        .bind(id)
        .bind(after_seq.unwrap_or(0))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let data_json: Option<String> = row.get("data_json");
                Ok(ProgressEntry {
                    seq: row.get("seq"),
                    at: ms_to_datetime(row.get("at")),
                    message: row.get("message"),
                    data: data_json.map(|s| serde_json::from_str(&s)).transpose()?,
                })
            })
            .collect()
    }

    async fn list(&self, filter: JobFilter, page: Page) -> JobResult<Vec<JobSummary>> {
        let (clause, binds) = filter_clause(&filter);
        let sql = format!(
            "SELECT {} FROM jobs{} ORDER BY seq DESC LIMIT ? OFFSET ?",
            JOB_COLUMNS, clause
        );

        let mut query = sqlx::query(&sql);
        for value in binds {
            query = query.bind(value);
        }
        let rows = query
            .bind(page.limit as i64)
            .bind(page.offset as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| row_to_job(row).map(|job| JobSummary::from(&job)))
            .collect()
    }

    async fn count(&self, filter: JobFilter) -> JobResult<u64> {
        let (clause, binds) = filter_clause(&filter);
        let sql = format!("SELECT COUNT(*) FROM jobs{}", clause);

        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for value in binds {
            query = query.bind(value);
        }
        let count = query.fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    async fn pending_ids(&self) -> JobResult<Vec<String>> {
        let ids = sqlx::query_scalar("SELECT id FROM jobs WHERE status = 'pending' ORDER BY seq ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn reconcile_interrupted(&self) -> JobResult<Vec<String>> {
        let ids = sqlx::query_scalar(
            r#"
            UPDATE jobs SET status = 'failed', finished_at = ?, error_kind = ?, error_message = ?
            WHERE status = 'running'
            RETURNING id
            "#,
        )
        .bind(now_ms())
        .bind(ErrorKind::Interrupted.as_str())
        .bind(INTERRUPTED_MESSAGE)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::{db, migrate};
    use serde_json::json;
    use tempfile::TempDir;

    async fn open(tmp: &TempDir) -> SqliteJobStore {
        let config = Config::with_db_path(tmp.path().join("jobs.sqlite"));
        let pool = db::connect(&config).await.unwrap();
        migrate::apply(&pool).await.unwrap();
        SqliteJobStore::new(pool)
    }

    #[tokio::test]
    async fn lifecycle_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp).await;

        let job = store
            .create(
                JobType::ExtractLinksOnly,
                json!({ "source": "https://example.org/collections/a" }),
                false,
            )
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        let running = store.transition_to_running(&job.id).await.unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert!(running.started_at.is_some());

        store
            .append_progress(
                &job.id,
                ProgressUpdate::with_data("page 1", json!({ "links": 20 })),
            )
            .await
            .unwrap();

        let output = JobOutput::Links {
            links: vec!["https://example.org/works/1".into()],
            file_path: None,
        };
        store.complete(&job.id, output.clone()).await.unwrap();

        let done = store.get(&job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.result, Some(output));
        assert!(done.error.is_none());
        assert!(done.finished_at.is_some());

        let log = store.progress(&job.id, None).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].message, STARTED_MESSAGE);
        assert_eq!(log[1].data, Some(json!({ "links": 20 })));
        assert!(log[0].at <= log[1].at);

        let tail = store.progress(&job.id, Some(1)).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].seq, 2);
    }

    #[tokio::test]
    async fn terminal_job_rejects_progress() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp).await;
        let job = store
            .create(JobType::GenerateLogReport, json!({}), false)
            .await
            .unwrap();
        store.transition_to_running(&job.id).await.unwrap();
        store
            .fail(&job.id, JobFailure::new(ErrorKind::AdapterError, "no log file found"))
            .await
            .unwrap();

        let err = store
            .append_progress(&job.id, ProgressUpdate::text("late"))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidState { .. }));

        let err = store.transition_to_running(&job.id).await.unwrap_err();
        assert!(matches!(err, JobError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn concurrent_appends_get_distinct_ordered_seqs() {
        let tmp = TempDir::new().unwrap();
        let store = std::sync::Arc::new(open(&tmp).await);
        let job = store
            .create(JobType::GenerateLogReport, json!({}), false)
            .await
            .unwrap();
        store.transition_to_running(&job.id).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            let id = job.id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .append_progress(&id, ProgressUpdate::text(format!("step {}", i)))
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let log = store.progress(&job.id, None).await.unwrap();
        assert_eq!(log.len(), 21);
        for (i, pair) in log.windows(2).enumerate() {
            assert_eq!(pair[0].seq, i as i64 + 1);
            assert_eq!(pair[1].seq, pair[0].seq + 1);
            assert!(pair[0].at <= pair[1].at);
        }
    }

    #[tokio::test]
    async fn records_survive_reopen_and_running_is_reconciled() {
        let tmp = TempDir::new().unwrap();
        let (running_id, pending_id) = {
            let store = open(&tmp).await;
            let a = store
                .create(JobType::GenerateLogReport, json!({}), false)
                .await
                .unwrap();
            let b = store
                .create(JobType::GenerateLogReport, json!({}), true)
                .await
                .unwrap();
            store.transition_to_running(&a.id).await.unwrap();
            store.pool().close().await;
            (a.id, b.id)
        };

        let store = open(&tmp).await;
        let ids = store.reconcile_interrupted().await.unwrap();
        assert_eq!(ids, vec![running_id.clone()]);

        let job = store.get(&running_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.unwrap().kind, ErrorKind::Interrupted);

        let pending = store.get(&pending_id).await.unwrap();
        assert!(pending.has_credential);
        assert_eq!(store.pending_ids().await.unwrap(), vec![pending_id]);
    }

    #[tokio::test]
    async fn list_filters_and_pages() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp).await;
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(
                store
                    .create(JobType::GenerateLogReport, json!({}), false)
                    .await
                    .unwrap()
                    .id,
            );
        }
        store
            .create(
                JobType::UpdateIncomplete,
                json!({ "folder_path": "/b" }),
                false,
            )
            .await
            .unwrap();

        let filter = JobFilter {
            job_type: Some(JobType::GenerateLogReport),
            status: Some(JobStatus::Pending),
        };
        assert_eq!(store.count(filter).await.unwrap(), 3);
        assert_eq!(store.count(JobFilter::default()).await.unwrap(), 4);

        let page = store.list(filter, Page { limit: 2, offset: 0 }).await.unwrap();
        let got: Vec<_> = page.iter().map(|s| s.id.clone()).collect();
        assert_eq!(got, vec![ids[2].clone(), ids[1].clone()]);

        let rest = store.list(filter, Page { limit: 2, offset: 2 }).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, ids[0]);
    }

    #[tokio::test]
    async fn missing_job_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = open(&tmp).await;
        assert!(matches!(
            store.get("missing").await,
            Err(JobError::NotFound(_))
        ));
        assert!(matches!(
            store.progress("missing", None).await,
            Err(JobError::NotFound(_))
        ));
        assert!(matches!(
            store
                .complete(
                    "missing",
                    JobOutput::Report {
                        file_path: "x".into()
                    }
                )
                .await,
            Err(JobError::NotFound(_))
        ));
    }
}
