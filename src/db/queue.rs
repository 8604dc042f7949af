//! Process queue on Postgres.
//!
//! The claim uses `FOR UPDATE SKIP LOCKED`, so concurrent pollers never queue
//! behind one another: each one skips rows already being claimed and takes
//! the next oldest. All timestamps come from `clock_timestamp()` so rows
//! touched within one transaction still get distinct `last_updated_at`
//! values.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{Db, map_unique_violation};
use crate::error::{Error, Result};
use crate::model::*;
use crate::store::{QueueStore, WaitCursor, WaitingProcess};

const ENTRY_COLUMNS: &str = "instance_id, created_at, process_kind, parent_instance_id, project_id, org_id, current_status, last_agent_id, wait_conditions, requirements, exclusive_group, meta, last_updated_at";

fn terminal_statuses() -> Vec<&'static str> {
    ProcessStatus::TERMINAL.iter().map(|s| s.as_str()).collect()
}

fn split_keys(keys: &[ProcessKey]) -> (Vec<Uuid>, Vec<DateTime<Utc>>) {
    keys.iter().map(|k| (k.instance_id, k.created_at)).unzip()
}

impl Db {
    async fn exists(&self, key: &ProcessKey) -> Result<bool> {
        let row: (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM process_queue WHERE instance_id = $1 AND created_at = $2)",
        )
        .bind(key.instance_id)
        .bind(key.created_at)
        .fetch_one(self.pool())
        .await?;
        Ok(row.0)
    }

    /// Zero rows touched means either a terminal row (a no-op) or no row at all.
    async fn ensure_touched(&self, key: &ProcessKey, rows_affected: u64) -> Result<()> {
        if rows_affected == 0 && !self.exists(key).await? {
            return Err(Error::NotFound(format!("process {key}")));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueStore for Db {
    async fn insert_initial(&self, new: NewProcess) -> Result<()> {
        let key = new.key();
        sqlx::query(
            "INSERT INTO process_queue (instance_id, created_at, process_kind, parent_instance_id, project_id, org_id, current_status, requirements, exclusive_group, meta, last_updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, clock_timestamp())",
        )
        .bind(key.instance_id)
        .bind(key.created_at)
        .bind(new.kind.as_str())
        .bind(new.parent_instance_id)
        .bind(new.project_id)
        .bind(new.org_id)
        .bind(ProcessStatus::Preparing.as_str())
        .bind(&new.requirements)
        .bind(&new.exclusive_group)
        .bind(&new.meta)
        .execute(self.pool())
        .await
        .map_err(|e| map_unique_violation(e, || Error::DuplicateKey(key)))?;

        debug!(instance_id = %key, kind = %new.kind, "inserted");
        Ok(())
    }

    async fn update_status(&self, key: &ProcessKey, status: ProcessStatus) -> Result<()> {
        let rows_affected = sqlx::query(
            "UPDATE process_queue
             SET current_status = $3,
                 wait_conditions = CASE WHEN $3::text = 'SUSPENDED' THEN wait_conditions ELSE NULL END,
                 last_updated_at = clock_timestamp()
             WHERE instance_id = $1 AND created_at = $2 AND current_status <> ALL($4)",
        )
        .bind(key.instance_id)
        .bind(key.created_at)
        .bind(status.as_str())
        .bind(terminal_statuses())
        .execute(self.pool())
        .await?
        .rows_affected();

        self.ensure_touched(key, rows_affected).await
    }

    async fn update_status_batch(&self, keys: &[ProcessKey], status: ProcessStatus) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let (ids, created) = split_keys(keys);
        let rows_affected = sqlx::query(
            "UPDATE process_queue
             SET current_status = $3,
                 wait_conditions = CASE WHEN $3::text = 'SUSPENDED' THEN wait_conditions ELSE NULL END,
                 last_updated_at = clock_timestamp()
             WHERE (instance_id, created_at) IN (SELECT * FROM UNNEST($1::uuid[], $2::timestamptz[]))
               AND current_status <> ALL($4)",
        )
        .bind(&ids)
        .bind(&created)
        .bind(status.as_str())
        .bind(terminal_statuses())
        .execute(self.pool())
        .await?
        .rows_affected();

        debug!(requested = keys.len(), rows_affected, %status, "batch status update");
        Ok(())
    }

    async fn poll(
        &self,
        agent_id: &str,
        capabilities: &AgentCapabilities,
    ) -> Result<Option<ProcessQueueEntry>> {
        let row: Option<ProcessQueueRow> = sqlx::query_as(
            "WITH next AS (
                 SELECT instance_id, created_at
                 FROM process_queue
                 WHERE current_status = 'ENQUEUED'
                   AND (requirements IS NULL OR ($2::jsonb IS NOT NULL AND $2::jsonb @> requirements))
                 ORDER BY created_at, instance_id
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             UPDATE process_queue AS q
             SET current_status = 'STARTING',
                 last_agent_id = $1,
                 last_updated_at = clock_timestamp()
             FROM next
             WHERE q.instance_id = next.instance_id AND q.created_at = next.created_at
             RETURNING q.instance_id, q.created_at, q.process_kind, q.parent_instance_id, q.project_id, q.org_id,
                       q.current_status, q.last_agent_id, q.wait_conditions, q.requirements, q.exclusive_group,
                       q.meta, q.last_updated_at",
        )
        .bind(agent_id)
        .bind(&capabilities.0)
        .fetch_optional(self.pool())
        .await?;

        row.map(ProcessQueueRow::try_into_entry).transpose()
    }

    async fn update_wait(&self, key: &ProcessKey, condition: Option<WaitCondition>) -> Result<()> {
        let waits = condition.as_ref().map(serde_json::to_value).transpose()?;
        let group = match &condition {
            Some(WaitCondition::Exclusive(wait)) => Some(wait.group_key.as_str()),
            _ => None,
        };
        let rows_affected = sqlx::query(
            "UPDATE process_queue
             SET current_status = CASE
                     WHEN $3::jsonb IS NOT NULL THEN 'SUSPENDED'
                     WHEN current_status = 'SUSPENDED' THEN 'ENQUEUED'
                     ELSE current_status
                 END,
                 wait_conditions = $3,
                 exclusive_group = COALESCE($5, exclusive_group),
                 last_updated_at = clock_timestamp()
             WHERE instance_id = $1 AND created_at = $2 AND current_status <> ALL($4)",
        )
        .bind(key.instance_id)
        .bind(key.created_at)
        .bind(&waits)
        .bind(terminal_statuses())
        .bind(group)
        .execute(self.pool())
        .await?
        .rows_affected();

        self.ensure_touched(key, rows_affected).await
    }

    async fn get(&self, key: &ProcessKey) -> Result<Option<ProcessQueueEntry>> {
        let row: Option<ProcessQueueRow> = sqlx::query_as(&format!(
            "SELECT {ENTRY_COLUMNS} FROM process_queue WHERE instance_id = $1 AND created_at = $2"
        ))
        .bind(key.instance_id)
        .bind(key.created_at)
        .fetch_optional(self.pool())
        .await?;

        row.map(ProcessQueueRow::try_into_entry).transpose()
    }

    async fn get_many(&self, keys: &[ProcessKey]) -> Result<Vec<ProcessQueueEntry>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let (ids, created) = split_keys(keys);
        let rows: Vec<ProcessQueueRow> = sqlx::query_as(&format!(
            "SELECT {ENTRY_COLUMNS} FROM process_queue
             WHERE (instance_id, created_at) IN (SELECT * FROM UNNEST($1::uuid[], $2::timestamptz[]))
             ORDER BY created_at, instance_id"
        ))
        .bind(&ids)
        .bind(&created)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(ProcessQueueRow::try_into_entry).collect()
    }

    async fn get_statuses(&self, instance_ids: &[Uuid]) -> Result<HashMap<Uuid, ProcessStatus>> {
        if instance_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows: Vec<(Uuid, String)> = sqlx::query_as(
            "SELECT instance_id, current_status FROM process_queue WHERE instance_id = ANY($1)",
        )
        .bind(instance_ids)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(|(id, status)| -> Result<(Uuid, ProcessStatus)> { Ok((id, status.parse()?)) })
            .collect()
    }

    async fn find_key(&self, instance_id: Uuid) -> Result<Option<ProcessKey>> {
        let row: Option<(Uuid, DateTime<Utc>)> = sqlx::query_as(
            "SELECT instance_id, created_at FROM process_queue WHERE instance_id = $1 LIMIT 1",
        )
        .bind(instance_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(|(id, created_at)| ProcessKey::new(id, created_at)))
    }

    async fn next_wait_item(&self, after: Option<WaitCursor>) -> Result<Option<WaitingProcess>> {
        let row: Option<WaitingRow> = sqlx::query_as(
            "SELECT instance_id, created_at, project_id, last_updated_at, wait_conditions
             FROM process_queue
             WHERE current_status = 'SUSPENDED'
               AND wait_conditions IS NOT NULL
               AND ($1::timestamptz IS NULL OR (last_updated_at, instance_id) > ($1::timestamptz, $2::uuid))
             ORDER BY last_updated_at, instance_id
             LIMIT 1",
        )
        .bind(after.map(|c| c.last_updated_at))
        .bind(after.map(|c| c.instance_id))
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(|r| {
            let key = ProcessKey::new(r.instance_id, r.created_at);
            WaitingProcess {
                key,
                project_id: r.project_id,
                last_updated_at: r.last_updated_at,
                waits: decode_waits(&key, r.wait_conditions),
            }
        }))
    }

    async fn list_exclusive_group(
        &self,
        project_id: Option<Uuid>,
        group_key: &str,
    ) -> Result<Vec<ProcessQueueEntry>> {
        let rows: Vec<ProcessQueueRow> = sqlx::query_as(&format!(
            "SELECT {ENTRY_COLUMNS} FROM process_queue
             WHERE project_id IS NOT DISTINCT FROM $1
               AND exclusive_group = $2
               AND current_status <> ALL($3)
             ORDER BY created_at, instance_id"
        ))
        .bind(project_id)
        .bind(group_key)
        .bind(terminal_statuses())
        .fetch_all(self.pool())
        .await?;

        rows.into_iter().map(ProcessQueueRow::try_into_entry).collect()
    }
}

/// A row whose condition no longer decodes is handed to the watchdog as
/// `Unknown`, so the scan moves past it instead of failing on it every pass.
fn decode_waits(key: &ProcessKey, value: serde_json::Value) -> WaitCondition {
    serde_json::from_value(value).unwrap_or_else(|e| {
        warn!(instance_id = %key, error = %e, "undecodable wait condition");
        WaitCondition::Unknown
    })
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct ProcessQueueRow {
    instance_id: Uuid,
    created_at: DateTime<Utc>,
    process_kind: String,
    parent_instance_id: Option<Uuid>,
    project_id: Option<Uuid>,
    org_id: Option<Uuid>,
    current_status: String,
    last_agent_id: Option<String>,
    wait_conditions: Option<serde_json::Value>,
    requirements: Option<serde_json::Value>,
    exclusive_group: Option<String>,
    meta: serde_json::Value,
    last_updated_at: DateTime<Utc>,
}

impl ProcessQueueRow {
    fn try_into_entry(self) -> Result<ProcessQueueEntry> {
        let key = ProcessKey::new(self.instance_id, self.created_at);
        Ok(ProcessQueueEntry {
            key,
            kind: self.process_kind.parse()?,
            parent_instance_id: self.parent_instance_id,
            status: self.current_status.parse()?,
            last_agent_id: self.last_agent_id,
            wait_conditions: self.wait_conditions.map(|v| decode_waits(&key, v)),
            project_id: self.project_id,
            org_id: self.org_id,
            requirements: self.requirements,
            exclusive_group: self.exclusive_group,
            meta: self.meta,
            last_updated_at: self.last_updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct WaitingRow {
    instance_id: Uuid,
    created_at: DateTime<Utc>,
    project_id: Option<Uuid>,
    last_updated_at: DateTime<Utc>,
    wait_conditions: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn malformed_wait_condition_decodes_as_unknown() {
        let key = ProcessKey::generate();
        let bad = json!({"type": "EXCLUSIVE", "group_key": "deploy", "mode": "sideways"});
        assert_eq!(decode_waits(&key, bad), WaitCondition::Unknown);
        assert_eq!(decode_waits(&key, json!("not an object")), WaitCondition::Unknown);

        let good = serde_json::to_value(WaitCondition::process_completion([Uuid::nil()])).unwrap();
        assert_eq!(
            decode_waits(&key, good),
            WaitCondition::process_completion([Uuid::nil()])
        );
    }
}
