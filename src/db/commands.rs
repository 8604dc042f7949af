//! Agent command queue on Postgres.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::Db;
use crate::error::{Error, Result};
use crate::model::{AgentCommand, CommandStatus};
use crate::store::CommandStore;

#[async_trait]
impl CommandStore for Db {
    async fn insert(&self, command: &AgentCommand) -> Result<()> {
        self.insert_batch(std::slice::from_ref(command)).await
    }

    async fn insert_batch(&self, commands: &[AgentCommand]) -> Result<()> {
        if commands.is_empty() {
            return Ok(());
        }

        let mut ids = Vec::with_capacity(commands.len());
        let mut agents = Vec::with_capacity(commands.len());
        let mut statuses = Vec::with_capacity(commands.len());
        let mut created = Vec::with_capacity(commands.len());
        let mut payloads = Vec::with_capacity(commands.len());
        for c in commands {
            ids.push(c.id);
            agents.push(c.agent_id.clone());
            statuses.push(c.status.as_str());
            created.push(c.created_at);
            payloads.push(serde_json::to_value(&c.payload)?);
        }

        sqlx::query(
            "INSERT INTO agent_commands (command_id, agent_id, command_status, created_at, command_data)
             SELECT * FROM UNNEST($1::uuid[], $2::text[], $3::text[], $4::timestamptz[], $5::jsonb[])",
        )
        .bind(&ids)
        .bind(&agents)
        .bind(&statuses)
        .bind(&created)
        .bind(&payloads)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn poll_for_agent(&self, agent_id: &str, limit: usize) -> Result<Vec<AgentCommand>> {
        let rows: Vec<AgentCommandRow> = sqlx::query_as(
            "WITH pending AS (
                 SELECT command_id
                 FROM agent_commands
                 WHERE agent_id = $1 AND command_status = 'CREATED'
                 ORDER BY created_at
                 LIMIT $2
                 FOR UPDATE SKIP LOCKED
             )
             UPDATE agent_commands AS c
             SET command_status = 'SENT', sent_at = clock_timestamp()
             FROM pending
             WHERE c.command_id = pending.command_id
             RETURNING c.command_id, c.agent_id, c.command_status, c.created_at, c.command_data",
        )
        .bind(agent_id)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;

        let mut commands = rows
            .into_iter()
            .map(AgentCommandRow::try_into_command)
            .collect::<Result<Vec<_>>>()?;
        // RETURNING does not preserve the CTE order
        commands.sort_by_key(|c| c.created_at);
        Ok(commands)
    }

    async fn acknowledge(&self, command_id: Uuid) -> Result<()> {
        let row: Option<(String,)> = sqlx::query_as(
            "UPDATE agent_commands
             SET command_status = CASE WHEN command_status = 'SENT' THEN 'ACKNOWLEDGED' ELSE command_status END
             WHERE command_id = $1
             RETURNING command_status",
        )
        .bind(command_id)
        .fetch_optional(self.pool())
        .await?;

        match row {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(format!("command {command_id}"))),
        }
    }

    async fn get(&self, command_id: Uuid) -> Result<Option<AgentCommand>> {
        let row: Option<AgentCommandRow> = sqlx::query_as(
            "SELECT command_id, agent_id, command_status, created_at, command_data
             FROM agent_commands WHERE command_id = $1",
        )
        .bind(command_id)
        .fetch_optional(self.pool())
        .await?;

        row.map(AgentCommandRow::try_into_command).transpose()
    }

    async fn list_for_agent(&self, agent_id: &str) -> Result<Vec<AgentCommand>> {
        let rows: Vec<AgentCommandRow> = sqlx::query_as(
            "SELECT command_id, agent_id, command_status, created_at, command_data
             FROM agent_commands WHERE agent_id = $1
             ORDER BY created_at",
        )
        .bind(agent_id)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(AgentCommandRow::try_into_command)
            .collect()
    }

    async fn requeue_sent_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let rows_affected = sqlx::query(
            "UPDATE agent_commands
             SET command_status = 'CREATED', sent_at = NULL
             WHERE command_status = 'SENT' AND sent_at < $1",
        )
        .bind(cutoff)
        .execute(self.pool())
        .await?
        .rows_affected();

        Ok(rows_affected)
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct AgentCommandRow {
    command_id: Uuid,
    agent_id: String,
    command_status: String,
    created_at: DateTime<Utc>,
    command_data: serde_json::Value,
}

impl AgentCommandRow {
    fn try_into_command(self) -> Result<AgentCommand> {
        Ok(AgentCommand {
            id: self.command_id,
            agent_id: self.agent_id,
            status: self.command_status.parse::<CommandStatus>()?,
            created_at: self.created_at,
            payload: serde_json::from_value(self.command_data)?,
        })
    }
}
