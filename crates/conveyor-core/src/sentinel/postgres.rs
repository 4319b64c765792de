// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL [`StateStore`] over an arbitrary `(table, id, state)` triple.
//!
//! The table belongs to another service; only the state column is ever
//! written. Identifiers are validated once at construction because they are
//! interpolated into the SQL text. The whole row is returned as the payload
//! through `row_to_json`, so scanners see every column without this adapter
//! knowing the schema.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;

use super::check_state::{StateRow, StateStore};
use crate::config::ConfigError;
use crate::error::Result;

/// State store backed by one PostgreSQL table.
#[derive(Debug, Clone)]
pub struct PgStateStore {
    pool: PgPool,
    list_sql: String,
    cas_sql: String,
}

#[derive(sqlx::FromRow)]
struct PgStateRow {
    id: String,
    state: String,
    payload: Value,
}

impl PgStateStore {
    /// Create a store over `table`, keyed by `id_column`, with states in
    /// `state_column`. The state column must compare equal to text.
    pub fn new(pool: PgPool, table: &str, id_column: &str, state_column: &str) -> Result<Self> {
        validate_identifier(table, true)?;
        validate_identifier(id_column, false)?;
        validate_identifier(state_column, false)?;

        let list_sql = format!(
            "SELECT t.{id}::text AS id, t.{state}::text AS state, row_to_json(t)::jsonb AS payload \
             FROM {table} t \
             WHERE t.{state}::text = ANY($1) \
               AND ($2::text[] IS NULL OR t.{id}::text = ANY($2)) \
             ORDER BY t.{id} \
             OFFSET $3 LIMIT $4",
            id = id_column,
            state = state_column,
            table = table,
        );
        let cas_sql = format!(
            "UPDATE {table} SET {state} = $1 WHERE {id}::text = $2 AND {state}::text = $3",
            id = id_column,
            state = state_column,
            table = table,
        );

        Ok(Self {
            pool,
            list_sql,
            cas_sql,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn list(
        &self,
        states: &[&str],
        ids: Option<&[String]>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<StateRow>> {
        let states: Vec<String> = states.iter().map(|s| s.to_string()).collect();
        let ids: Option<Vec<String>> = ids.map(<[String]>::to_vec);

        let rows = sqlx::query_as::<_, PgStateRow>(&self.list_sql)
            .bind(states)
            .bind(ids)
            .bind(offset as i64)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|r| StateRow {
                id: r.id,
                state: r.state,
                payload: r.payload,
            })
            .collect())
    }

    async fn compare_and_set(&self, id: &str, from: &str, to: &str) -> Result<bool> {
        let result = sqlx::query(&self.cas_sql)
            .bind(to)
            .bind(id)
            .bind(from)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

/// Accepts `[A-Za-z_][A-Za-z0-9_]*`, and `schema.table` when `qualified`.
fn validate_identifier(ident: &str, qualified: bool) -> Result<()> {
    let valid_part = |part: &str| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            && part.len() <= 63
    };

    let parts: Vec<&str> = ident.split('.').collect();
    let ok = match parts.as_slice() {
        [name] => valid_part(name),
        [schema, name] if qualified => valid_part(schema) && valid_part(name),
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(ConfigError::Invalid(
            "state store identifier",
            "must be a plain SQL identifier",
        )
        .into())
    }
}
