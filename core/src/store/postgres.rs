// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! A Postgres-backed [`StoreAdapter`], gated behind the `postgres` feature,
//! following the conditional-insert-inside-a-transaction idiom of the
//! teacher's `backend/src/qs/queue.rs`. Runtime-checked queries are used
//! throughout (rather than `sqlx::query!`) since this crate ships without a
//! `DATABASE_URL` to verify compile-time query metadata against.

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::errors::StoreError;

use super::{BatchPut, StoreAdapter};

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the tables this adapter expects. Intended for integration
    /// tests and first-run bootstrap; production deployments are expected
    /// to manage migrations externally.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS store_items (
                partition TEXT NOT NULL,
                sort BIGINT NOT NULL,
                item BYTEA NOT NULL,
                PRIMARY KEY (partition, sort)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS store_sequences (
                partition TEXT PRIMARY KEY,
                next_seq BIGINT NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }
}

fn map_err(err: sqlx::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

#[async_trait]
impl StoreAdapter for PostgresStore {
    async fn put(
        &self,
        partition: &str,
        sort: u64,
        item: Vec<u8>,
        if_absent: bool,
    ) -> Result<(), StoreError> {
        let sort = sort as i64;
        if if_absent {
            let result = sqlx::query(
                "INSERT INTO store_items (partition, sort, item) VALUES ($1, $2, $3) \
                 ON CONFLICT (partition, sort) DO NOTHING",
            )
            .bind(partition)
            .bind(sort)
            .bind(&item)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
            if result.rows_affected() == 0 {
                return Err(StoreError::Conflict);
            }
            Ok(())
        } else {
            sqlx::query(
                "INSERT INTO store_items (partition, sort, item) VALUES ($1, $2, $3) \
                 ON CONFLICT (partition, sort) DO UPDATE SET item = EXCLUDED.item",
            )
            .bind(partition)
            .bind(sort)
            .bind(&item)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
            Ok(())
        }
    }

    async fn get(&self, partition: &str, sort: u64) -> Result<Vec<u8>, StoreError> {
        let row = sqlx::query("SELECT item FROM store_items WHERE partition = $1 AND sort = $2")
            .bind(partition)
            .bind(sort as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?;
        row.map(|r| r.get::<Vec<u8>, _>("item"))
            .ok_or(StoreError::NotFound)
    }

    async fn range(
        &self,
        partition: &str,
        from_sort: u64,
        to_sort: Option<u64>,
    ) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let upper = to_sort.unwrap_or(u64::MAX) as i64;
        let rows = sqlx::query(
            "SELECT sort, item FROM store_items WHERE partition = $1 AND sort >= $2 AND sort <= $3 \
             ORDER BY sort ASC",
        )
        .bind(partition)
        .bind(from_sort as i64)
        .bind(upper)
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<i64, _>("sort") as u64, r.get::<Vec<u8>, _>("item")))
            .collect())
    }

    async fn batch(&self, partition: &str, ops: Vec<BatchPut>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        for op in ops {
            let sort = op.sort as i64;
            if op.if_absent {
                let result = sqlx::query(
                    "INSERT INTO store_items (partition, sort, item) VALUES ($1, $2, $3) \
                     ON CONFLICT (partition, sort) DO NOTHING",
                )
                .bind(partition)
                .bind(sort)
                .bind(&op.item)
                .execute(&mut *tx)
                .await
                .map_err(map_err)?;
                if result.rows_affected() == 0 {
                    // Rolling back happens implicitly on drop.
                    return Err(StoreError::ConditionFailed);
                }
            } else {
                sqlx::query(
                    "INSERT INTO store_items (partition, sort, item) VALUES ($1, $2, $3) \
                     ON CONFLICT (partition, sort) DO UPDATE SET item = EXCLUDED.item",
                )
                .bind(partition)
                .bind(sort)
                .bind(&op.item)
                .execute(&mut *tx)
                .await
                .map_err(map_err)?;
            }
        }
        tx.commit().await.map_err(map_err)?;
        Ok(())
    }

    async fn next_seq(&self, partition: &str) -> Result<u64, StoreError> {
        self.next_seq_range(partition, 1).await
    }

    async fn next_seq_range(&self, partition: &str, count: u64) -> Result<u64, StoreError> {
        let count = count as i64;
        let row = sqlx::query(
            r#"
            INSERT INTO store_sequences (partition, next_seq) VALUES ($1, $2)
            ON CONFLICT (partition)
            DO UPDATE SET next_seq = store_sequences.next_seq + $2
            RETURNING next_seq - $2 + 1 AS first
            "#,
        )
        .bind(partition)
        .bind(count)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(row.get::<i64, _>("first") as u64)
    }

    async fn delete(&self, partition: &str, sort: u64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM store_items WHERE partition = $1 AND sort = $2")
            .bind(partition)
            .bind(sort as i64)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }
}
