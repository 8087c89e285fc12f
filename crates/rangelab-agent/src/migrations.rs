// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for the rangelab agent.
//!
//! Versioned SQL files are embedded at compile time and applied in order
//! before the agent serves traffic. History is recorded in
//! `agent_schema_migrations`; already-applied versions are skipped, so
//! calling [`run`] repeatedly is safe.

use sqlx::PgPool;
use tracing::info;

const MIGRATIONS: &[(i64, &str, &str)] = &[
    (
        1,
        "laboratories",
        include_str!("../migrations/0001_laboratories.sql"),
    ),
    (2, "ipam", include_str!("../migrations/0002_ipam.sql")),
];

/// Apply all pending migrations.
pub async fn run(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(
        r#"
        CREATE TABLE IF NOT EXISTS agent_schema_migrations (
            version    BIGINT PRIMARY KEY,
            name       TEXT NOT NULL,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    for (version, name, sql) in MIGRATIONS {
        let applied: Option<(i64,)> =
            sqlx::query_as("SELECT version FROM agent_schema_migrations WHERE version = $1")
                .bind(version)
                .fetch_optional(pool)
                .await?;

        if applied.is_some() {
            continue;
        }

        let mut tx = pool.begin().await?;
        sqlx::raw_sql(sql).execute(&mut *tx).await?;
        sqlx::query("INSERT INTO agent_schema_migrations (version, name) VALUES ($1, $2)")
            .bind(version)
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(version, name, "applied migration");
    }

    Ok(())
}
