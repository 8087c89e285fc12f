// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Catalog of provisioned laboratories.
//!
//! The `laboratory` table is the durable authority for lab existence: a
//! row exists iff the lab was created end-to-end, and the table is the
//! source of truth when restoring orchestrator state on boot.

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use sqlx::PgPool;
use uuid::Uuid;

/// Laboratory record from the catalog.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Laboratory {
    /// Lab identity; also the namespace and IP-pool name.
    pub id: Uuid,
    /// Cohort for batch selection; zero when the lab belongs to no group.
    pub group_id: Uuid,
    /// The lab's child CIDR.
    pub cidr: IpNetwork,
    /// When the lab was created.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

/// Insert a laboratory row. `id` uniqueness is enforced by the database.
pub async fn create_laboratory(
    pool: &PgPool,
    id: Uuid,
    group_id: Uuid,
    cidr: IpNetwork,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO laboratory (id, group_id, cidr, created_at, updated_at)
        VALUES ($1, $2, $3, now(), now())
        "#,
    )
    .bind(id)
    .bind(group_id)
    .bind(cidr)
    .execute(pool)
    .await?;

    Ok(())
}

/// Delete a laboratory row; returns the number of rows removed.
pub async fn delete_laboratory(pool: &PgPool, id: Uuid) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM laboratory WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

/// Fetch one laboratory row.
pub async fn get_laboratory(pool: &PgPool, id: Uuid) -> Result<Option<Laboratory>, sqlx::Error> {
    sqlx::query_as::<_, Laboratory>(
        r#"
        SELECT id, group_id, cidr, created_at, updated_at
        FROM laboratory
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// List every laboratory.
pub async fn list_laboratories(pool: &PgPool) -> Result<Vec<Laboratory>, sqlx::Error> {
    sqlx::query_as::<_, Laboratory>(
        r#"
        SELECT id, group_id, cidr, created_at, updated_at
        FROM laboratory
        ORDER BY created_at
        "#,
    )
    .fetch_all(pool)
    .await
}

/// List the laboratories of one group.
pub async fn list_laboratories_by_group(
    pool: &PgPool,
    group_id: Uuid,
) -> Result<Vec<Laboratory>, sqlx::Error> {
    sqlx::query_as::<_, Laboratory>(
        r#"
        SELECT id, group_id, cidr, created_at, updated_at
        FROM laboratory
        WHERE group_id = $1
        ORDER BY created_at
        "#,
    )
    .bind(group_id)
    .fetch_all(pool)
    .await
}
