// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hierarchical IP address management backed by Postgres.
//!
//! Two levels: a parent pool hands out aligned child CIDRs, one per lab;
//! each child hands out single addresses for the lab's DNS server and
//! challenge instances. All state lives in the database so allocations
//! survive restarts. Mutations run inside a transaction holding a
//! per-parent (or per-child) advisory lock, so concurrent acquisitions
//! can never hand out overlapping prefixes or duplicate addresses.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use ipnetwork::{IpNetwork, Ipv4Network};
use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, warn};

/// IPAM errors.
#[derive(Debug, Error)]
pub enum IpamError {
    /// No free aligned block of the requested size under the parent.
    #[error("parent pool {parent} has no free /{prefix} block")]
    ParentExhausted {
        /// The parent pool.
        parent: Ipv4Network,
        /// Requested block size.
        prefix: u8,
    },

    /// Every usable host in the child is allocated.
    #[error("child CIDR {0} has no free address")]
    ChildExhausted(Ipv4Network),

    /// The requested block size does not fit the parent.
    #[error("block size /{prefix} does not fit parent {parent}")]
    InvalidBlockSize {
        /// The parent pool.
        parent: Ipv4Network,
        /// Requested block size.
        prefix: u8,
    },

    /// The prefix is not aligned to its own length.
    #[error("CIDR {0} is not aligned to its prefix length")]
    MisalignedPrefix(Ipv4Network),

    /// The child CIDR is not registered.
    #[error("unknown child CIDR {0}")]
    UnknownChild(Ipv4Network),

    /// A specific address request fell outside the child's host range.
    #[error("address {ip} is not a usable host of {child}")]
    AddressOutOfRange {
        /// The child CIDR.
        child: Ipv4Network,
        /// The requested address.
        ip: Ipv4Addr,
    },

    /// A specific address request collided with an existing allocation.
    #[error("address {0} is already allocated")]
    AddressInUse(Ipv4Addr),

    /// Only IPv4 pools are managed.
    #[error("not an IPv4 network: {0}")]
    NotIpv4(IpNetwork),

    /// The store failed.
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

/// Manager for the parent pool.
#[derive(Debug, Clone)]
pub struct IpamManager {
    pool: PgPool,
    parent: Ipv4Network,
}

impl IpamManager {
    /// Bind to (and register) the parent pool.
    pub async fn new(pool: PgPool, parent: Ipv4Network) -> Result<Self, IpamError> {
        if !is_aligned(parent) {
            return Err(IpamError::MisalignedPrefix(parent));
        }

        sqlx::query("INSERT INTO ipam_parents (cidr) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(IpNetwork::V4(parent))
            .execute(&pool)
            .await?;

        Ok(Self { pool, parent })
    }

    /// The parent pool range.
    pub fn parent(&self) -> Ipv4Network {
        self.parent
    }

    /// Reserve the lowest free aligned `/block_size` prefix under the
    /// parent and return a manager for it.
    pub async fn acquire_child_cidr(&self, block_size: u8) -> Result<ChildCidr, IpamError> {
        if block_size < self.parent.prefix() || block_size > 30 {
            return Err(IpamError::InvalidBlockSize {
                parent: self.parent,
                prefix: block_size,
            });
        }

        let mut tx = self.pool.begin().await?;
        lock_scope(&mut tx, "parent", &self.parent.to_string()).await?;

        let rows: Vec<(IpNetwork,)> =
            sqlx::query_as("SELECT cidr FROM ipam_children WHERE parent_cidr = $1")
                .bind(IpNetwork::V4(self.parent))
                .fetch_all(&mut *tx)
                .await?;

        let mut existing = Vec::with_capacity(rows.len());
        for (net,) in rows {
            existing.push(as_v4(net)?);
        }

        let child = first_free_subnet(self.parent, &existing, block_size).ok_or(
            IpamError::ParentExhausted {
                parent: self.parent,
                prefix: block_size,
            },
        )?;

        sqlx::query("INSERT INTO ipam_children (cidr, parent_cidr) VALUES ($1, $2)")
            .bind(IpNetwork::V4(child))
            .bind(IpNetwork::V4(self.parent))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(child = %child, parent = %self.parent, "acquired child CIDR");

        Ok(ChildCidr {
            pool: self.pool.clone(),
            cidr: child,
        })
    }

    /// Free a child and all its single-IP allocations. Idempotent: a
    /// double release is reported but does not fail.
    pub async fn release_child_cidr(&self, cidr: Ipv4Network) -> Result<(), IpamError> {
        let result = sqlx::query("DELETE FROM ipam_children WHERE cidr = $1")
            .bind(IpNetwork::V4(cidr))
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            warn!(child = %cidr, "release of unknown child CIDR");
        } else {
            debug!(child = %cidr, "released child CIDR");
        }

        Ok(())
    }

    /// Rebind a manager to an existing child (restore path).
    pub async fn get_child_cidr(&self, cidr: Ipv4Network) -> Result<ChildCidr, IpamError> {
        if !is_aligned(cidr) {
            return Err(IpamError::MisalignedPrefix(cidr));
        }

        let exists: Option<(IpNetwork,)> =
            sqlx::query_as("SELECT cidr FROM ipam_children WHERE cidr = $1")
                .bind(IpNetwork::V4(cidr))
                .fetch_optional(&self.pool)
                .await?;

        if exists.is_none() {
            return Err(IpamError::UnknownChild(cidr));
        }

        Ok(ChildCidr {
            pool: self.pool.clone(),
            cidr,
        })
    }
}

/// Manager for one child CIDR.
#[derive(Debug, Clone)]
pub struct ChildCidr {
    pool: PgPool,
    cidr: Ipv4Network,
}

impl ChildCidr {
    /// The child's prefix.
    pub fn cidr(&self) -> Ipv4Network {
        self.cidr
    }

    /// The first usable host (network + 1), reserved by convention for
    /// the lab's DNS server.
    pub fn first_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.cidr.network()) + 1)
    }

    /// Allocate an address inside the child: the given `specific` address,
    /// or the lowest free usable host.
    pub async fn acquire_single_ip(
        &self,
        specific: Option<Ipv4Addr>,
    ) -> Result<Ipv4Addr, IpamError> {
        let mut tx = self.pool.begin().await?;
        lock_scope(&mut tx, "child", &self.cidr.to_string()).await?;

        let rows: Vec<(IpNetwork,)> =
            sqlx::query_as("SELECT ip FROM ipam_addresses WHERE child_cidr = $1")
                .bind(IpNetwork::V4(self.cidr))
                .fetch_all(&mut *tx)
                .await?;

        let mut used = HashSet::with_capacity(rows.len());
        for (ip,) in rows {
            match ip.ip() {
                std::net::IpAddr::V4(v4) => used.insert(v4),
                std::net::IpAddr::V6(_) => return Err(IpamError::NotIpv4(ip)),
            };
        }

        let ip = match specific {
            Some(ip) => {
                if !host_range(self.cidr).contains(&u32::from(ip)) {
                    return Err(IpamError::AddressOutOfRange {
                        child: self.cidr,
                        ip,
                    });
                }
                if used.contains(&ip) {
                    return Err(IpamError::AddressInUse(ip));
                }
                ip
            }
            None => {
                first_free_host(self.cidr, &used).ok_or(IpamError::ChildExhausted(self.cidr))?
            }
        };

        sqlx::query("INSERT INTO ipam_addresses (child_cidr, ip) VALUES ($1, $2)")
            .bind(IpNetwork::V4(self.cidr))
            .bind(IpNetwork::V4(Ipv4Network::new(ip, 32).expect("/32 is valid")))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(ip = %ip, child = %self.cidr, "acquired address");

        Ok(ip)
    }

    /// Free a single address. Idempotent: a double release is reported
    /// but does not fail.
    pub async fn release_single_ip(&self, ip: Ipv4Addr) -> Result<(), IpamError> {
        let result = sqlx::query("DELETE FROM ipam_addresses WHERE child_cidr = $1 AND ip = $2")
            .bind(IpNetwork::V4(self.cidr))
            .bind(IpNetwork::V4(Ipv4Network::new(ip, 32).expect("/32 is valid")))
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            warn!(ip = %ip, child = %self.cidr, "release of unallocated address");
        } else {
            debug!(ip = %ip, child = %self.cidr, "released address");
        }

        Ok(())
    }
}

/// Serialize allocations per parent/child with a transaction-scoped
/// advisory lock keyed by the scope name and CIDR text.
async fn lock_scope(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    scope: &str,
    key: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(format!("ipam:{scope}:{key}"))
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn as_v4(net: IpNetwork) -> Result<Ipv4Network, IpamError> {
    match net {
        IpNetwork::V4(v4) => Ok(v4),
        IpNetwork::V6(_) => Err(IpamError::NotIpv4(net)),
    }
}

/// True when the address equals the network address of its prefix.
fn is_aligned(net: Ipv4Network) -> bool {
    net.ip() == net.network()
}

fn block_len(prefix: u8) -> u64 {
    1u64 << (32 - prefix as u32)
}

/// Usable host addresses of a child: network + 1 up to (excluding) the
/// broadcast address.
fn host_range(cidr: Ipv4Network) -> std::ops::Range<u32> {
    let start = u32::from(cidr.network()) as u64 + 1;
    let end = u32::from(cidr.network()) as u64 + block_len(cidr.prefix()) - 1;
    (start as u32)..(end.min(u32::MAX as u64) as u32)
}

/// Lowest free aligned `/prefix` block under `parent` that overlaps no
/// existing child.
fn first_free_subnet(
    parent: Ipv4Network,
    existing: &[Ipv4Network],
    prefix: u8,
) -> Option<Ipv4Network> {
    let block = block_len(prefix);
    let parent_start = u32::from(parent.network()) as u64;
    let parent_end = parent_start + block_len(parent.prefix());

    let mut children: Vec<(u64, u64)> = existing
        .iter()
        .map(|c| {
            let start = u32::from(c.network()) as u64;
            (start, start + block_len(c.prefix()))
        })
        .collect();
    children.sort_unstable();

    let mut candidate = parent_start;
    for (start, end) in children {
        if candidate + block <= start {
            break;
        }
        if end > candidate {
            // Skip past this child, realigned to the block size
            candidate = end.div_ceil(block) * block;
        }
    }

    if candidate + block <= parent_end {
        Some(
            Ipv4Network::new(Ipv4Addr::from(candidate as u32), prefix)
                .expect("aligned candidate within parent"),
        )
    } else {
        None
    }
}

/// Lowest usable host of `cidr` not present in `used`.
fn first_free_host(cidr: Ipv4Network, used: &HashSet<Ipv4Addr>) -> Option<Ipv4Addr> {
    host_range(cidr)
        .map(Ipv4Addr::from)
        .find(|ip| !used.contains(ip))
}
