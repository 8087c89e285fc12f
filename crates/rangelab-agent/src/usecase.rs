// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Batch fan-out over the worker pool.
//!
//! Every batch RPC resolves its target lab set, dispatches one worker
//! task per `(lab, operation)` and waits on all of them; per-lab
//! failures are collected into one aggregate error. A duplicate keyed
//! task unblocks its waiter without failing the batch: the operation is
//! already in flight.

use std::sync::{Arc, Mutex};

use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, MultiError, Result};
use crate::model::{ChallengeConfig, FlagEnvVariable, Lab, LabStatus};
use crate::service::Service;
use crate::worker::{Task, TaskOutcome, Worker, WorkerError};

/// Dependencies for [`UseCase::new`].
pub struct Dependencies {
    pub service: Arc<Service>,
    pub worker: Arc<Worker>,
}

/// Fan-out layer between the RPC surface and the services.
pub struct UseCase {
    service: Arc<Service>,
    worker: Arc<Worker>,
}

impl UseCase {
    pub fn new(deps: Dependencies) -> Self {
        Self {
            service: deps.service,
            worker: deps.worker,
        }
    }

    /// Resolve the target lab set: with a group, enumerate the catalog by
    /// group and intersect with the explicit IDs (no IDs means the whole
    /// group); without one, use the explicit IDs as-is.
    async fn resolve_lab_ids(&self, group_id: Uuid, lab_ids: &[String]) -> Result<Vec<Uuid>> {
        let mut explicit = Vec::with_capacity(lab_ids.len());
        for raw in lab_ids {
            explicit.push(
                Uuid::parse_str(raw)
                    .map_err(|_| Error::InvalidArgument(format!("invalid lab id: {raw}")))?,
            );
        }

        if group_id.is_nil() {
            return Ok(explicit);
        }

        let group = self.service.lab.stored_lab_ids_by_group(group_id).await?;
        if explicit.is_empty() {
            return Ok(group);
        }

        Ok(group.into_iter().filter(|id| explicit.contains(id)).collect())
    }

    /// Dispatch one keyed task per lab and wait for the whole batch.
    async fn fan_out<F, Fut>(&self, lab_ids: Vec<Uuid>, operation: &'static str, run: F) -> Result<()>
    where
        F: Fn(Uuid) -> Fut,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let mut waiters = Vec::with_capacity(lab_ids.len());
        for id in lab_ids {
            let work = run(id);
            let (task, waiter) = Task::new()
                .with_key(id.to_string(), operation)
                .with_do(move || work)
                .with_waiter();
            self.worker.add(task);
            waiters.push(waiter);
        }

        collect_outcomes(waiters, operation).await
    }

    /// Create `count` labs with a `/mask` child CIDR each.
    pub async fn create_labs(
        &self,
        group_id: Uuid,
        subnet_mask: u8,
        count: u32,
    ) -> Result<Vec<Lab>> {
        let labs = Arc::new(Mutex::new(Vec::with_capacity(count as usize)));

        let mut waiters = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let service = self.service.clone();
            let labs = labs.clone();
            let (task, waiter) = Task::new()
                .with_do(move || async move {
                    let lab = service.lab.create_lab(subnet_mask, group_id).await?;
                    labs.lock().expect("lab list poisoned").push(lab);
                    Ok(())
                })
                .with_waiter();
            self.worker.add(task);
            waiters.push(waiter);
        }

        collect_outcomes(waiters, "create_labs")
            .await
            .map_err(|e| Error::platform("failed to create labs", e))?;

        let labs = std::mem::take(&mut *labs.lock().expect("lab list poisoned"));
        Ok(labs)
    }

    /// Resolve the selected labs.
    pub async fn get_labs(&self, group_id: Uuid, lab_ids: &[String]) -> Result<Vec<Lab>> {
        let ids = self.resolve_lab_ids(group_id, lab_ids).await?;
        let labs = Arc::new(Mutex::new(Vec::with_capacity(ids.len())));

        let service = self.service.clone();
        let labs_sink = labs.clone();
        self.fan_out(ids, "get_lab", move |id| {
            let service = service.clone();
            let labs = labs_sink.clone();
            async move {
                let lab = service.lab.get_lab(&id.to_string()).await?;
                labs.lock().expect("lab list poisoned").push(lab);
                Ok(())
            }
        })
        .await
        .map_err(|e| Error::platform("failed to get labs", e))?;

        let labs = std::mem::take(&mut *labs.lock().expect("lab list poisoned"));
        Ok(labs)
    }

    /// Delete the selected labs.
    pub async fn delete_labs(&self, group_id: Uuid, lab_ids: &[String]) -> Result<()> {
        let ids = self.resolve_lab_ids(group_id, lab_ids).await?;
        let service = self.service.clone();
        self.fan_out(ids, "delete_lab", move |id| {
            let service = service.clone();
            async move { service.lab.delete_lab(&id.to_string()).await }
        })
        .await
        .map_err(|e| Error::platform("failed to delete labs", e))
    }

    /// Start every deployment of the selected labs.
    pub async fn start_labs(&self, group_id: Uuid, lab_ids: &[String]) -> Result<()> {
        let ids = self.resolve_lab_ids(group_id, lab_ids).await?;
        let service = self.service.clone();
        self.fan_out(ids, "start_lab", move |id| {
            let service = service.clone();
            async move { service.lab.start_lab(&id.to_string()).await }
        })
        .await
        .map_err(|e| Error::platform("failed to start labs", e))
    }

    /// Stop every deployment of the selected labs.
    pub async fn stop_labs(&self, group_id: Uuid, lab_ids: &[String]) -> Result<()> {
        let ids = self.resolve_lab_ids(group_id, lab_ids).await?;
        let service = self.service.clone();
        self.fan_out(ids, "stop_lab", move |id| {
            let service = service.clone();
            async move { service.lab.stop_lab(&id.to_string()).await }
        })
        .await
        .map_err(|e| Error::platform("failed to stop labs", e))
    }

    /// Deploy the given challenges into the selected labs, merging each
    /// lab's flag env variables into its instances before dispatch.
    pub async fn add_labs_challenges(
        &self,
        group_id: Uuid,
        lab_ids: &[String],
        challenges: Vec<ChallengeConfig>,
        flag_env_variables: Vec<FlagEnvVariable>,
    ) -> Result<()> {
        let ids = self.resolve_lab_ids(group_id, lab_ids).await?;

        let service = self.service.clone();
        let challenges = Arc::new(challenges);
        let flags = Arc::new(flag_env_variables);
        self.fan_out(ids, "add_lab_challenges", move |id| {
            let service = service.clone();
            let configs = merge_flag_envs(&challenges, &flags, id);
            async move { service.lab.add_lab_challenges(&id.to_string(), configs).await }
        })
        .await
        .map_err(|e| Error::platform("failed to add challenges", e))
    }

    /// Delete the given challenges from the selected labs.
    pub async fn delete_labs_challenges(
        &self,
        group_id: Uuid,
        lab_ids: &[String],
        challenge_ids: Vec<String>,
    ) -> Result<()> {
        let ids = self.resolve_lab_ids(group_id, lab_ids).await?;
        let service = self.service.clone();
        let challenge_ids = Arc::new(challenge_ids);
        self.fan_out(ids, "delete_lab_challenges", move |id| {
            let service = service.clone();
            let challenge_ids = challenge_ids.clone();
            async move {
                service
                    .lab
                    .delete_lab_challenges(&id.to_string(), &challenge_ids)
                    .await
            }
        })
        .await
        .map_err(|e| Error::platform("failed to delete challenges", e))
    }

    /// Start the given challenges in the selected labs.
    pub async fn start_labs_challenges(
        &self,
        group_id: Uuid,
        lab_ids: &[String],
        challenge_ids: Vec<String>,
    ) -> Result<()> {
        let ids = self.resolve_lab_ids(group_id, lab_ids).await?;
        let service = self.service.clone();
        let challenge_ids = Arc::new(challenge_ids);
        self.fan_out(ids, "start_lab_challenges", move |id| {
            let service = service.clone();
            let challenge_ids = challenge_ids.clone();
            async move {
                service
                    .start_lab_challenges(&id.to_string(), &challenge_ids)
                    .await
            }
        })
        .await
        .map_err(|e| Error::platform("failed to start challenges", e))
    }

    /// Stop the given challenges in the selected labs.
    pub async fn stop_labs_challenges(
        &self,
        group_id: Uuid,
        lab_ids: &[String],
        challenge_ids: Vec<String>,
    ) -> Result<()> {
        let ids = self.resolve_lab_ids(group_id, lab_ids).await?;
        let service = self.service.clone();
        let challenge_ids = Arc::new(challenge_ids);
        self.fan_out(ids, "stop_lab_challenges", move |id| {
            let service = service.clone();
            let challenge_ids = challenge_ids.clone();
            async move {
                service
                    .stop_lab_challenges(&id.to_string(), &challenge_ids)
                    .await
            }
        })
        .await
        .map_err(|e| Error::platform("failed to stop challenges", e))
    }

    /// Reset the given challenges in the selected labs.
    pub async fn reset_labs_challenges(
        &self,
        group_id: Uuid,
        lab_ids: &[String],
        challenge_ids: Vec<String>,
    ) -> Result<()> {
        let ids = self.resolve_lab_ids(group_id, lab_ids).await?;
        let service = self.service.clone();
        let challenge_ids = Arc::new(challenge_ids);
        self.fan_out(ids, "reset_lab_challenges", move |id| {
            let service = service.clone();
            let challenge_ids = challenge_ids.clone();
            async move {
                service
                    .reset_lab_challenges(&id.to_string(), &challenge_ids)
                    .await
            }
        })
        .await
        .map_err(|e| Error::platform("failed to reset challenges", e))
    }

    /// Rebuild orchestrator state for every catalog row whose namespace
    /// is missing. Run at startup before serving traffic.
    pub async fn restore_labs_from_state(&self) -> Result<()> {
        let rows = self
            .service
            .lab
            .stored_labs()
            .await
            .map_err(|e| Error::platform("failed to list stored labs", e))?;

        let mut waiters = Vec::with_capacity(rows.len());
        for row in rows {
            let service = self.service.clone();
            let (task, waiter) = Task::new()
                .with_key(row.id.to_string(), "restore_lab")
                .with_do(move || async move { service.lab.restore_lab_if_needed(&row).await })
                .with_waiter();
            self.worker.add(task);
            waiters.push(waiter);
        }

        collect_outcomes(waiters, "restore_lab")
            .await
            .map_err(|e| Error::platform("failed to restore labs from state", e))
    }

    /// Current status snapshot for the monitoring stream.
    pub async fn get_labs_status(&self) -> Result<Vec<LabStatus>> {
        self.service.platform.get_labs_status().await
    }
}

/// Wait for a batch of task waiters and fold their failures. Duplicate
/// drops are logged and do not fail the batch.
async fn collect_outcomes(
    waiters: Vec<tokio::sync::oneshot::Receiver<TaskOutcome>>,
    operation: &'static str,
) -> Result<()> {
    let mut errs = MultiError::new();

    for waiter in waiters {
        match waiter.await {
            Ok(TaskOutcome::Completed) => {}
            Ok(TaskOutcome::Failed(Error::Worker(WorkerError::Duplicate(entity, _)))) => {
                debug!(operation, entity = %entity, "operation already in flight");
            }
            Ok(TaskOutcome::Failed(e)) => errs.push(e),
            Ok(TaskOutcome::Panicked(panic)) => errs.push(Error::Platform {
                message: format!("{operation} task panicked: {panic}"),
                source: None,
            }),
            Err(_) => errs.push(Error::Platform {
                message: format!("{operation} task was dropped"),
                source: None,
            }),
        }
    }

    errs.into_result()
}

/// Clone the challenge configs for one lab, appending the lab's flag env
/// variables to the matching instances.
fn merge_flag_envs(
    challenges: &[ChallengeConfig],
    flags: &[FlagEnvVariable],
    lab_id: Uuid,
) -> Vec<ChallengeConfig> {
    challenges
        .iter()
        .map(|challenge| {
            let instances = challenge
                .instances
                .iter()
                .map(|instance| {
                    let mut instance = instance.clone();
                    for flag in flags {
                        if flag.lab_id == lab_id
                            && flag.challenge_id == challenge.id
                            && flag.instance_id == instance.id
                        {
                            instance.envs.push(crate::model::EnvVar {
                                name: flag.variable.clone(),
                                value: flag.flag.clone(),
                            });
                        }
                    }
                    instance
                })
                .collect();

            ChallengeConfig {
                id: challenge.id.clone(),
                instances,
            }
        })
        .collect()
}
