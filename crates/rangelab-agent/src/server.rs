// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! RPC surface of the agent.
//!
//! One bidirectional stream per call. Every envelope is authenticated
//! before dispatch, for unary methods and for each monitoring prompt
//! alike. Auth failures map to `UNAUTHENTICATED`, validation failures to
//! `INVALID_ARGUMENT`, everything else to `INTERNAL` carrying the
//! aggregate error message.

use std::sync::Arc;

use rangelab_protocol::agent_proto::{
    self, RpcError, RpcRequest, RpcResponse, rpc_request, rpc_response,
};
use rangelab_protocol::frame::Frame;
use rangelab_protocol::server::{AgentServer, AgentServerConfig, ConnectionHandler, StreamHandler};
use rangelab_protocol::token;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::RpcConfig;
use crate::error::{Error, Result};
use crate::model;
use crate::usecase::UseCase;

/// Shared state of the RPC handlers.
pub struct RpcState {
    usecase: Arc<UseCase>,
    auth_key: String,
    sign_key: String,
}

impl RpcState {
    pub fn new(usecase: Arc<UseCase>, config: &RpcConfig) -> Self {
        Self {
            usecase,
            auth_key: config.auth_key.clone(),
            sign_key: config.sign_key.clone(),
        }
    }

    fn authenticate(&self, raw_token: &str) -> Result<()> {
        if raw_token.is_empty() {
            return Err(Error::Auth("missing token".to_string()));
        }
        let claims = token::verify(raw_token, &self.sign_key)
            .map_err(|e| Error::Auth(e.to_string()))?;
        if claims.auth_key != self.auth_key {
            return Err(Error::Auth("auth key mismatch".to_string()));
        }
        Ok(())
    }
}

/// Run the RPC server until the shutdown token fires.
pub async fn run(
    config: &RpcConfig,
    state: Arc<RpcState>,
    shutdown: CancellationToken,
) -> Result<()> {
    let server = build_server(config).await?;

    info!(addr = %config.addr, tls = config.tls_enabled, "RPC server starting");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                info!("RPC server received shutdown signal");
                server.close();
                break;
            }

            incoming = server.accept() => {
                let Some(incoming) = incoming else { break };
                let state = state.clone();
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(connection) => {
                            handle_connection(ConnectionHandler::new(connection), state).await;
                        }
                        Err(e) => {
                            debug!("failed to accept connection: {}", e);
                        }
                    }
                });
            }
        }
    }

    info!("RPC server stopped");
    Ok(())
}

async fn build_server(config: &RpcConfig) -> Result<AgentServer> {
    if !config.tls_enabled {
        return AgentServer::localhost(config.addr)
            .map_err(|e| Error::Transport(e.to_string()));
    }

    let cert_file = config
        .tls_cert_file
        .as_ref()
        .ok_or_else(|| Error::Transport("TLS enabled but GRPC_TLS_CERT is not set".into()))?;
    let key_file = config
        .tls_key_file
        .as_ref()
        .ok_or_else(|| Error::Transport("TLS enabled but GRPC_TLS_KEY is not set".into()))?;

    let cert_pem = tokio::fs::read(cert_file)
        .await
        .map_err(|e| Error::Transport(format!("failed to read {cert_file}: {e}")))?;
    let key_pem = tokio::fs::read(key_file)
        .await
        .map_err(|e| Error::Transport(format!("failed to read {key_file}: {e}")))?;

    let client_ca_pem = match &config.tls_ca_file {
        Some(ca_file) => Some(
            tokio::fs::read(ca_file)
                .await
                .map_err(|e| Error::Transport(format!("failed to read {ca_file}: {e}")))?,
        ),
        None => None,
    };

    AgentServer::new(AgentServerConfig {
        bind_addr: config.addr,
        cert_pem,
        key_pem,
        client_ca_pem,
        ..Default::default()
    })
    .map_err(|e| Error::Transport(e.to_string()))
}

async fn handle_connection(conn: ConnectionHandler, state: Arc<RpcState>) {
    debug!(remote = %conn.remote_address(), "connection accepted");

    conn.run(move |stream: StreamHandler| {
        let state = state.clone();
        async move {
            if let Err(e) = handle_stream(stream, state).await {
                debug!("stream ended: {}", e);
            }
        }
    })
    .await;
}

async fn handle_stream(mut stream: StreamHandler, state: Arc<RpcState>) -> Result<()> {
    let frame = stream
        .read_frame()
        .await
        .map_err(|e| Error::Transport(e.to_string()))?;
    let envelope: RpcRequest = frame
        .decode()
        .map_err(|e| Error::Transport(e.to_string()))?;

    if let Err(e) = state.authenticate(&envelope.token) {
        respond(&mut stream, rpc_response::Response::Error(map_error(&e))).await?;
        let _ = stream.finish();
        return Ok(());
    }

    let Some(request) = envelope.request else {
        let e = Error::InvalidArgument("empty request envelope".to_string());
        respond(&mut stream, rpc_response::Response::Error(map_error(&e))).await?;
        let _ = stream.finish();
        return Ok(());
    };

    if matches!(request, rpc_request::Request::Monitoring(_)) {
        return monitoring_loop(stream, state).await;
    }

    let response = match dispatch(&state, request).await {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "request failed");
            rpc_response::Response::Error(map_error(&e))
        }
    };
    respond(&mut stream, response).await?;
    let _ = stream.finish();
    Ok(())
}

/// Answer the prompt that opened the stream, then every subsequent
/// prompt, until the client goes away.
async fn monitoring_loop(mut stream: StreamHandler, state: Arc<RpcState>) -> Result<()> {
    debug!("client connected to monitoring");

    loop {
        let response = match state.usecase.get_labs_status().await {
            Ok(labs) => rpc_response::Response::Monitoring(agent_proto::MonitoringResponse {
                labs: labs.into_iter().map(lab_status_to_proto).collect(),
            }),
            Err(e) => {
                error!(error = %e, "failed to collect labs status");
                rpc_response::Response::Error(map_error(&e))
            }
        };
        respond(&mut stream, response).await?;

        let frame = match stream.read_frame().await {
            Ok(frame) => frame,
            Err(_) => {
                debug!("client disconnected from monitoring");
                return Ok(());
            }
        };
        let envelope: RpcRequest = frame
            .decode()
            .map_err(|e| Error::Transport(e.to_string()))?;
        if let Err(e) = state.authenticate(&envelope.token) {
            respond(&mut stream, rpc_response::Response::Error(map_error(&e))).await?;
            let _ = stream.finish();
            return Ok(());
        }
    }
}

async fn respond(stream: &mut StreamHandler, response: rpc_response::Response) -> Result<()> {
    let envelope = RpcResponse {
        response: Some(response),
    };
    let frame = Frame::response(&envelope).map_err(|e| Error::Transport(e.to_string()))?;
    stream
        .write_frame(&frame)
        .await
        .map_err(|e| Error::Transport(e.to_string()))
}

async fn dispatch(
    state: &RpcState,
    request: rpc_request::Request,
) -> Result<rpc_response::Response> {
    use rpc_request::Request;

    let usecase = &state.usecase;

    match request {
        Request::Ping(_) => Ok(rpc_response::Response::Ping(agent_proto::PingResponse {})),

        Request::CreateLabs(req) => {
            let group_id = parse_group_id(&req.group_id)?;
            let mask = parse_mask(req.cidr_mask)?;
            let labs = usecase.create_labs(group_id, mask, req.count).await?;
            Ok(rpc_response::Response::CreateLabs(
                agent_proto::CreateLabsResponse {
                    labs: labs.into_iter().map(lab_to_proto).collect(),
                },
            ))
        }

        Request::GetLabs(req) => {
            let group_id = parse_group_id(&req.group_id)?;
            let labs = usecase.get_labs(group_id, &req.ids).await?;
            Ok(rpc_response::Response::GetLabs(
                agent_proto::GetLabsResponse {
                    labs: labs.into_iter().map(lab_to_proto).collect(),
                },
            ))
        }

        Request::DeleteLabs(req) => {
            let group_id = parse_group_id(&req.group_id)?;
            usecase.delete_labs(group_id, &req.ids).await?;
            Ok(empty())
        }

        Request::StartLabs(req) => {
            let group_id = parse_group_id(&req.group_id)?;
            usecase.start_labs(group_id, &req.ids).await?;
            Ok(empty())
        }

        Request::StopLabs(req) => {
            let group_id = parse_group_id(&req.group_id)?;
            usecase.stop_labs(group_id, &req.ids).await?;
            Ok(empty())
        }

        Request::AddLabsChallenges(req) => {
            let group_id = parse_group_id(&req.group_id)?;
            let challenges = req.challenges.into_iter().map(challenge_from_proto).collect();
            let flags = req
                .flag_env_variables
                .into_iter()
                .map(flag_env_from_proto)
                .collect::<Result<Vec<_>>>()?;
            usecase
                .add_labs_challenges(group_id, &req.lab_ids, challenges, flags)
                .await?;
            Ok(empty())
        }

        Request::DeleteLabsChallenges(req) => {
            let group_id = parse_group_id(&req.group_id)?;
            usecase
                .delete_labs_challenges(group_id, &req.lab_ids, req.challenge_ids)
                .await?;
            Ok(empty())
        }

        Request::StartLabsChallenges(req) => {
            let group_id = parse_group_id(&req.group_id)?;
            usecase
                .start_labs_challenges(group_id, &req.lab_ids, req.challenge_ids)
                .await?;
            Ok(empty())
        }

        Request::StopLabsChallenges(req) => {
            let group_id = parse_group_id(&req.group_id)?;
            usecase
                .stop_labs_challenges(group_id, &req.lab_ids, req.challenge_ids)
                .await?;
            Ok(empty())
        }

        Request::ResetLabsChallenges(req) => {
            let group_id = parse_group_id(&req.group_id)?;
            usecase
                .reset_labs_challenges(group_id, &req.lab_ids, req.challenge_ids)
                .await?;
            Ok(empty())
        }

        Request::Monitoring(_) => {
            // Handled by the stream loop before dispatch
            Err(Error::InvalidArgument(
                "monitoring is a streaming method".to_string(),
            ))
        }
    }
}

fn empty() -> rpc_response::Response {
    rpc_response::Response::Empty(agent_proto::EmptyResponse {})
}

/// Map an error to the wire: auth first, then validation, then internal.
fn map_error(error: &Error) -> RpcError {
    let code = if error.is_auth() {
        "UNAUTHENTICATED"
    } else if error.is_invalid_argument() {
        "INVALID_ARGUMENT"
    } else {
        "INTERNAL"
    };

    RpcError {
        code: code.to_string(),
        message: error.to_string(),
    }
}

fn parse_group_id(raw: &str) -> Result<Uuid> {
    if raw.is_empty() {
        return Ok(Uuid::nil());
    }
    Uuid::parse_str(raw).map_err(|_| Error::InvalidArgument(format!("invalid group id: {raw}")))
}

fn parse_mask(mask: u32) -> Result<u8> {
    if !(8..=30).contains(&mask) {
        return Err(Error::InvalidArgument(format!(
            "cidr mask must be between 8 and 30, got {mask}"
        )));
    }
    Ok(mask as u8)
}

fn lab_to_proto(lab: model::Lab) -> agent_proto::Lab {
    agent_proto::Lab {
        id: lab.id.to_string(),
        cidr: lab.cidr().to_string(),
    }
}

fn challenge_from_proto(config: agent_proto::ChallengeConfig) -> model::ChallengeConfig {
    model::ChallengeConfig {
        id: config.id,
        instances: config
            .instances
            .into_iter()
            .map(|instance| model::InstanceConfig {
                id: instance.id,
                image: instance.image,
                resources: model::ResourcesSpec {
                    requests: resources_from_proto(instance.requests),
                    limits: resources_from_proto(instance.limits),
                },
                envs: instance
                    .envs
                    .into_iter()
                    .map(|env| model::EnvVar {
                        name: env.name,
                        value: env.value,
                    })
                    .collect(),
                records: instance
                    .records
                    .into_iter()
                    .map(|record| model::DnsRecord {
                        record_type: record.record_type,
                        name: record.name,
                        data: record.data,
                    })
                    .collect(),
            })
            .collect(),
    }
}

fn resources_from_proto(resources: Option<agent_proto::Resources>) -> model::ResourceSpec {
    resources
        .map(|r| model::ResourceSpec {
            cpu_millis: r.cpu_millis,
            memory_bytes: r.memory_bytes,
        })
        .unwrap_or_default()
}

fn flag_env_from_proto(flag: agent_proto::FlagEnvVariable) -> Result<model::FlagEnvVariable> {
    Ok(model::FlagEnvVariable {
        lab_id: Uuid::parse_str(&flag.lab_id)
            .map_err(|_| Error::InvalidArgument(format!("invalid lab id: {}", flag.lab_id)))?,
        challenge_id: flag.challenge_id,
        instance_id: flag.instance_id,
        variable: flag.variable,
        flag: flag.flag,
    })
}

fn lab_status_to_proto(status: model::LabStatus) -> agent_proto::LabStatus {
    agent_proto::LabStatus {
        id: status.id.to_string(),
        cidr: status.cidr,
        dns: Some(agent_proto::DnsStatus {
            status: status.dns.status as i32,
            reason: status.dns.reason,
            usage: Some(resources_to_proto(status.dns.usage)),
        }),
        instances: status
            .instances
            .into_iter()
            .map(|instance| agent_proto::InstanceStatus {
                id: instance.id,
                challenge_id: instance.challenge_id,
                status: instance.status as i32,
                reason: instance.reason,
                usage: Some(resources_to_proto(instance.usage)),
            })
            .collect(),
    }
}

fn resources_to_proto(spec: model::ResourceSpec) -> agent_proto::Resources {
    agent_proto::Resources {
        cpu_millis: spec.cpu_millis,
        memory_bytes: spec.memory_bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_id_parsing() {
        assert_eq!(parse_group_id("").unwrap(), Uuid::nil());

        let id = Uuid::now_v7();
        assert_eq!(parse_group_id(&id.to_string()).unwrap(), id);

        assert!(parse_group_id("not-a-uuid").is_err());
    }

    #[test]
    fn mask_bounds() {
        assert_eq!(parse_mask(26).unwrap(), 26);
        assert!(parse_mask(7).is_err());
        assert!(parse_mask(31).is_err());
    }

    #[test]
    fn error_codes() {
        assert_eq!(
            map_error(&Error::Auth("missing token".into())).code,
            "UNAUTHENTICATED"
        );
        assert_eq!(
            map_error(&Error::InvalidArgument("bad".into())).code,
            "INVALID_ARGUMENT"
        );
        assert_eq!(
            map_error(&Error::Transport("boom".into())).code,
            "INTERNAL"
        );
    }

    #[test]
    fn flag_env_requires_a_valid_lab_id() {
        let flag = agent_proto::FlagEnvVariable {
            lab_id: "nope".to_string(),
            challenge_id: "c1".to_string(),
            instance_id: "i1".to_string(),
            variable: "FLAG".to_string(),
            flag: "ctf{x}".to_string(),
        };
        assert!(flag_env_from_proto(flag).is_err());
    }
}
