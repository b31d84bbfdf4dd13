//! Client set resolution.
//!
//! Turns the task section of a job (`null`, a list of roles, or a map of role
//! to options) plus any `overrides` into the concrete list of clients, each
//! with its host and merged options.

use serde_json::{Map, Value};
use std::collections::HashSet;

use crate::config::HostEntry;
use crate::error::{MountError, MountResult};
use crate::types::{ClientId, HostName, CLIENT_ROLE_PREFIX};
use crate::utils::merge_json_objects;

/// A client as produced by a resolver, before validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedClient {
    pub id: ClientId,
    pub host: HostName,
    /// Merged per-client options, still untyped.
    pub config: Value,
}

/// Produces the client set for one run.
pub trait ClientResolver: Send + Sync {
    fn resolve(&self, task_config: &Value, overrides: &Value) -> MountResult<Vec<ResolvedClient>>;
}

/// Resolves clients against a fixed host inventory.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    cluster: Vec<HostEntry>,
}

impl StaticResolver {
    pub fn new(cluster: Vec<HostEntry>) -> Self {
        Self { cluster }
    }

    fn client_roles(&self) -> impl Iterator<Item = (ClientId, &HostName)> + '_ {
        self.cluster.iter().flat_map(|entry| {
            entry
                .roles
                .iter()
                .map(ClientId::new)
                .filter(ClientId::is_client_role)
                .map(move |id| (id, &entry.host))
        })
    }

    /// Normalize the task section into a role -> options map.
    fn selection(&self, task_config: &Value) -> MountResult<Map<String, Value>> {
        match task_config {
            Value::Null => Ok(self
                .client_roles()
                .map(|(id, _)| (id.into_inner(), Value::Null))
                .collect()),
            Value::Array(roles) => roles
                .iter()
                .map(|role| match role {
                    Value::String(name) => Ok((name.clone(), Value::Null)),
                    other => Err(MountError::InvalidConfig {
                        client: ClientId::new(other.to_string()),
                        reason: "client list entries must be role names".to_string(),
                    }),
                })
                .collect(),
            Value::Object(map) => Ok(map.clone()),
            other => Err(MountError::InvalidConfig {
                client: ClientId::new(CLIENT_ROLE_PREFIX.trim_end_matches('.')),
                reason: format!("expected null, a list or a map of clients, got {}", other),
            }),
        }
    }
}

impl ClientResolver for StaticResolver {
    fn resolve(&self, task_config: &Value, overrides: &Value) -> MountResult<Vec<ResolvedClient>> {
        let merged = merge_json_objects(Value::Object(self.selection(task_config)?), overrides.clone());
        let Value::Object(selected) = merged else {
            return Err(MountError::InvalidConfig {
                client: ClientId::new(CLIENT_ROLE_PREFIX.trim_end_matches('.')),
                reason: "overrides must be a map of clients".to_string(),
            });
        };

        let known: HashSet<ClientId> = self.client_roles().map(|(id, _)| id).collect();
        for role in selected.keys() {
            let id = ClientId::new(role.as_str());
            if !id.is_client_role() {
                return Err(MountError::InvalidConfig {
                    client: id,
                    reason: "not a client role".to_string(),
                });
            }
            if !known.contains(&id) {
                return Err(MountError::InvalidConfig {
                    client: id,
                    reason: "role is not assigned to any host".to_string(),
                });
            }
        }

        Ok(self
            .client_roles()
            .filter_map(|(id, host)| {
                selected.get(id.as_str()).map(|config| ResolvedClient {
                    config: config.clone(),
                    host: host.clone(),
                    id,
                })
            })
            .collect())
    }
}
