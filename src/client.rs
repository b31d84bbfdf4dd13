//! The immutable identity of one mount target.

use crate::config::{ClientConfig, LaunchLayout, RawClientConfig};
use crate::error::{MountError, MountResult};
use crate::resolver::ResolvedClient;
use crate::types::{ClientId, HostName, MountPoint};
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq)]
pub struct ClientSpec {
    pub id: ClientId,
    pub host: HostName,
    pub mount_point: MountPoint,
    pub config: ClientConfig,
}

impl ClientSpec {
    pub fn new(id: ClientId, host: HostName, layout: &LaunchLayout, config: ClientConfig) -> Self {
        let mount_point = MountPoint::for_client(&layout.test_dir, &layout.mount_prefix, &id);
        Self {
            id,
            host,
            mount_point,
            config,
        }
    }

    /// Validate a resolved client's options and derive its mount point.
    pub fn from_resolved(resolved: ResolvedClient, layout: &LaunchLayout) -> MountResult<Self> {
        let config = RawClientConfig::from_value(&resolved.config)
            .map_err(|e| MountError::InvalidConfig {
                client: resolved.id.clone(),
                reason: e.to_string(),
            })?
            .validate()
            .map_err(|reason| MountError::InvalidConfig {
                client: resolved.id.clone(),
                reason,
            })?;

        Ok(Self::new(resolved.id, resolved.host, layout, config))
    }
}

/// Build the client set for a run, rejecting duplicate ids.
pub fn build_client_specs(
    resolved: Vec<ResolvedClient>,
    layout: &LaunchLayout,
) -> MountResult<Vec<ClientSpec>> {
    let mut seen = HashSet::new();
    let mut specs = Vec::with_capacity(resolved.len());
    for client in resolved {
        if !seen.insert(client.id.clone()) {
            return Err(MountError::InvalidConfig {
                client: client.id,
                reason: "client listed more than once".to_string(),
            });
        }
        specs.push(ClientSpec::from_resolved(client, layout)?);
    }
    Ok(specs)
}
