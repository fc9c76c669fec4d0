//! Environment Provisioner
//!
//! Brings up the per-run Docker network with the origin and gateway
//! containers on it, and registers every piece on the release stack as soon
//! as it exists.

pub mod network;
pub mod readiness;
pub mod service;

use bollard::models::ContainerInspectResponse;
use tracing::info;

pub use readiness::{PortSpec, Protocol};

use crate::config::CheckConfig;
use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::teardown::ReleaseStack;

/// A created service container
#[derive(Debug, Clone)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub role: String,
}

/// The running environment of one check
#[derive(Debug, Clone)]
pub struct Environment {
    pub network: String,
    pub origin: Service,
    pub gateway: Service,
}

/// Create the network and both services and wait until they are ready.
///
/// Services are created and started concurrently. Each resource is pushed
/// onto `releases` as soon as it exists, so a failure part way through
/// leaves nothing behind once the stack is released.
pub async fn acquire(
    ctx: &RunContext,
    config: &CheckConfig,
    releases: &mut ReleaseStack,
) -> Result<Environment> {
    let network = network::create(ctx).await?;
    {
        let docker = ctx.docker().clone();
        let name = network.clone();
        releases.push(format!("network {}", network), move || async move {
            network::remove(&docker, &name).await.map_err(Into::into)
        });
    }

    let (origin, gateway) = tokio::join!(
        service::create(ctx, &network, &config.origin),
        service::create(ctx, &network, &config.gateway),
    );
    for created in [&origin, &gateway].into_iter().flatten() {
        let docker = ctx.docker().clone();
        let container = created.clone();
        releases.push(format!("container {}", created.name), move || async move {
            service::remove(&docker, &container).await.map_err(Into::into)
        });
    }
    let (origin, gateway) = (origin?, gateway?);

    let (origin_ready, gateway_ready) = tokio::join!(
        service::start(ctx, &origin, &config.origin, &config.wait),
        service::start(ctx, &gateway, &config.gateway, &config.wait),
    );
    origin_ready?;
    gateway_ready?;

    info!("Environment ready on {}", network);
    Ok(Environment {
        network,
        origin,
        gateway,
    })
}

impl Environment {
    /// Host and published port under which the gateway's `port` is
    /// reachable from here
    pub async fn gateway_endpoint(&self, ctx: &RunContext, port: &str) -> Result<(String, u16)> {
        let spec: PortSpec = port.parse()?;
        let inspect = ctx
            .docker()
            .inspect_container(&self.gateway.id, None)
            .await
            .map_err(|e| Error::docker(format!("inspecting {}", self.gateway.name), e))?;
        let host_port = published_port(&inspect, spec).ok_or_else(|| {
            Error::Provisioning(format!(
                "{} has no published host port for {}",
                self.gateway.name, spec
            ))
        })?;
        info!("Gateway endpoint is {}:{}", ctx.docker_host(), host_port);
        Ok((ctx.docker_host().to_string(), host_port))
    }
}

/// Host port Docker published for a container port, preferring the IPv4
/// binding
pub fn published_port(inspect: &ContainerInspectResponse, spec: PortSpec) -> Option<u16> {
    let bindings = inspect
        .network_settings
        .as_ref()?
        .ports
        .as_ref()?
        .get(&spec.to_string())?
        .as_ref()?;
    let is_v4 = |ip: &Option<String>| ip.as_deref().map_or(true, |ip| !ip.contains(':'));
    bindings
        .iter()
        .filter(|b| is_v4(&b.host_ip))
        .chain(bindings.iter())
        .find_map(|b| b.host_port.as_deref()?.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{NetworkSettings, PortBinding};
    use std::collections::HashMap;

    fn binding(ip: &str, port: &str) -> PortBinding {
        PortBinding {
            host_ip: Some(ip.to_string()),
            host_port: Some(port.to_string()),
        }
    }

    #[test]
    fn test_published_port() {
        let inspect = ContainerInspectResponse {
            network_settings: Some(NetworkSettings {
                ports: Some(HashMap::from([
                    (
                        "51820/udp".to_string(),
                        Some(vec![binding("::", "49160"), binding("0.0.0.0", "49161")]),
                    ),
                    ("53/tcp".to_string(), Some(vec![binding("::", "49162")])),
                    ("80/tcp".to_string(), None),
                ])),
                ..Default::default()
            }),
            ..Default::default()
        };

        assert_eq!(published_port(&inspect, "51820/udp".parse().unwrap()), Some(49161));
        assert_eq!(published_port(&inspect, PortSpec::tcp(53)), Some(49162));
        assert_eq!(published_port(&inspect, PortSpec::tcp(80)), None);
        assert_eq!(published_port(&inspect, PortSpec::tcp(443)), None);
        assert_eq!(published_port(&ContainerInspectResponse::default(), PortSpec::tcp(80)), None);
    }
}
