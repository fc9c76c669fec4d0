//! Service containers: image, creation, file copies, start and removal

use std::collections::HashMap;
use std::path::Path;

use bollard::container::{
    Config, CreateContainerOptions, NetworkingConfig, RemoveContainerOptions,
    StartContainerOptions, UploadToContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{EndpointSettings, HostConfig};
use bollard::Docker;
use futures::TryStreamExt;
use tracing::{debug, info};

use super::readiness::{self, PortSpec};
use super::Service;
use crate::config::{FileConfig, ServiceConfig, WaitConfig};
use crate::context::RunContext;
use crate::error::{Error, Result};

/// Pull an image unless it is already present
async fn ensure_image(docker: &Docker, image: &str) -> Result<()> {
    match docker.inspect_image(image).await {
        Ok(_) => {
            debug!("Image {} is present", image);
            return Ok(());
        }
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        }) => {}
        Err(e) => return Err(Error::docker(format!("inspecting image {}", image), e)),
    }

    info!("Pulling {}", image);
    let options = CreateImageOptions {
        from_image: image.to_string(),
        ..Default::default()
    };
    docker
        .create_image(Some(options), None, None)
        .try_collect::<Vec<_>>()
        .await
        .map_err(|e| Error::docker(format!("pulling {}", image), e))?;
    Ok(())
}

/// Create (but do not start) a service container on the run's network
pub async fn create(ctx: &RunContext, network: &str, config: &ServiceConfig) -> Result<Service> {
    let docker = ctx.docker();
    ensure_image(docker, &config.image).await?;

    let name = format!("wgcheck-{}-{}", ctx.short_id(), config.role);
    let exposed_ports = config
        .exposed_ports
        .iter()
        .map(|port| {
            port.parse::<PortSpec>()
                .map(|spec| (spec.to_string(), HashMap::new()))
        })
        .collect::<Result<HashMap<_, _>>>()?;

    let host_config = HostConfig {
        publish_all_ports: Some(true),
        network_mode: Some(network.to_string()),
        cap_add: (!config.cap_add.is_empty()).then(|| config.cap_add.clone()),
        sysctls: (!config.sysctls.is_empty())
            .then(|| config.sysctls.clone().into_iter().collect()),
        binds: (!config.binds.is_empty()).then(|| config.binds.clone()),
        ..Default::default()
    };
    let endpoint = EndpointSettings {
        aliases: (!config.aliases.is_empty()).then(|| config.aliases.clone()),
        ..Default::default()
    };
    let body = Config {
        image: Some(config.image.clone()),
        exposed_ports: Some(exposed_ports),
        labels: Some(ctx.labels()),
        host_config: Some(host_config),
        networking_config: Some(NetworkingConfig {
            endpoints_config: HashMap::from([(network.to_string(), endpoint)]),
        }),
        ..Default::default()
    };

    let options = CreateContainerOptions {
        name: name.clone(),
        platform: None,
    };
    let response = docker
        .create_container(Some(options), body)
        .await
        .map_err(|e| Error::docker(format!("creating {}", name), e))?;
    for warning in &response.warnings {
        debug!("{}: {}", name, warning);
    }
    info!("Created {} ({}) from {}", name, &response.id[..12.min(response.id.len())], config.image);

    Ok(Service {
        id: response.id,
        name,
        role: config.role.clone(),
    })
}

/// Copy the configured files in, start the container and wait until it is
/// ready
pub async fn start(
    ctx: &RunContext,
    service: &Service,
    config: &ServiceConfig,
    wait: &WaitConfig,
) -> Result<()> {
    let docker = ctx.docker();
    if !config.files.is_empty() {
        let archive = archive(&config.files)?;
        let options = UploadToContainerOptions {
            path: "/".to_string(),
            ..Default::default()
        };
        docker
            .upload_to_container(&service.id, Some(options), archive.into())
            .await
            .map_err(|e| Error::docker(format!("copying files into {}", service.name), e))?;
    }

    docker
        .start_container(&service.id, None::<StartContainerOptions<String>>)
        .await
        .map_err(|e| Error::docker(format!("starting {}", service.name), e))?;
    info!("Started {}", service.name);

    let port: PortSpec = config.ready_port.parse()?;
    readiness::wait_for_port(ctx, service, port, wait).await
}

/// Force-remove a container along with its anonymous volumes
pub async fn remove(docker: &Docker, service: &Service) -> std::result::Result<(), bollard::errors::Error> {
    let options = RemoveContainerOptions {
        force: true,
        v: true,
        ..Default::default()
    };
    docker.remove_container(&service.id, Some(options)).await?;
    info!("Removed {}", service.name);
    Ok(())
}

/// Build a tar archive placing each file at its absolute target path
fn archive(files: &[FileConfig]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for file in files {
        let contents = std::fs::read(&file.source).map_err(|e| {
            Error::Provisioning(format!("cannot read {}: {}", file.source.display(), e))
        })?;
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(file.mode);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);
        let target = Path::new(file.target.trim_start_matches('/'));
        builder
            .append_data(&mut header, target, contents.as_slice())
            .map_err(|e| Error::Provisioning(format!("cannot archive {}: {}", file.target, e)))?;
    }
    builder
        .into_inner()
        .map_err(|e| Error::Provisioning(format!("cannot archive files: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_archive_keeps_mode_and_path() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("wg0.conf");
        std::fs::write(&source, "[Interface]\n").unwrap();

        let files = vec![FileConfig {
            source,
            target: "/etc/wireguard/wg0.conf".into(),
            mode: 0o400,
        }];
        let bytes = archive(&files).unwrap();

        let mut archive = tar::Archive::new(bytes.as_slice());
        let mut entries = archive.entries().unwrap();
        let mut entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_str(), Some("etc/wireguard/wg0.conf"));
        assert_eq!(entry.header().mode().unwrap(), 0o400);
        assert_eq!(entry.header().uid().unwrap(), 0);

        let mut contents = String::new();
        entry.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "[Interface]\n");
        drop(entry);
        assert!(entries.next().is_none());
    }

    #[test]
    fn test_archive_missing_source() {
        let files = vec![FileConfig {
            source: "/nonexistent/wg0.conf".into(),
            target: "/etc/wireguard/wg0.conf".into(),
            mode: 0o400,
        }];
        assert!(matches!(archive(&files), Err(Error::Provisioning(_))));
    }
}
