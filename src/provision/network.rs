//! Per-run Docker network

use bollard::network::CreateNetworkOptions;
use bollard::Docker;
use tracing::info;

use crate::context::RunContext;
use crate::error::{Error, Result};

/// Create the isolated bridge network for this run and return its name
pub async fn create(ctx: &RunContext) -> Result<String> {
    let name = format!("wgcheck-{}", ctx.run_id());
    let options = CreateNetworkOptions {
        name: name.clone(),
        check_duplicate: true,
        driver: "bridge".to_string(),
        labels: ctx.labels(),
        ..Default::default()
    };
    ctx.docker()
        .create_network(options)
        .await
        .map_err(|e| Error::docker(format!("creating network {}", name), e))?;
    info!("Created network {}", name);
    Ok(name)
}

/// Remove a network. Containers attached to it must be gone already.
pub async fn remove(docker: &Docker, name: &str) -> std::result::Result<(), bollard::errors::Error> {
    docker.remove_network(name).await?;
    info!("Removed network {}", name);
    Ok(())
}
