//! Check runner
//!
//! Sequences the steps of one run and always unwinds the release stack,
//! whatever step failed.

use tracing::{error, info, warn, Instrument};

use crate::config::CheckConfig;
use crate::context::RunContext;
use crate::error::{describe, Result};
use crate::provision;
use crate::render;
use crate::teardown::ReleaseStack;
use crate::verify::{self, Verification};

/// Run the whole check once and release everything it acquired
pub async fn run(ctx: &RunContext, config: &CheckConfig) -> Result<Verification> {
    async {
        config.validate()?;
        info!("Starting check");

        let mut releases = ReleaseStack::new();
        let outcome = steps(ctx, config, &mut releases).await;

        let failures = releases.release_all().await;
        if !failures.is_empty() {
            warn!("Teardown finished with {} failure(s)", failures.len());
        }
        outcome
    }
    .instrument(ctx.span().clone())
    .await
}

async fn steps(
    ctx: &RunContext,
    config: &CheckConfig,
    releases: &mut ReleaseStack,
) -> Result<Verification> {
    let environment = provision::acquire(ctx, config, releases).await?;
    let (host, port) = environment
        .gateway_endpoint(ctx, &config.tunnel.port)
        .await?;

    let workspace = ctx.create_workspace()?;
    let config_path = workspace.path().join(&config.tunnel.output_name);
    releases.push(format!("workspace {}", workspace.path().display()), move || async move {
        workspace.close().map_err(Into::into)
    });

    render::render(&host, port, &config.tunnel.template, &config_path)?;
    verify::verify(&config_path, &config.request, releases).await
}

/// Log the outcome of a run the way the binary reports it
pub fn report(outcome: &Result<Verification>) {
    match outcome {
        Ok(verification) => info!(status = verification.status, "Check passed"),
        Err(e) => error!(step = e.step(), "Check failed: {}", describe(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use bollard::Docker;

    fn unreachable_docker() -> RunContext {
        let docker = Docker::connect_with_http("http://127.0.0.1:1", 2, bollard::API_DEFAULT_VERSION)
            .unwrap();
        RunContext::with_docker(docker)
    }

    #[tokio::test]
    async fn test_invalid_settings_fail_before_provisioning() {
        let mut config = CheckConfig::default();
        config.request.path = "no-slash".into();
        let err = run(&unreachable_docker(), &config).await.unwrap_err();
        assert!(matches!(err, Error::Settings(_)));
    }

    #[tokio::test]
    async fn test_docker_unavailable_is_provisioning_error() {
        let err = run(&unreachable_docker(), &CheckConfig::default())
            .await
            .unwrap_err();
        assert!(err.is_provisioning(), "{err}");
        assert!(matches!(err, Error::Docker { .. }));
    }
}
