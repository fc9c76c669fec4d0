//! Per-run context
//!
//! Everything a run needs from its surroundings is gathered here once and
//! passed down explicitly: the run id, the Docker client, where scratch
//! directories go and the tracing span that tags every log line.

use std::collections::HashMap;
use std::path::PathBuf;

use bollard::Docker;
use tempfile::TempDir;
use tracing::Span;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Label put on every Docker object a run creates
pub const RUN_ID_LABEL: &str = "wgcheck.run-id";

/// Context for one run of the check
pub struct RunContext {
    run_id: Uuid,
    docker: Docker,
    temp_root: PathBuf,
    docker_host: String,
    span: Span,
}

impl RunContext {
    /// Connect to the local Docker daemon (honouring `DOCKER_HOST`)
    pub fn new() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::docker("connecting to the daemon", e))?;
        Ok(Self::with_docker(docker))
    }

    /// Build a context around an existing Docker client
    pub fn with_docker(docker: Docker) -> Self {
        let run_id = Uuid::new_v4();
        let docker_host = endpoint_host(std::env::var("DOCKER_HOST").ok().as_deref());
        Self {
            run_id,
            docker,
            temp_root: std::env::temp_dir(),
            docker_host,
            span: tracing::info_span!("run", id = %run_id),
        }
    }

    /// Put scratch directories somewhere other than the system temp dir
    pub fn with_temp_root(mut self, temp_root: impl Into<PathBuf>) -> Self {
        self.temp_root = temp_root.into();
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// First block of the run id, enough to tell concurrent runs apart
    pub fn short_id(&self) -> String {
        self.run_id.simple().to_string()[..8].to_string()
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Host under which published container ports are reachable
    pub fn docker_host(&self) -> &str {
        &self.docker_host
    }

    /// Labels identifying objects created by this run
    pub fn labels(&self) -> HashMap<String, String> {
        HashMap::from([(RUN_ID_LABEL.to_string(), self.run_id.to_string())])
    }

    /// Create a fresh, private scratch directory for this run
    pub fn create_workspace(&self) -> Result<TempDir> {
        tempfile::Builder::new()
            .prefix(&format!("wgcheck-{}-", self.short_id()))
            .tempdir_in(&self.temp_root)
            .map_err(Error::Workspace)
    }
}

/// Host part of a `DOCKER_HOST` value. Unix sockets and unset values mean
/// the daemon is local.
fn endpoint_host(docker_host: Option<&str>) -> String {
    let remote = docker_host.and_then(|value| {
        ["tcp://", "http://", "https://"]
            .iter()
            .find_map(|scheme| value.strip_prefix(scheme))
    });
    let Some(rest) = remote else {
        return "localhost".to_string();
    };
    let authority = rest.split('/').next().unwrap_or_default();
    let host = if let Some(v6) = authority.strip_prefix('[') {
        v6.split(']').next().unwrap_or_default()
    } else {
        authority.rsplit_once(':').map_or(authority, |(host, _)| host)
    };
    if host.is_empty() {
        "localhost".to_string()
    } else {
        host.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_host() {
        assert_eq!(endpoint_host(None), "localhost");
        assert_eq!(endpoint_host(Some("unix:///var/run/docker.sock")), "localhost");
        assert_eq!(endpoint_host(Some("tcp://10.1.2.3:2376")), "10.1.2.3");
        assert_eq!(endpoint_host(Some("http://docker.internal:2375/")), "docker.internal");
        assert_eq!(endpoint_host(Some("tcp://[fd00::5]:2375")), "fd00::5");
        assert_eq!(endpoint_host(Some("tcp://:2375")), "localhost");
    }

    #[test]
    fn test_workspace_is_fresh() {
        // The client is lazy; nothing talks to a daemon here
        let docker = Docker::connect_with_http("http://127.0.0.1:1", 1, bollard::API_DEFAULT_VERSION)
            .unwrap();
        let root = tempfile::tempdir().unwrap();
        let ctx = RunContext::with_docker(docker).with_temp_root(root.path());

        let first = ctx.create_workspace().unwrap();
        let second = ctx.create_workspace().unwrap();
        assert_ne!(first.path(), second.path());
        assert!(first.path().starts_with(root.path()));
        assert_eq!(ctx.short_id().len(), 8);
        assert_eq!(ctx.labels()[RUN_ID_LABEL], ctx.run_id().to_string());

        let path = first.path().to_path_buf();
        first.close().unwrap();
        assert!(!path.exists());
    }
}
