//! wgcheck Error Types

use std::time::Duration;

use thiserror::Error;

/// Result type alias for wgcheck operations
pub type Result<T> = std::result::Result<T, Error>;

/// wgcheck error types
#[derive(Error, Debug)]
pub enum Error {
    // Check configuration errors
    #[error("Invalid check configuration: {0}")]
    Settings(String),

    #[error("Invalid check configuration file: {0}")]
    SettingsParse(#[from] toml::de::Error),

    // Provisioning errors
    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    #[error("Docker failed {action}: {source}")]
    Docker {
        action: String,
        #[source]
        source: bollard::errors::Error,
    },

    #[error("{service} did not listen on {port} within {timeout:?}")]
    ReadinessTimeout {
        service: String,
        port: String,
        timeout: Duration,
    },

    // Workspace errors
    #[error("Cannot prepare workspace: {0}")]
    Workspace(#[source] std::io::Error),

    #[error("Cannot render {path}: {reason}")]
    Render { path: String, reason: String },

    // Verification errors
    #[error("Cannot load client configuration: {0}")]
    Config(#[source] wgnet::Error),

    #[error("Cannot start virtual network: {0}")]
    NetworkInit(#[source] wgnet::Error),

    #[error("Request to {url} failed: {reason}")]
    Request { url: String, reason: String },

    #[error("Unexpected status from {url}: {status}")]
    UnexpectedStatus { url: String, status: u16 },
}

impl Error {
    /// Wrap a Docker API failure with what was being attempted
    pub fn docker(action: impl Into<String>, source: bollard::errors::Error) -> Self {
        Error::Docker {
            action: action.into(),
            source,
        }
    }

    /// Name of the step that failed, for the final log line
    pub fn step(&self) -> &'static str {
        match self {
            Error::Settings(_) | Error::SettingsParse(_) => "settings",
            Error::Provisioning(_) | Error::Docker { .. } | Error::ReadinessTimeout { .. } => {
                "provision"
            }
            Error::Workspace(_) => "workspace",
            Error::Render { .. } => "render",
            Error::Config(_) => "config",
            Error::NetworkInit(_) => "network",
            Error::Request { .. } => "request",
            Error::UnexpectedStatus { .. } => "verify",
        }
    }

    /// Check if the environment never came up
    pub fn is_provisioning(&self) -> bool {
        self.step() == "provision"
    }
}

/// Flatten an error and its sources into one line
pub fn describe(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_names() {
        let err = Error::ReadinessTimeout {
            service: "origin".into(),
            port: "80/tcp".into(),
            timeout: Duration::from_secs(60),
        };
        assert_eq!(err.step(), "provision");
        assert!(err.is_provisioning());
        assert_eq!(err.to_string(), "origin did not listen on 80/tcp within 60s");

        let err = Error::UnexpectedStatus {
            url: "http://web/".into(),
            status: 502,
        };
        assert_eq!(err.step(), "verify");
        assert!(!err.is_provisioning());
        assert_eq!(Error::NetworkInit(wgnet::Error::Closed).step(), "network");
    }

    #[test]
    fn test_describe_includes_sources() {
        let err = Error::Workspace(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
        assert_eq!(describe(&err), "Cannot prepare workspace: disk full");

        let err = Error::Config(wgnet::Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no such file",
        )));
        assert_eq!(
            describe(&err),
            "Cannot load client configuration: I/O error: no such file"
        );
    }
}
