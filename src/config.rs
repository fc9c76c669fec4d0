//! wgcheck Configuration
//!
//! The check runs a single fixed scenario: `CheckConfig::default()`.
//! The structures are serde-friendly so tests and ad-hoc runs can describe
//! variants of it in TOML.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::provision::PortSpec;

/// Main check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckConfig {
    /// HTTP origin server
    #[serde(default = "default_origin")]
    pub origin: ServiceConfig,

    /// WireGuard gateway
    #[serde(default = "default_gateway")]
    pub gateway: ServiceConfig,

    /// Client configuration rendering
    #[serde(default)]
    pub tunnel: TunnelConfig,

    /// Readiness wait policy
    #[serde(default)]
    pub wait: WaitConfig,

    /// The request made through the tunnel
    #[serde(default)]
    pub request: RequestConfig,
}

/// A service container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Short role name, used in container names and logs
    pub role: String,

    /// Image reference
    pub image: String,

    /// Aliases on the check network
    #[serde(default)]
    pub aliases: Vec<String>,

    /// Exposed ports (e.g. "80/tcp"), all published to random host ports
    #[serde(default)]
    pub exposed_ports: Vec<String>,

    /// TCP port that must be listening before the service counts as ready
    pub ready_port: String,

    /// Extra kernel capabilities
    #[serde(default)]
    pub cap_add: Vec<String>,

    /// Namespaced sysctls
    #[serde(default)]
    pub sysctls: BTreeMap<String, String>,

    /// Bind mounts ("host:container")
    #[serde(default)]
    pub binds: Vec<String>,

    /// Files copied into the container before it starts
    #[serde(default)]
    pub files: Vec<FileConfig>,
}

/// A host file placed inside a container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    /// Path on the host
    pub source: PathBuf,

    /// Absolute path inside the container
    pub target: String,

    /// Permission bits of the copy
    #[serde(default = "default_file_mode")]
    pub mode: u32,
}

/// Client configuration rendering
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Gateway port whose published host port becomes the peer endpoint
    #[serde(default = "default_tunnel_port")]
    pub port: String,

    /// Template with a single `endpoint` placeholder
    #[serde(default = "default_template")]
    pub template: PathBuf,

    /// File name of the rendered configuration inside the workspace
    #[serde(default = "default_output_name")]
    pub output_name: String,
}

/// How long to wait for services to listen
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitConfig {
    /// Give up on a service after this many seconds
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,

    /// Delay between readiness probes in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// HTTP request made through the virtual network
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    /// Host name, resolved by the tunnel's DNS server
    #[serde(default = "default_request_host")]
    pub host: String,

    #[serde(default = "default_request_port")]
    pub port: u16,

    #[serde(default = "default_request_path")]
    pub path: String,

    /// Bound on resolving and connecting, in seconds
    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,
}

fn testdata(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata").join(name)
}

fn default_origin() -> ServiceConfig {
    ServiceConfig {
        role: "origin".into(),
        image: "nginx:latest".into(),
        aliases: vec!["web".into()],
        exposed_ports: vec!["80/tcp".into()],
        ready_port: "80/tcp".into(),
        cap_add: Vec::new(),
        sysctls: BTreeMap::new(),
        binds: Vec::new(),
        files: Vec::new(),
    }
}

fn default_gateway() -> ServiceConfig {
    ServiceConfig {
        role: "gateway".into(),
        image: "ghcr.io/noisysockets/gateway:latest-dev".into(),
        aliases: Vec::new(),
        exposed_ports: vec!["51820/udp".into(), "53/tcp".into()],
        // dnsmasq only starts once the WireGuard interface is up
        ready_port: "53/tcp".into(),
        cap_add: vec!["NET_ADMIN".into()],
        sysctls: BTreeMap::from([
            ("net.ipv4.ip_forward".to_string(), "1".to_string()),
            ("net.ipv4.conf.all.src_valid_mark".to_string(), "1".to_string()),
        ]),
        binds: vec!["/dev/net/tun:/dev/net/tun".into()],
        files: vec![FileConfig {
            source: testdata("wg0.conf"),
            target: "/etc/wireguard/wg0.conf".into(),
            mode: 0o400,
        }],
    }
}

fn default_file_mode() -> u32 {
    0o644
}

fn default_tunnel_port() -> String {
    "51820/udp".into()
}

fn default_template() -> PathBuf {
    testdata("wgnet.toml.tera")
}

fn default_output_name() -> String {
    "wgnet.toml".into()
}

fn default_startup_timeout_secs() -> u64 {
    60
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_request_host() -> String {
    "web".into()
}

fn default_request_port() -> u16 {
    80
}

fn default_request_path() -> String {
    "/".into()
}

fn default_dial_timeout_secs() -> u64 {
    30
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            origin: default_origin(),
            gateway: default_gateway(),
            tunnel: TunnelConfig::default(),
            wait: WaitConfig::default(),
            request: RequestConfig::default(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            port: default_tunnel_port(),
            template: default_template(),
            output_name: default_output_name(),
        }
    }
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            startup_timeout_secs: default_startup_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            host: default_request_host(),
            port: default_request_port(),
            path: default_request_path(),
            dial_timeout_secs: default_dial_timeout_secs(),
        }
    }
}

impl CheckConfig {
    /// Parse configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: CheckConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.origin.validate()?;
        self.gateway.validate()?;
        if self.origin.role == self.gateway.role {
            return Err(Error::Settings(format!(
                "origin and gateway share the role name {:?}",
                self.origin.role
            )));
        }

        let tunnel_port: PortSpec = self.tunnel.port.parse()?;
        if !self.gateway.exposes(&tunnel_port) {
            return Err(Error::Settings(format!(
                "gateway does not expose tunnel port {}",
                tunnel_port
            )));
        }
        if self.tunnel.output_name.is_empty() || self.tunnel.output_name.contains('/') {
            return Err(Error::Settings(format!(
                "invalid output file name {:?}",
                self.tunnel.output_name
            )));
        }

        if self.wait.poll_interval_ms == 0 {
            return Err(Error::Settings("poll interval must be positive".into()));
        }
        if self.wait.startup_timeout_secs == 0 {
            return Err(Error::Settings("startup timeout must be positive".into()));
        }
        if self.request.host.is_empty() || !self.request.path.starts_with('/') {
            return Err(Error::Settings(format!(
                "invalid request target {}",
                self.request.url()
            )));
        }
        Ok(())
    }
}

impl ServiceConfig {
    fn validate(&self) -> Result<()> {
        if self.role.is_empty() || self.image.is_empty() {
            return Err(Error::Settings("service needs a role and an image".into()));
        }
        for port in &self.exposed_ports {
            port.parse::<PortSpec>()?;
        }
        let ready: PortSpec = self.ready_port.parse()?;
        if !ready.is_tcp() {
            return Err(Error::Settings(format!(
                "{}: readiness port {} is not TCP",
                self.role, ready
            )));
        }
        if !self.exposes(&ready) {
            return Err(Error::Settings(format!(
                "{}: readiness port {} is not exposed",
                self.role, ready
            )));
        }
        for file in &self.files {
            if !file.target.starts_with('/') || file.mode > 0o7777 {
                return Err(Error::Settings(format!(
                    "{}: invalid file target {:?} (mode {:o})",
                    self.role, file.target, file.mode
                )));
            }
        }
        Ok(())
    }

    /// Check whether the port is among the exposed ones
    pub fn exposes(&self, port: &PortSpec) -> bool {
        self.exposed_ports
            .iter()
            .any(|p| p.parse::<PortSpec>().map(|p| p == *port).unwrap_or(false))
    }
}

impl WaitConfig {
    /// Get startup timeout as Duration
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    /// Get poll interval as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl RequestConfig {
    /// `host:port` handed to the dialer
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Value of the Host header
    pub fn host_header(&self) -> String {
        if self.port == 80 {
            self.host.clone()
        } else {
            self.authority()
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}{}", self.host_header(), self.path)
    }

    /// Get dial timeout as Duration
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }
}
