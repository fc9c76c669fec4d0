//! Readiness probing
//!
//! A service is ready once the container's own socket tables show its
//! readiness port in LISTEN state and the published host port accepts a
//! connection. Docker's port proxy accepts connections before anything is
//! listening inside the container, so the host-side probe alone proves
//! little.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecResults};
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace};

use super::Service;
use crate::config::WaitConfig;
use crate::context::RunContext;
use crate::error::{Error, Result};

/// Kernel state code for a listening socket in /proc/net/tcp
const TCP_LISTEN: &str = "0A";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Transport protocol of a container port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

/// Container port in Docker notation, e.g. `80/tcp`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortSpec {
    pub port: u16,
    pub protocol: Protocol,
}

impl PortSpec {
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
        }
    }

    pub fn is_tcp(&self) -> bool {
        self.protocol == Protocol::Tcp
    }
}

impl FromStr for PortSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::Settings(format!("invalid container port {:?}", s));
        let (port, protocol) = match s.split_once('/') {
            Some((port, "tcp")) => (port, Protocol::Tcp),
            Some((port, "udp")) => (port, Protocol::Udp),
            Some(_) => return Err(invalid()),
            None => (s, Protocol::Tcp),
        };
        match port.parse::<u16>() {
            Ok(port) if port != 0 => Ok(Self { port, protocol }),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let protocol = match self.protocol {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        };
        write!(f, "{}/{}", self.port, protocol)
    }
}

/// Ports in LISTEN state in the concatenated contents of /proc/net/tcp
/// and /proc/net/tcp6
pub fn listening_ports(tables: &str) -> HashSet<u16> {
    tables
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            // sl local_address rem_address st ...
            let slot = fields.next()?;
            if !slot.ends_with(':') {
                return None;
            }
            let local = fields.next()?;
            let _remote = fields.next()?;
            if fields.next()? != TCP_LISTEN {
                return None;
            }
            let (_, port) = local.rsplit_once(':')?;
            u16::from_str_radix(port, 16).ok()
        })
        .collect()
}

/// Wait until the service listens on `port`, its container stops, or the
/// wait policy runs out
pub async fn wait_for_port(
    ctx: &RunContext,
    service: &Service,
    port: PortSpec,
    policy: &WaitConfig,
) -> Result<()> {
    let started = Instant::now();
    debug!("Waiting for {} to listen on {}", service.name, port);

    if poll_until(policy, || probe(ctx, service, port)).await? {
        info!(
            "{} is listening on {} after {:?}",
            service.role,
            port,
            started.elapsed()
        );
        Ok(())
    } else {
        Err(Error::ReadinessTimeout {
            service: service.role.clone(),
            port: port.to_string(),
            timeout: policy.startup_timeout(),
        })
    }
}

/// Repeat `check` until it reports true, fails, or the startup timeout
/// passes. A check still running at the deadline is abandoned.
async fn poll_until<F, Fut>(policy: &WaitConfig, mut check: F) -> Result<bool>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + policy.startup_timeout();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, check()).await {
            Ok(Ok(true)) => return Ok(true),
            Ok(Ok(false)) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                debug!("Readiness probe still running at the deadline");
                return Ok(false);
            }
        }
        if Instant::now() + policy.poll_interval() > deadline {
            return Ok(false);
        }
        tokio::time::sleep(policy.poll_interval()).await;
    }
}

/// One readiness probe. Fails outright when the container is gone.
async fn probe(ctx: &RunContext, service: &Service, port: PortSpec) -> Result<bool> {
    let inspect = ctx
        .docker()
        .inspect_container(&service.id, None)
        .await
        .map_err(|e| Error::docker(format!("inspecting {}", service.name), e))?;

    let state = inspect.state.clone().unwrap_or_default();
    if state.running != Some(true) {
        return Err(Error::Provisioning(format!(
            "{} stopped before it was ready (exit code {}{})",
            service.name,
            state.exit_code.unwrap_or_default(),
            state
                .error
                .filter(|e| !e.is_empty())
                .map(|e| format!(", {}", e))
                .unwrap_or_default()
        )));
    }

    let tables = socket_tables(ctx, service).await?;
    if !listening_ports(&tables).contains(&port.port) {
        trace!("{} not listening on {} yet", service.name, port);
        return Ok(false);
    }

    let Some(host_port) = super::published_port(&inspect, port) else {
        return Err(Error::Provisioning(format!(
            "{} has no published host port for {}",
            service.name, port
        )));
    };
    let address = (ctx.docker_host(), host_port);
    match timeout(CONNECT_TIMEOUT, TcpStream::connect(address)).await {
        Ok(Ok(_)) => Ok(true),
        Ok(Err(e)) => {
            trace!("{}:{} refused: {}", ctx.docker_host(), host_port, e);
            Ok(false)
        }
        Err(_) => Ok(false),
    }
}

/// Read the container's TCP socket tables
async fn socket_tables(ctx: &RunContext, service: &Service) -> Result<String> {
    let docker = ctx.docker();
    let exec = docker
        .create_exec(
            &service.id,
            CreateExecOptions {
                cmd: Some(vec!["cat", "/proc/net/tcp", "/proc/net/tcp6"]),
                attach_stdout: Some(true),
                attach_stderr: Some(false),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| Error::docker(format!("probing {}", service.name), e))?;

    let mut tables = String::new();
    let started = docker
        .start_exec(&exec.id, None)
        .await
        .map_err(|e| Error::docker(format!("probing {}", service.name), e))?;
    if let StartExecResults::Attached { mut output, .. } = started {
        while let Some(chunk) = output.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) => {
                    tables.push_str(&String::from_utf8_lossy(&message))
                }
                Ok(_) => {}
                Err(e) => return Err(Error::docker(format!("probing {}", service.name), e)),
            }
        }
    }
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROC_NET_TCP: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000:0050 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 31541 1 0000000000000000 100 0 0 10 0
   1: 0B00007F:A2F1 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 30123 1 0000000000000000 100 0 0 10 0
   2: 020011AC:0050 010011AC:C350 01 00000000:00000000 00:00000000 00000000   101        0 41234 1 0000000000000000 20 4 30 10 -1
";

    const PROC_NET_TCP6: &str = "  sl  local_address                         remote_address                        st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000000000000000000000000000:0035 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 31542 1 0000000000000000 100 0 0 10 0
   1: 00000000000000000000000001000000:1F90 00000000000000000000000001000000:D2A2 06 00000000:00000000 03:00000F9C 00000000     0        0 0 3 0000000000000000
";

    #[test]
    fn test_listening_ports() {
        let ports = listening_ports(PROC_NET_TCP);
        assert_eq!(ports, HashSet::from([80, 41713]));

        let both = format!("{}{}", PROC_NET_TCP, PROC_NET_TCP6);
        let ports = listening_ports(&both);
        assert!(ports.contains(&53));
        assert!(!ports.contains(&8080));

        assert!(listening_ports("").is_empty());
        assert!(listening_ports("garbage\n   0: nonsense").is_empty());
    }

    #[test]
    fn test_port_spec() {
        let spec: PortSpec = "80/tcp".parse().unwrap();
        assert_eq!(spec, PortSpec::tcp(80));
        assert_eq!(spec.to_string(), "80/tcp");

        let spec: PortSpec = "51820/udp".parse().unwrap();
        assert_eq!(spec.protocol, Protocol::Udp);
        assert!(!spec.is_tcp());

        assert_eq!("53".parse::<PortSpec>().unwrap(), PortSpec::tcp(53));
        for bad in ["", "0/tcp", "80/sctp", "http/tcp", "70000/udp", "80/"] {
            assert!(bad.parse::<PortSpec>().is_err(), "{bad}");
        }
    }

    fn policy(startup_timeout_secs: u64) -> WaitConfig {
        WaitConfig {
            startup_timeout_secs,
            poll_interval_ms: 10,
        }
    }

    #[tokio::test]
    async fn test_poll_until_ready() {
        let mut attempts = 0;
        let ready = poll_until(&policy(5), || {
            attempts += 1;
            let done = attempts == 3;
            async move { Ok(done) }
        })
        .await
        .unwrap();
        assert!(ready);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_poll_until_stops_on_error() {
        let result = poll_until(&policy(5), || async {
            Err(Error::Provisioning("container exited".into()))
        })
        .await;
        assert!(matches!(result, Err(Error::Provisioning(_))));
    }

    #[tokio::test]
    async fn test_hung_check_bounded_by_timeout() {
        let started = Instant::now();
        let ready = poll_until(&policy(1), || futures::future::pending::<Result<bool>>())
            .await
            .unwrap();
        assert!(!ready);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_secs(3), "{elapsed:?}");
    }
}
