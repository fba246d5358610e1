//! Port Allocator
//!
//! Walks a closed port range and returns the first port no probe reports
//! as bound. Probes are tried in order; a probe whose underlying tool is
//! missing reports [`ProbeResult::Unavailable`] and the allocator moves on
//! to the next one for the rest of the walk. When no probe works at all the
//! allocator hands back a fixed fallback port, marked as unverified.

use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::ops::RangeInclusive;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::PortError;
use crate::remote::RemoteExec;

/// Answer of a single probe for a single port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    Free,
    Bound,
    /// The probing mechanism itself does not work on this host
    Unavailable,
}

/// One way of telling whether a port is bound
#[async_trait]
pub trait PortProbe: Send + Sync {
    fn name(&self) -> &str;

    async fn probe(&self, port: u16) -> ProbeResult;
}

/// Port chosen by [`find_free_port`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortAllocation {
    pub port: u16,
    /// Name of the probe that confirmed the port free, `None` for the fallback
    pub verified_by: Option<String>,
}

impl PortAllocation {
    pub fn is_verified(&self) -> bool {
        self.verified_by.is_some()
    }
}

/// Find the first free port in `range`
///
/// Returns [`PortError::Exhausted`] when every candidate answers as bound.
pub async fn find_free_port(
    range: RangeInclusive<u16>,
    probes: &[Box<dyn PortProbe + '_>],
    fallback: u16,
) -> Result<PortAllocation, PortError> {
    let (start, end) = (*range.start(), *range.end());
    let mut active = 0;

    for port in range {
        let answer = loop {
            let Some(probe) = probes.get(active) else {
                tracing::warn!(
                    "No port probe is available, falling back to port {}",
                    fallback
                );
                return Ok(PortAllocation {
                    port: fallback,
                    verified_by: None,
                });
            };
            match probe.probe(port).await {
                ProbeResult::Unavailable => {
                    tracing::debug!("Port probe '{}' unavailable, trying next", probe.name());
                    active += 1;
                }
                answer => break answer,
            }
        };

        tracing::debug!("Port {} probed {:?} by {}", port, answer, probes[active].name());
        if answer == ProbeResult::Free {
            return Ok(PortAllocation {
                port,
                verified_by: Some(probes[active].name().to_string()),
            });
        }
    }

    Err(PortError::Exhausted { start, end })
}

/// Ask every probe in order for a single port, skipping unavailable ones
pub async fn probe_port(port: u16, probes: &[Box<dyn PortProbe + '_>]) -> ProbeResult {
    for probe in probes {
        match probe.probe(port).await {
            ProbeResult::Unavailable => continue,
            answer => return answer,
        }
    }
    ProbeResult::Unavailable
}

/// Local probe: try to bind the port ourselves
pub struct BindProbe {
    host: String,
}

impl BindProbe {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    /// Synchronous form used by the supervisor
    pub fn check(&self, port: u16) -> ProbeResult {
        let addrs: Vec<SocketAddr> = match (self.host.as_str(), port).to_socket_addrs() {
            Ok(addrs) => addrs.collect(),
            Err(_) => return ProbeResult::Unavailable,
        };
        let Some(addr) = addrs.first() else {
            return ProbeResult::Unavailable;
        };
        match TcpListener::bind(addr) {
            Ok(_) => ProbeResult::Free,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => ProbeResult::Bound,
            // Privileged ports and the like: we cannot tell, but we cannot use it either
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => ProbeResult::Bound,
            Err(_) => ProbeResult::Unavailable,
        }
    }
}

#[async_trait]
impl PortProbe for BindProbe {
    fn name(&self) -> &str {
        "bind"
    }

    async fn probe(&self, port: u16) -> ProbeResult {
        self.check(port)
    }
}

/// Local probe: see whether anything accepts connections on the port
pub struct ConnectProbe {
    timeout: Duration,
}

impl ConnectProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for ConnectProbe {
    fn default() -> Self {
        Self::new(Duration::from_millis(300))
    }
}

#[async_trait]
impl PortProbe for ConnectProbe {
    fn name(&self) -> &str {
        "connect"
    }

    async fn probe(&self, port: u16) -> ProbeResult {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        match tokio::time::timeout(self.timeout, tokio::net::TcpStream::connect(addr)).await {
            Ok(Ok(_)) => ProbeResult::Bound,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => ProbeResult::Free,
            Ok(Err(_)) | Err(_) => ProbeResult::Unavailable,
        }
    }
}

/// Tools a remote host may offer for listing listening sockets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeTool {
    Ss,
    Lsof,
    Netstat,
    Python,
}

impl ProbeTool {
    /// Order in which remote tools are tried
    pub const LADDER: [ProbeTool; 4] = [
        ProbeTool::Ss,
        ProbeTool::Lsof,
        ProbeTool::Netstat,
        ProbeTool::Python,
    ];

    fn name(&self) -> &'static str {
        match self {
            ProbeTool::Ss => "ss",
            ProbeTool::Lsof => "lsof",
            ProbeTool::Netstat => "netstat",
            ProbeTool::Python => "python3",
        }
    }

    fn command(&self, port: u16) -> String {
        match self {
            ProbeTool::Ss => "ss -ltn".to_string(),
            ProbeTool::Lsof => format!("lsof -nP -iTCP:{} -sTCP:LISTEN -t", port),
            ProbeTool::Netstat => "netstat -ltn".to_string(),
            ProbeTool::Python => format!(
                "python3 -c \"import socket; s=socket.socket(); s.setsockopt(socket.SOL_SOCKET, socket.SO_REUSEADDR, 1); s.bind(('127.0.0.1', {}))\"",
                port
            ),
        }
    }
}

/// Remote probe running one [`ProbeTool`] through a [`RemoteExec`]
pub struct CommandProbe<'a> {
    exec: &'a dyn RemoteExec,
    tool: ProbeTool,
}

impl<'a> CommandProbe<'a> {
    pub fn new(exec: &'a dyn RemoteExec, tool: ProbeTool) -> Self {
        Self { exec, tool }
    }

    /// The whole remote ladder, in order
    pub fn ladder(exec: &'a dyn RemoteExec) -> Vec<Box<dyn PortProbe + 'a>> {
        ProbeTool::LADDER
            .iter()
            .map(|tool| Box::new(CommandProbe::new(exec, *tool)) as Box<dyn PortProbe + 'a>)
            .collect()
    }
}

#[async_trait]
impl PortProbe for CommandProbe<'_> {
    fn name(&self) -> &str {
        self.tool.name()
    }

    async fn probe(&self, port: u16) -> ProbeResult {
        let output = match self.exec.run(&self.tool.command(port)).await {
            Ok(output) => output,
            Err(e) => {
                tracing::debug!("Remote probe {} failed: {}", self.tool.name(), e);
                return ProbeResult::Unavailable;
            }
        };
        if output.command_missing() {
            return ProbeResult::Unavailable;
        }

        match self.tool {
            ProbeTool::Ss | ProbeTool::Netstat => {
                if !output.success() {
                    return ProbeResult::Unavailable;
                }
                if listening_table_has_port(&output.stdout, port) {
                    ProbeResult::Bound
                } else {
                    ProbeResult::Free
                }
            }
            ProbeTool::Lsof => match output.exit_code {
                0 if !output.stdout.trim().is_empty() => ProbeResult::Bound,
                0 | 1 => ProbeResult::Free,
                _ => ProbeResult::Unavailable,
            },
            ProbeTool::Python => match output.exit_code {
                0 => ProbeResult::Free,
                1 if output.stderr.contains("Address already in use")
                    || output.stderr.contains("in use") =>
                {
                    ProbeResult::Bound
                }
                _ => ProbeResult::Unavailable,
            },
        }
    }
}

/// Whether an `ss -ltn` / `netstat -ltn` listing contains a local address on `port`
fn listening_table_has_port(table: &str, port: u16) -> bool {
    let colon = format!(":{}", port);
    let dot = format!(".{}", port);
    table.lines().any(|line| {
        line.split_whitespace()
            .any(|tok| tok.ends_with(&colon) || (tok.contains('*') && tok.ends_with(&dot)))
    })
}

/// Local probe ladder: bind first, then connect
pub fn local_probes(host: &str) -> Vec<Box<dyn PortProbe>> {
    vec![
        Box::new(BindProbe::new(host)),
        Box::new(ConnectProbe::default()),
    ]
}
