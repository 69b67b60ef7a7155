//! Command-line surface for the demonstration binary (spec §4.I). This is
//! a small end-to-end harness, not a benchmark tool: it spins up one
//! `ServiceStub`/`ServiceProxy` pair over a chosen transport and runs a
//! fixed set of request scenarios.

use clap::{Parser, ValueEnum};

use crate::transport::TransportType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mechanism {
    /// Unix domain socket stream transport.
    UnixSocket,
    /// POSIX shared-memory ring transport.
    SharedMemory,
    /// TCP-backed RPC stream transport.
    RpcStream,
}

impl std::fmt::Display for Mechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Mechanism::UnixSocket => "unix-socket",
            Mechanism::SharedMemory => "shared-memory",
            Mechanism::RpcStream => "rpc-stream",
        };
        write!(f, "{name}")
    }
}

impl From<Mechanism> for TransportType {
    fn from(mechanism: Mechanism) -> Self {
        match mechanism {
            Mechanism::UnixSocket => TransportType::UnixSocket,
            Mechanism::SharedMemory => TransportType::SharedMemory,
            Mechanism::RpcStream => TransportType::RpcStream,
        }
    }
}

/// Runs the bundled demonstration scenarios over one IPC transport.
#[derive(Debug, Parser)]
#[command(name = "cdmf-ipc-demo", about = "CDMF IPC substrate demonstration harness")]
pub struct Args {
    /// Which transport to exercise.
    #[arg(short, long, value_enum, default_value_t = Mechanism::UnixSocket)]
    pub mechanism: Mechanism,

    /// Endpoint the transport binds/connects to. Defaults are
    /// mechanism-specific (a socket path or `host:port`).
    #[arg(short, long)]
    pub endpoint: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress the colorized stdout summary layer.
    #[arg(short, long)]
    pub quiet: bool,

    /// Payload size in bytes for the large-payload scenario.
    #[arg(long, default_value_t = 1024 * 1024)]
    pub large_payload_size: usize,
}

impl Args {
    pub fn resolved_endpoint(&self) -> String {
        if let Some(endpoint) = &self.endpoint {
            return endpoint.clone();
        }
        match self.mechanism {
            Mechanism::UnixSocket => "/tmp/cdmf-ipc-demo.sock".to_string(),
            Mechanism::SharedMemory => "/cdmf-ipc-demo-shm".to_string(),
            Mechanism::RpcStream => "127.0.0.1:47621".to_string(),
        }
    }
}
