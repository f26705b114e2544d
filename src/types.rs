use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Identity of a process (server or client) of the platform.
#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
pub struct ProcessId(pub u32);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

//Client identities are computed by the accepting server as
//serverId * OFFSET_ID_CLIENT + localClientNumber
pub const OFFSET_ID_CLIENT: u32 = 100;

pub fn client_identity(server: ProcessId, client_number: u32) -> ProcessId {
    ProcessId(server.0 * OFFSET_ID_CLIENT + client_number)
}

//Listening ports are derived from the server identity so that a topology
//argument only needs to name identities
pub const SERVER_PORT_BASE: u16 = 2050;
pub const CLIENT_PORT_BASE: u16 = 2700;

pub fn server_port(id: ProcessId) -> u16 {
    SERVER_PORT_BASE + id.0 as u16
}

pub fn client_port(id: ProcessId) -> u16 {
    CLIENT_PORT_BASE + id.0 as u16
}

/// A neighbouring server of the overlay, as named on the command line.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct NeighborConfig {
    pub host: String,
    pub id: ProcessId,
}

/// Startup topology of one server process: its own identity and the already
/// running neighbours it connects to.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct ServerConfig {
    pub id: ProcessId,
    pub neighbors: Vec<NeighborConfig>,
}

impl ServerConfig {
    /// Parses the positional arguments `<ownId> [<neighborHost> <neighborId>]*`.
    pub fn parse(args: &[String]) -> Result<ServerConfig> {
        let own = args
            .first()
            .ok_or_else(|| Error::Config("missing server identity argument".to_string()))?;
        let id = parse_identity(own)?;
        if args.len() % 2 != 1 {
            return Err(Error::Config(
                "neighbour arguments must come in <host> <id> pairs".to_string(),
            ));
        }
        let mut neighbors = Vec::new();
        for pair in args[1..].chunks(2) {
            let host = pair[0].trim();
            if host.is_empty() {
                return Err(Error::Config("neighbour host cannot be empty".to_string()));
            }
            neighbors.push(NeighborConfig {
                host: host.to_string(),
                id: parse_identity(&pair[1])?,
            });
        }
        let config = ServerConfig { id, neighbors };
        validate_config(&config)?;
        Ok(config)
    }
}

fn parse_identity(arg: &str) -> Result<ProcessId> {
    let value: i64 = arg
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("invalid process identity ({})", arg)))?;
    if value < 0 {
        return Err(Error::Config(format!(
            "invalid process identity ({})",
            value
        )));
    }
    Ok(ProcessId(value as u32))
}

/// Checks a parsed configuration as a whole. Called by the parser once all
/// fields are set, and usable on configurations built by hand.
pub fn validate_config(config: &ServerConfig) -> Result<()> {
    for neighbor in &config.neighbors {
        if neighbor.id == config.id {
            return Err(Error::Config(format!(
                "server {} cannot be its own neighbour",
                config.id
            )));
        }
    }
    let mut ids: Vec<ProcessId> = config.neighbors.iter().map(|n| n.id).collect();
    ids.sort();
    ids.dedup();
    if ids.len() != config.neighbors.len() {
        return Err(Error::Config("duplicate neighbour identity".to_string()));
    }
    Ok(())
}
