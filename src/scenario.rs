use std::time::Duration;

use log::info;

use crate::client::{self, ClientHandle};
use crate::error::Result;
use crate::server::{self, ServerHandle};
use crate::types::{client_port, ProcessId, ServerConfig};

/// In-process driver for multi-server, multi-client scenarios: servers and
/// clients run side by side on localhost ports derived from their identities,
/// and the driver emulates the console input an operator would type. Used by
/// the integration tests.
#[derive(Default)]
pub struct Scenario {
    servers: Vec<ServerHandle>,
    clients: Vec<ClientHandle>,
}

impl Scenario {
    pub fn new() -> Scenario {
        Scenario::default()
    }

    /// Starts a server from its command-line form, e.g. `"5 localhost 1
    /// localhost 2"`, and returns its index in the scenario.
    pub async fn start_server(&mut self, args: &str) -> Result<usize> {
        let args: Vec<String> = args.split_whitespace().map(|p| p.to_string()).collect();
        let config = ServerConfig::parse(&args)?;
        info!("scenario: starting server {}", config.id);
        let handle = server::start(config).await?;
        self.servers.push(handle);
        Ok(self.servers.len() - 1)
    }

    /// Starts a client connected to the given server and returns its index.
    pub async fn start_client(&mut self, server_id: ProcessId) -> Result<usize> {
        info!("scenario: starting a client of server {}", server_id);
        let handle = client::start("localhost", client_port(server_id)).await?;
        self.clients.push(handle);
        Ok(self.clients.len() - 1)
    }

    pub fn server(&self, index: usize) -> &ServerHandle {
        &self.servers[index]
    }

    pub fn client(&self, index: usize) -> &ClientHandle {
        &self.clients[index]
    }

    /// Emulates an input line on the console of a server.
    pub async fn server_console(&self, index: usize, line: &str) -> Result<()> {
        self.servers[index].console(line).await
    }

    /// Emulates an input line on the console of a client.
    pub async fn client_console(&self, index: usize, line: &str) -> Result<()> {
        self.clients[index].console(line).await
    }

    pub async fn sleep_ms(&self, millis: u64) {
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }

    /// Quits every client and server of the scenario.
    pub async fn shutdown(&mut self) {
        for client in &self.clients {
            client.shutdown().await;
        }
        for server in &self.servers {
            server.shutdown().await;
        }
        self.sleep_ms(100).await;
    }
}
