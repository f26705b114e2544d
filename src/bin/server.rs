use tokio::io::{AsyncBufReadExt, BufReader};

use chatring::server;
use chatring::types::ServerConfig;

/// The chat server executable: `server <ownId> [<neighborHost> <neighborId>]*`.
/// Console commands: `election`, `mutex`, `quit`.
#[tokio::main]
async fn main() -> chatring::Result<()> {
    env_logger::builder()
        .format_timestamp(Some(env_logger::TimestampPrecision::Millis))
        .init();
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = ServerConfig::parse(&args)?;
    let handle = server::start(config).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim().to_string();
        handle.console(&line).await?;
        if line == "quit" {
            break;
        }
    }
    Ok(())
}
