use tokio::io::{AsyncBufReadExt, BufReader};

use chatring::client;
use chatring::error::Error;

/// The chat client executable: `client <serverHost> <serverPort>`. Every
/// console line is sent as a chat message; `quit` leaves.
#[tokio::main]
async fn main() -> chatring::Result<()> {
    env_logger::builder()
        .format_timestamp(Some(env_logger::TimestampPrecision::Millis))
        .init();
    let args: Vec<String> = std::env::args().skip(1).collect();
    let [host, port] = args.as_slice() else {
        return Err(Error::Config(
            "usage: client <serverHost> <serverPort>".to_string(),
        ));
    };
    let port: u16 = port
        .parse()
        .map_err(|_| Error::Config(format!("invalid port number ({})", port)))?;
    let handle = client::start(host, port).await?;
    println!("connected as client {:?}", handle.identity().await);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        handle.console(&line).await?;
        if line == "quit" {
            break;
        }
    }
    Ok(())
}
