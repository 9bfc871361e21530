use clap::Parser;
use tracing::debug;

use rudis::client::processors;
use rudis::{Client, ClientConfig, Command, Endpoint};

#[derive(Parser, Debug)]
struct Args {
    /// The server host to connect to
    #[arg(long, default_value = "127.0.0.1", env = "RUDIS_HOST")]
    host: String,

    /// The server port to connect to
    #[arg(short, long, default_value_t = 6379, env = "RUDIS_PORT")]
    port: u16,

    /// Command name
    name: String,

    /// Command arguments
    args: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), rudis::Error> {
    let _ = tracing_subscriber::fmt()
        .try_init()
        .map_err(|e| debug!("Failed to initialize global tracing: {}", e));

    let cli = Args::parse();

    let mut command = Command::new(cli.name);
    for arg in cli.args {
        command = command.arg(arg.into_bytes());
    }

    let client = Client::new(Endpoint::new(cli.host, cli.port), ClientConfig::default());
    let reply = client.execute(command, processors::identity).await?;
    println!("{}", reply);

    client.disconnect().await;
    Ok(())
}
