use clap::Parser;
use client::network::Client;
use log::info;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, env = "TICK_CLIENT_SERVER", default_value = "127.0.0.1:8080")]
    server: String,

    /// Simulate network latency in milliseconds (round trip)
    #[arg(short = 'l', long, env = "TICK_CLIENT_FAKE_PING", default_value = "0")]
    fake_ping: u64,

    /// Seconds to drive before disconnecting
    #[arg(short = 'd', long, env = "TICK_CLIENT_DURATION", default_value = "30")]
    duration: u64,

    /// Control actions per second
    #[arg(short = 'r', long, env = "TICK_CLIENT_INPUT_RATE", default_value = "30")]
    input_rate: u32,

    /// Seconds to wait for the server's welcome
    #[arg(long, env = "TICK_CLIENT_CONNECT_TIMEOUT", default_value = "5")]
    connect_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting client...");
    if args.fake_ping > 0 {
        info!("Simulating {}ms latency", args.fake_ping);
    }

    let mut client = Client::connect(
        &args.server,
        Duration::from_millis(args.fake_ping),
        Duration::from_secs(args.connect_timeout),
    )
    .await?;

    tokio::select! {
        result = client.run(Duration::from_secs(args.duration), args.input_rate) => result?,
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, disconnecting..."),
    }

    client.disconnect();
    // Give the sender task a moment to flush the goodbye.
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}
