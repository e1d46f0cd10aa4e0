use clap::Parser;
use log::{error, info};
use rand::Rng;
use server::config::ServerConfig;
use server::scheduler::TickScheduler;
use server::spawner::VehicleSpawner;
use server::transport::UdpTransport;
use server::world::SimpleWorld;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let config = ServerConfig::parse();
    info!("Starting server at {}Hz", config.tick_rate);

    let transport = UdpTransport::bind(&config.bind_addr(), config.peer_timeout()).await?;

    let mut world = SimpleWorld::new();
    let mut rng = rand::thread_rng();
    let spread = config.interest_half_extent.max(1.0);
    for _ in 0..config.props {
        let position = [
            rng.gen_range(-spread..spread),
            0.0,
            rng.gen_range(-spread..spread),
        ];
        world.spawn_prop(position);
    }
    info!("Placed {} props", config.props);

    let mut scheduler = TickScheduler::new(transport, world, config.scheduler_config())
        .with_hook(VehicleSpawner::default());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down gracefully...");
        let _ = shutdown_tx.send(true);
    });

    scheduler.run(shutdown_rx).await;
    Ok(())
}
