use actix::prelude::*;
use actix_web::{App, HttpServer};
use color_eyre::Result;
use livepoll_server::config::Config;
use livepoll_server::services::rooms::Drain;
use livepoll_server::services::sweeper::SweeperActor;
use livepoll_server::services::{AppState, Backends};
use livepoll_server::{log, server};
use tracing::{error, info, warn};

#[actix_rt::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    log::init();

    let config = Config::load()?;
    let backends = Backends::connect(&config).await?;
    let state = AppState::start(&config, backends);
    let _sweeper = SweeperActor::new(state.polls.clone(), config.sweep_interval).start();

    info!(host = %config.host, port = config.port, "Starting poll server");

    let app_state = state.clone();
    let server = HttpServer::new(move || {
        let state = app_state.clone();
        App::new().configure(move |cfg| server::configure(cfg, state))
    })
    .disable_signals()
    .bind((config.host.as_str(), config.port))?
    .run();

    // Websockets would hold graceful shutdown open, so close them first.
    let handle = server.handle();
    let rooms = state.rooms.clone();
    actix_rt::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Unable to listen for shutdown signal: {err}");
            return;
        }
        info!("Shutdown signal received");
        match rooms.send(Drain).await {
            Ok(connections) => info!(connections, "Drained websocket connections"),
            Err(err) => warn!("Failed to drain connections: {err}"),
        }
        handle.stop(true).await;
    });

    server.await?;
    info!("Server stopped");
    Ok(())
}
