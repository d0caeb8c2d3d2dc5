// src/main.rs
use clap::Parser;
use ravel::config::ServerConfig;
use ravel::logging::init_logging;
use ravel::server::Server;
use tracing::error;

fn main() {
    init_logging();

    let config = ServerConfig::parse();
    if let Err(e) = Server::new(config).serve() {
        error!(error = %e, "server terminated");
        std::process::exit(1);
    }
}
