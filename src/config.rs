// src/config.rs
use clap::Parser;
use std::path::PathBuf;

/// Runtime settings for the ravel server.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Readiness-driven HTTP/1.1 static file server", long_about = None)]
pub struct ServerConfig {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    /// Worker threads (defaults to one per core)
    #[arg(short, long, default_value_t = num_cpus::get())]
    pub workers: usize,

    /// Directory files are served from
    #[arg(short, long, default_value = "./public")]
    pub document_root: PathBuf,

    /// Maximum concurrent connections
    #[arg(long, default_value_t = 10_000)]
    pub max_connections: usize,

    /// Close connections idle for longer than this many seconds (0 disables)
    #[arg(long, default_value_t = 30)]
    pub keep_alive_secs: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            workers: num_cpus::get(),
            document_root: PathBuf::from("./public"),
            max_connections: 10_000,
            keep_alive_secs: 30,
        }
    }
}
