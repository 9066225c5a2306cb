use darkcolony_server::network::{Server, ServerConfig};
use log::{error, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::process;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Warning: RUST_LOG environment variable not set. Set it to display logs!");
        eprintln!("Recommended: RUST_LOG=info darkcolony-server");
    }

    let config = ServerConfig::from_env();
    let addr = format!("0.0.0.0:{}", config.port);

    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {}: {}", addr, e);
            process::exit(1);
        }
    };
    info!("listening on {}", addr);

    let server = Server::new(config, StdRng::from_entropy());
    server.run(listener).await;
}
