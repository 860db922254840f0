/// LivePivot WebSocket Server
///
/// Standalone server that runs one isolated pivot engine per WebSocket
/// connection and speaks the JSON request/response protocol.

use livepivot::config::ServerConfig;
use livepivot::server::run_server;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = ServerConfig::from_env()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    run_server(config).await
}
