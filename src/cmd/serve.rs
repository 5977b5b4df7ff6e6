//! HTTP API server command (`shipyard serve`).

use anyhow::Result;

use shipyard::config::ShipyardConfig;

pub async fn cmd_serve(
    mut config: ShipyardConfig,
    host: Option<String>,
    port: Option<u16>,
    dev: bool,
) -> Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    config.server.dev_mode |= dev;
    config.validate()?;

    shipyard::server::start_server(config).await
}
