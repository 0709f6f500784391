//! HTTP server command — `beadwork serve`.

use anyhow::Result;

use beadwork::config::Settings;
use beadwork::server::{AppState, start_server};

pub async fn cmd_serve(settings: Settings, host: Option<String>, port: Option<u16>) -> Result<()> {
    let host = host.unwrap_or_else(|| settings.server.host.clone());
    let port = port.unwrap_or(settings.server.port);

    if !settings.workspace_path.is_dir() {
        tracing::warn!(
            workspace = %settings.workspace_path.display(),
            "workspace directory does not exist; every project lookup will fail"
        );
    }

    let state = AppState::from_settings(settings)?;
    start_server(state, &host, port).await
}
