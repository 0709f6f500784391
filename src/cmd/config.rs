//! Effective configuration — `beadwork config`.

use anyhow::Result;

use beadwork::config::Settings;

pub fn cmd_config(settings: &Settings) -> Result<()> {
    print!("{}", settings.to_toml()?);
    Ok(())
}
