//! `kestrel bridge`: the agent loop behind framed stdio.
//!
//! stdout carries only frames; logs go to stderr.

use super::session::{self, Session};
use kestrel_bridge::{BridgeServer, ChannelApprover};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// The UI process can pin the working directory for file tools.
const WORK_DIR_ENV: &str = "KESTREL_WORK_DIR";

pub async fn run(config_path: Option<&Path>) -> anyhow::Result<()> {
    if let Ok(dir) = std::env::var(WORK_DIR_ENV) {
        std::env::set_current_dir(&dir)
            .map_err(|e| anyhow::anyhow!("Cannot enter {WORK_DIR_ENV}={dir}: {e}"))?;
        info!(dir = %dir, "Working directory set from environment");
    }

    let config = session::load_config(config_path)?;
    let approvals = Arc::new(ChannelApprover::new());
    let Session {
        controller,
        interrupts,
        ..
    } = session::build(&config, approvals.clone())?;

    BridgeServer::new(controller, interrupts, approvals)
        .serve_stdio()
        .await?;
    Ok(())
}
