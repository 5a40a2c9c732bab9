use crate::destination::Destination;
use crate::error::SyncResult;
use crate::launcher::TaskLauncher;
use std::sync::Arc;
use tracing::info;

pub(super) async fn run(launcher: Arc<TaskLauncher>, destination: Arc<dyn Destination>) -> SyncResult<()> {
    destination.setup().await?;
    info!("destination setup complete");
    launcher.handle_setup_complete();
    Ok(())
}
