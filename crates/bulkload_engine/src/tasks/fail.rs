//! Failure remediation.
//!
//! Releasing a failed stream's loader depends on how far the stream got:
//!
//! | loader slot                     | end-of-stream seen | action                       |
//! |---------------------------------|--------------------|------------------------------|
//! | never opened / already released | any                | nothing to release           |
//! | open                            | yes                | `close(Some(error))`         |
//! | open                            | no                 | `abort(error)`               |

use crate::error::{SharedError, SyncError, SyncResult};
use crate::launcher::TaskLauncher;
use crate::sync_manager::SyncManager;
use bulkload_protocol::StreamDescriptor;
use std::sync::Arc;
use tracing::{debug, info, warn};

async fn release_loader(
    sync: &SyncManager,
    stream: &StreamDescriptor,
    error: &SyncError,
    kill: bool,
) -> SyncResult<()> {
    let Some(loader) = sync.take_stream_loader(stream)? else {
        debug!(stream = %stream, "no open loader to release");
        return Ok(());
    };
    if kill {
        loader.abort(error).await
    } else {
        loader.close(Some(error)).await
    }
}

pub(super) async fn fail_stream(
    launcher: Arc<TaskLauncher>,
    stream: StreamDescriptor,
    error: SharedError,
    kill: bool,
) -> SyncResult<()> {
    let sync = launcher.sync_manager();
    let released = match sync.stream_manager(&stream) {
        Ok(manager) => {
            if let Err(illegal) = manager.mark_failed(Arc::clone(&error)) {
                warn!(stream = %stream, error = %illegal, "failing a finished stream");
            }
            release_loader(sync, &stream, &error, kill).await
        }
        Err(err) => Err(err),
    };
    launcher.handle_fail_stream_complete(&stream, &error);
    released
}

pub(super) async fn fail_sync(launcher: Arc<TaskLauncher>, error: SharedError) -> SyncResult<()> {
    let sync = launcher.sync_manager();
    sync.mark_failed(Arc::clone(&error));

    let managers: Vec<_> = sync.stream_managers().cloned().collect();
    let mut handled = Vec::new();
    let mut first_error = None;
    for manager in managers {
        let stream = manager.stream().clone();
        let cause = Arc::new(SyncError::SyncFailed(Arc::clone(&error)));
        match manager.mark_failed(Arc::clone(&cause)) {
            Ok(true) => {}
            // Already terminal: closed, or handled by its own FailStream.
            Ok(false) | Err(_) => continue,
        }
        let kill = !manager.end_of_stream_marked();
        if let Err(err) = release_loader(sync, &stream, &cause, kill).await {
            warn!(stream = %stream, error = %err, "failed to release stream loader");
            first_error.get_or_insert(err);
        }
        handled.push(stream);
    }

    info!(error = %error, aborted = handled.len(), "sync failed, streams released");
    launcher.exception_handler().handle_sync_failed(&error);
    launcher.handle_fail_sync_complete(handled);
    first_error.map_or(Ok(()), Err)
}
