//! Process monitor: one task per launch, owns the `Child` and turns its exit
//! into a controller transition.

use tokio::process::Child;

use crate::controller::{ControllerError, MasterController};
use crate::launcher::{describe_exit, exit_code};

/// Status reported when the exit status itself cannot be collected.
pub const UNKNOWN_STATUS: i32 = -1;

pub(crate) async fn watch(
    controller: MasterController,
    mut child: Child,
    cycle: u64,
) -> Result<i32, ControllerError> {
    let pid = child.id();
    tracing::debug!(cycle, pid, "Monitoring subordinate process");

    let status = match child.wait().await {
        Ok(status) => {
            tracing::info!(cycle, pid, exit = %describe_exit(status), "Subordinate process exited");
            exit_code(status)
        }
        Err(e) => {
            tracing::error!(cycle, pid, error = %e, "Failed to wait for subordinate process");
            UNKNOWN_STATUS
        }
    };

    controller.handle_exit(cycle, status).await
}
