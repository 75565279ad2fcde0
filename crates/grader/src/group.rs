//! Child processes run as leaders of their own process group, so a kill
//! reaches anything they fork as well.

use std::process::ExitStatus;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Start the command's process in a new group led by itself.
pub(crate) fn isolate(command: &mut Command) -> &mut Command {
    #[cfg(unix)]
    command.process_group(0);
    command
}

/// SIGKILL every process left in the group led by `pgid`.
///
/// A group that is already gone is not an error.
pub(crate) fn kill_group(pgid: Option<u32>, label: &str) {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(raw) = pgid.and_then(|pgid| i32::try_from(pgid).ok()) else {
            return;
        };
        match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
            Ok(()) => debug!(process = %label, pgid = raw, "killed process group"),
            Err(Errno::ESRCH) => {}
            Err(err) => warn!(process = %label, pgid = raw, error = %err, "failed to kill process group"),
        }
    }
    #[cfg(not(unix))]
    let _ = (pgid, label);
}

/// Kill the group led by `child`, then wait for `child` itself.
///
/// `pgid` must be read from `child.id()` right after spawning; tokio
/// forgets the id once the child is reaped.
pub(crate) async fn kill_and_reap(
    child: &mut Child,
    pgid: Option<u32>,
    label: &str,
) -> Option<ExitStatus> {
    kill_group(pgid, label);
    if let Err(err) = child.start_kill() {
        debug!(process = %label, error = %err, "failed to kill process");
    }
    match child.wait().await {
        Ok(status) => Some(status),
        Err(err) => {
            warn!(process = %label, error = %err, "failed to reap process");
            None
        }
    }
}
