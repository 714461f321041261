//! Process helpers for external transcoder children.
//!
//! Transcoders like ffmpeg may fork helpers of their own; killing only the
//! direct child leaves the rest of the subtree running. [`group_command`]
//! places the child in its own process group (POSIX) or console process
//! group (Windows) so [`kill_tree`] can take the whole subtree down at once.

use std::ffi::OsStr;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Create a command whose child starts in a fresh process group.
///
/// On Windows the child additionally gets no console window.
pub fn group_command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    #[cfg(unix)]
    {
        cmd.process_group(0);
    }
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        cmd.as_std_mut()
            .creation_flags(CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW);
    }
    cmd.kill_on_drop(true);
    cmd
}

/// Kill the entire process tree rooted at `pid`.
///
/// Idempotent: an already-gone process is not an error.
pub async fn kill_tree(pid: u32) {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) => debug!(pid, "killed process group"),
            Err(Errno::ESRCH) => debug!(pid, "process group already gone"),
            Err(err) => warn!(pid, %err, "unable to kill process group"),
        }
    }
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;

        let mut cmd = Command::new("TASKKILL");
        cmd.args(["/T", "/F", "/PID", &pid.to_string()]);
        cmd.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        match cmd.status().await {
            Ok(status) if status.success() => debug!(pid, "killed process tree"),
            Ok(status) => debug!(pid, %status, "taskkill returned non-zero"),
            Err(err) => warn!(pid, %err, "unable to run taskkill"),
        }
    }
}

/// Forward each line read from `reader` to the tracing log and an optional
/// callback. Used for child stderr.
///
/// The task ends when the pipe reaches EOF, i.e. when the child exits.
pub fn log_lines<R>(
    reader: R,
    module: &'static str,
    mut on_line: Option<Box<dyn FnMut(&str) + Send>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    warn!(module, "{line}");
                    if let Some(on_line) = on_line.as_mut() {
                        on_line(line);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(module, %err, "error reading child output");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_tree_terminates_the_group() {
        // spawn a shell that spawns a sleeping child of its own
        let mut child = group_command("sh")
            .args(["-c", "sleep 30 & wait"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();

        let pid = child.id().unwrap();
        kill_tree(pid).await;

        let status = child.wait().await.unwrap();
        assert!(!status.success());

        // second kill is a no-op
        kill_tree(pid).await;
    }

    #[tokio::test]
    async fn log_lines_drains_until_eof() {
        let (tx, rx) = tokio::io::duplex(64);
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();

        let handle = log_lines(
            rx,
            "test",
            Some(Box::new(move |line: &str| {
                sink.lock().unwrap().push(line.to_string());
            })),
        );

        use tokio::io::AsyncWriteExt;
        let mut tx = tx;
        tx.write_all(b"frame=1\n\nframe=2\n").await.unwrap();
        drop(tx);

        handle.await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["frame=1", "frame=2"]);
    }
}
