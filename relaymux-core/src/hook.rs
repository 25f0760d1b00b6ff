//! External command hooks.
//!
//! Paths fire configured commands at lifecycle transitions (on-init,
//! on-ready, on-demand, ...). The rest of the system only knows "start" and
//! "stop": commands run detached, optionally restarting on exit, and are
//! killed when the returned handle is closed.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

const RESTART_PAUSE: Duration = Duration::from_secs(5);

/// Environment handed to every hook command.
#[derive(Debug, Clone, Default)]
pub struct HookEnv {
    pub path: String,
    pub query: String,
    pub source_type: String,
    pub source_id: String,
}

impl HookEnv {
    fn to_vars(&self) -> HashMap<&'static str, String> {
        HashMap::from([
            ("RMX_PATH", self.path.clone()),
            ("RMX_QUERY", self.query.clone()),
            ("RMX_SOURCE_TYPE", self.source_type.clone()),
            ("RMX_SOURCE_ID", self.source_id.clone()),
        ])
    }
}

/// Cancelable handle over a running hook command.
pub struct HookHandle {
    token: CancellationToken,
    join: tokio::task::JoinHandle<()>,
}

impl HookHandle {
    /// Stop the command and wait for the supervising task to finish.
    pub async fn close(self) {
        self.token.cancel();
        let _ = self.join.await;
    }
}

/// Start `cmdline` through the shell with the RMX_* environment set.
///
/// With `restart`, the command is relaunched after it exits until the handle
/// is closed.
#[must_use]
pub fn run(cmdline: &str, env: &HookEnv, restart: bool) -> HookHandle {
    let token = CancellationToken::new();
    let child_token = token.clone();
    let cmdline = cmdline.to_string();
    let vars = env.to_vars();

    let join = tokio::spawn(async move {
        loop {
            let mut cmd = Command::new("sh");
            cmd.arg("-c")
                .arg(&cmdline)
                .stdin(Stdio::null())
                .kill_on_drop(true);
            for (k, v) in &vars {
                cmd.env(k, v);
            }

            let mut child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) => {
                    tracing::error!("hook command '{}' failed to start: {}", cmdline, e);
                    if !restart {
                        return;
                    }
                    tokio::select! {
                        () = child_token.cancelled() => return,
                        () = tokio::time::sleep(RESTART_PAUSE) => continue,
                    }
                }
            };

            tokio::select! {
                () = child_token.cancelled() => {
                    let _ = child.kill().await;
                    return;
                }
                status = child.wait() => {
                    match status {
                        Ok(s) if s.success() => {
                            tracing::debug!("hook command '{}' exited", cmdline);
                        }
                        Ok(s) => {
                            tracing::warn!("hook command '{}' exited with {}", cmdline, s);
                        }
                        Err(e) => {
                            tracing::error!("hook command '{}' wait error: {}", cmdline, e);
                        }
                    }
                }
            }

            if !restart {
                return;
            }
            tokio::select! {
                () = child_token.cancelled() => return,
                () = tokio::time::sleep(RESTART_PAUSE) => {}
            }
        }
    });

    HookHandle { token, join }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_command_runs_with_env() {
        let dir = std::env::temp_dir().join(format!("rmx-hook-{}", uuid::Uuid::new_v4()));
        let marker = dir.join("marker");
        tokio::fs::create_dir_all(&dir).await.expect("tmpdir");

        let env = HookEnv {
            path: "cam1".to_string(),
            ..HookEnv::default()
        };
        let handle = run(
            &format!("echo -n \"$RMX_PATH\" > {}", marker.display()),
            &env,
            false,
        );

        // give the shell a moment to run
        for _ in 0..50 {
            if marker.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.close().await;

        let content = tokio::fs::read_to_string(&marker).await.expect("marker");
        assert_eq!(content, "cam1");
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_close_kills_long_running_command() {
        let env = HookEnv::default();
        let handle = run("sleep 600", &env, false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        // must return promptly rather than waiting for the sleep
        tokio::time::timeout(Duration::from_secs(2), handle.close())
            .await
            .expect("close timed out");
    }
}
