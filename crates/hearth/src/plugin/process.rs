//! Add-on child processes
//!
//! Renders the exec template, spawns the process with the hub environment,
//! forwards its output line by line to the log and reports its exit.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// Values substituted into an exec template
#[derive(Debug, Clone)]
pub struct ExecVars<'a> {
    /// `{name}`: the add-on id
    pub name: &'a str,
    /// `{path}`: the add-on directory
    pub path: &'a Path,
    /// `{nodeLoader}`: bootstrap loader command
    pub loader: &'a str,
}

/// Substitute `{name}`, `{path}` and `{nodeLoader}` in `template`
pub fn render_exec(template: &str, vars: &ExecVars<'_>) -> String {
    template
        .replace("{nodeLoader}", vars.loader)
        .replace("{name}", vars.name)
        .replace("{path}", &vars.path.to_string_lossy())
}

/// Everything needed to launch one add-on process
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub plugin_id: String,
    /// Fully rendered command line, split on spaces
    pub command_line: String,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

/// Handle to a running add-on process
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    alive: Arc<AtomicBool>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Forcibly terminate the process. The exit is still reported through
    /// the exit callback.
    pub fn kill(&mut self) {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Spawn an add-on process.
///
/// `on_exit` runs once with the exit code (`None` if terminated by a signal
/// or if waiting on the child failed).
pub fn spawn<F>(spec: &LaunchSpec, on_exit: F) -> Result<ProcessHandle>
where
    F: FnOnce(Option<i32>) + Send + 'static,
{
    let mut parts = spec.command_line.split(' ').filter(|s| !s.is_empty());
    let program = parts
        .next()
        .ok_or_else(|| Error::Spawn(format!("empty exec command for {}", spec.plugin_id)))?;

    info!("Launching add-on {}: {}", spec.plugin_id, spec.command_line);

    let mut cmd = Command::new(program);
    cmd.args(parts)
        .current_dir(&spec.cwd)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Spawn(format!("{}: {}", spec.command_line, e)))?;

    let plugin_id = spec.plugin_id.clone();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_lines(plugin_id.clone(), stdout, false));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_lines(plugin_id.clone(), stderr, true));
    }

    let pid = child.id();
    let alive = Arc::new(AtomicBool::new(true));
    let (kill_tx, kill_rx) = oneshot::channel();

    let exit_alive = alive.clone();
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            Ok(()) = kill_rx => {
                warn!("Killing add-on {}", plugin_id);
                if let Err(e) = child.kill().await {
                    error!("Failed to kill add-on {}: {}", plugin_id, e);
                }
                child.wait().await
            }
        };

        exit_alive.store(false, Ordering::SeqCst);
        let code = match status {
            Ok(status) => {
                info!("Add-on {} exited with {}", plugin_id, status);
                status.code()
            }
            Err(e) => {
                error!("Error waiting for add-on {}: {}", plugin_id, e);
                None
            }
        };
        on_exit(code);
    });

    Ok(ProcessHandle {
        pid,
        alive,
        kill_tx: Some(kill_tx),
    })
}

async fn forward_lines<R>(plugin_id: String, stream: R, is_stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if is_stderr => warn!(target: "addon", "[{}] {}", plugin_id, line),
            Ok(Some(line)) => info!(target: "addon", "[{}] {}", plugin_id, line),
            Ok(None) => break,
            Err(e) => {
                debug!("Output stream of {} closed: {}", plugin_id, e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_render_exec_substitutes_placeholders() {
        let vars = ExecVars {
            name: "zigbee-adapter",
            path: Path::new("/home/hub/addons/zigbee-adapter"),
            loader: "node /opt/hub/loader.js",
        };
        assert_eq!(
            render_exec("{nodeLoader} {path}", &vars),
            "node /opt/hub/loader.js /home/hub/addons/zigbee-adapter"
        );
        assert_eq!(
            render_exec("python3 {path}/main.py --id {name}", &vars),
            "python3 /home/hub/addons/zigbee-adapter/main.py --id zigbee-adapter"
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let dir = tempdir().unwrap();
        let spec = LaunchSpec {
            plugin_id: "ghost".into(),
            command_line: "/definitely/not/a/binary --flag".into(),
            cwd: dir.path().to_path_buf(),
            env: Vec::new(),
        };
        assert!(matches!(spawn(&spec, |_| {}), Err(Error::Spawn(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_code_is_reported() {
        let dir = tempdir().unwrap();
        let spec = LaunchSpec {
            plugin_id: "short-lived".into(),
            command_line: "false".into(),
            cwd: dir.path().to_path_buf(),
            env: vec![("HEARTH_HOME".into(), "/tmp".into())],
        };
        let (tx, rx) = oneshot::channel();
        let handle = spawn(&spec, move |code| {
            let _ = tx.send(code);
        })
        .unwrap();

        let code = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, Some(1));
        assert!(!handle.is_alive());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_terminates_process() {
        let dir = tempdir().unwrap();
        let spec = LaunchSpec {
            plugin_id: "sleeper".into(),
            command_line: "sleep 30".into(),
            cwd: dir.path().to_path_buf(),
            env: Vec::new(),
        };
        let (tx, rx) = oneshot::channel();
        let mut handle = spawn(&spec, move |code| {
            let _ = tx.send(code);
        })
        .unwrap();
        assert!(handle.is_alive());
        assert!(handle.pid().is_some());

        handle.kill();
        let code = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, None);
    }
}
