//! OCI lifecycle hooks, run by the launcher as separate processes

use crate::{errors::OciError, oci::config::OciHook};
use nix::unistd::Pid;
use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
};
use tokio::{
    io::AsyncWriteExt,
    process::{Child, ChildStdin, Command},
};

pub const CONTAINER_ROOT_ANNOTATION: &str = "org.chromium.run_oci.container_root";

/// State document handed to every hook on its stdin
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    pub oci_version: String,
    pub id: String,
    pub status: String,
    pub bundle: PathBuf,
    pub pid: i32,
    pub annotations: BTreeMap<String, String>,
}

fn absolute(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

impl ContainerState {
    pub fn new(pid: Pid, bundle: &Path, container_dir: &Path, status: &str) -> Self {
        let mut annotations = BTreeMap::new();
        annotations.insert(
            CONTAINER_ROOT_ANNOTATION.to_string(),
            absolute(container_dir).to_string_lossy().into_owned(),
        );
        ContainerState {
            oci_version: "1.0".to_string(),
            id: format!("run_oci:{}", pid),
            status: status.to_string(),
            bundle: absolute(bundle),
            pid: pid.as_raw(),
            annotations,
        }
    }

    /// Pretty printed, so shell hooks can pick fields out line by line
    pub fn to_json(&self) -> Result<String, OciError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn hook_name(hook: &OciHook) -> String {
    format!("{:?} {:?}", hook.path, hook.args)
}

/// Write the state document, close stdin, then wait for the hook to exit
async fn feed_and_wait(
    child: &mut Child,
    stdin: Option<ChildStdin>,
    stage: &str,
    state: &str,
) -> io::Result<ExitStatus> {
    if let Some(mut stdin) = stdin {
        if let Err(e) = stdin.write_all(state.as_bytes()).await {
            log::error!("failed to send container state to {} hook: {}", stage, e);
        }
    }
    child.wait().await
}

/// Run one hook to completion, feeding it `state`
///
/// The hook's `env`, when not empty, replaces the launcher's environment.
/// `args[0]` is always the hook's path. A hook still running at its timeout
/// is killed, whether it is still reading its state or not.
pub async fn run_hook(hook: &OciHook, stage: &str, state: &str) -> Result<(), OciError> {
    let mut command = Command::new(&hook.path);
    command.args(hook.args.iter().skip(1));
    if !hook.env.is_empty() {
        command.env_clear();
        for var in &hook.env {
            let mut parts = var.splitn(2, '=');
            if let Some(key) = parts.next() {
                command.env(key, parts.next().unwrap_or(""));
            }
        }
    }
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    log::debug!("running {} hook {}", stage, hook_name(hook));
    let mut child = command.spawn()?;
    let stdin = child.stdin.take();

    let status = match hook.timeout() {
        None => feed_and_wait(&mut child, stdin, stage, state).await?,
        Some(timeout) => {
            let finished = tokio::time::timeout(timeout, feed_and_wait(&mut child, stdin, stage, state)).await;
            match finished {
                Ok(status) => status?,
                Err(_) => {
                    log::error!("timeout exceeded running {} hook {}", stage, hook_name(hook));
                    if let Err(e) = child.kill().await {
                        log::error!("failed to terminate {} hook: {}", stage, e);
                    }
                    return Err(OciError::HookTimeout {
                        stage: stage.to_string(),
                        hook: hook_name(hook),
                    });
                }
            }
        }
    };
    if !status.success() {
        log::error!("{} hook {} exited with {}", stage, hook_name(hook), status);
        return Err(OciError::HookFailed {
            stage: stage.to_string(),
            hook: hook_name(hook),
            status,
        });
    }
    Ok(())
}

/// Run every hook of a stage in order
///
/// All hooks run even after one fails; the stage fails if any did.
pub async fn run_hooks(hooks: &[OciHook], stage: &str, state: &ContainerState) -> Result<(), OciError> {
    if hooks.is_empty() {
        return Ok(());
    }
    let state = state.to_json()?;
    let mut success = true;
    for hook in hooks {
        if run_hook(hook, stage, &state).await.is_err() {
            success = false;
        }
    }
    if success {
        Ok(())
    } else {
        Err(OciError::HooksFailed(stage.to_string()))
    }
}

/// Poststop hooks run while the container is discarded anyway, so their
/// failures are only logged
pub async fn run_poststop_hooks(hooks: &[OciHook], pid: Pid, bundle: &Path, container_dir: &Path) {
    let state = ContainerState::new(pid, bundle, container_dir, "stopped");
    if let Err(e) = run_hooks(hooks, "poststop", &state).await {
        log::warn!("error running poststop hooks: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn shell_hook(script: &str) -> OciHook {
        OciHook {
            path: PathBuf::from("/bin/sh"),
            args: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            env: Vec::new(),
            timeout: None,
        }
    }

    fn runtime() -> tokio::runtime::Runtime {
        let _ = env_logger::builder().is_test(true).try_init();
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn state_document() {
        let dir = tempfile::tempdir().unwrap();
        let state = ContainerState::new(Pid::from_raw(42), dir.path(), dir.path(), "created");
        let json: serde_json::Value = serde_json::from_str(&state.to_json().unwrap()).unwrap();
        let dir = fs::canonicalize(dir.path()).unwrap();
        assert_eq!(json["ociVersion"], "1.0");
        assert_eq!(json["id"], "run_oci:42");
        assert_eq!(json["status"], "created");
        assert_eq!(json["pid"], 42);
        assert_eq!(json["bundle"], dir.to_str().unwrap());
        assert_eq!(
            json["annotations"][CONTAINER_ROOT_ANNOTATION],
            dir.to_str().unwrap()
        );
    }

    #[test]
    fn hook_reads_state_and_environment() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("state");
        let mut hook = shell_hook(&format!("cat > {:?}; echo \"$HOOK_VAR\" >> {:?}", output, output));
        hook.env = vec!["HOOK_VAR=visible".to_string(), "PATH=/bin:/usr/bin".to_string()];
        runtime()
            .block_on(run_hook(&hook, "prestart", "{\"status\":\"created\"}"))
            .unwrap();
        assert_eq!(
            fs::read_to_string(&output).unwrap(),
            "{\"status\":\"created\"}visible\n"
        );
    }

    #[test]
    fn failing_hook() {
        let err = runtime()
            .block_on(run_hook(&shell_hook("exit 2"), "poststart", ""))
            .unwrap_err();
        match err {
            OciError::HookFailed { stage, status, .. } => {
                assert_eq!(stage, "poststart");
                assert_eq!(status.code(), Some(2));
            }
            other => panic!("unexpected error {}", other),
        }
    }

    #[test]
    fn slow_hook_is_killed() {
        let mut hook = shell_hook("sleep 30");
        hook.timeout = Some(1);
        let started = Instant::now();
        let err = runtime()
            .block_on(run_hook(&hook, "prestart", ""))
            .unwrap_err();
        assert!(matches!(err, OciError::HookTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[test]
    fn timeout_covers_an_unread_state() {
        let mut hook = shell_hook("sleep 30");
        hook.timeout = Some(1);
        // larger than any pipe buffer, so the write can only finish if the
        // hook reads it
        let state = "x".repeat(4 << 20);
        let started = Instant::now();
        let err = runtime()
            .block_on(run_hook(&hook, "prestart", &state))
            .unwrap_err();
        assert!(matches!(err, OciError::HookTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[test]
    fn every_hook_runs_despite_failures() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let hooks = vec![
            shell_hook("exit 1"),
            shell_hook(&format!("touch {:?}", marker)),
        ];
        let state = ContainerState::new(Pid::from_raw(1), dir.path(), dir.path(), "running");
        let err = runtime()
            .block_on(run_hooks(&hooks, "poststart", &state))
            .unwrap_err();
        assert!(matches!(err, OciError::HooksFailed(stage) if stage == "poststart"));
        assert!(marker.exists());
    }
}
