//! Callbacks run while the child walks through its setup
//!
//! The child stops at each [HookEvent] that has callbacks, on a pair of
//! [WaitablePipe] barriers. The launcher notices the child has arrived, runs
//! the callbacks with the child's pid, then lets it continue.

use crate::{
    errors::ContainerError,
    jail::{ChildHook, JailPolicy},
    pipe::{close_raw, wait_raw, WaitablePipe},
};
use nix::unistd::{self, Pid};
use std::{
    fmt,
    os::unix::{
        io::{FromRawFd, OwnedFd, RawFd},
        process::CommandExt,
    },
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::Arc,
};

/// Points in the child's setup where hooks can run, in the order reached
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum HookEvent {
    /// Mounts are in place but the child has not pivoted into the new root
    PreChroot,
    /// Ids are switched but capabilities are still held
    PreDropCaps,
    /// Last stop before `execve`
    PreExecve,
}

pub const HOOK_EVENTS: [HookEvent; 3] = [
    HookEvent::PreChroot,
    HookEvent::PreDropCaps,
    HookEvent::PreExecve,
];

pub type CallbackFn = dyn Fn(Pid) -> Result<(), ContainerError> + Send + Sync;

/// Something to run when the child reaches a [HookEvent]
#[derive(Clone)]
pub enum HookCallback {
    /// Run an executable to completion; a non-zero exit fails the hook
    Exec(Arc<ExecHook>),
    /// Call a function with the child's pid
    Callback(Arc<CallbackFn>),
}

impl fmt::Debug for HookCallback {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HookCallback::Exec(hook) => f.debug_tuple("Exec").field(hook).finish(),
            HookCallback::Callback(_) => f.write_str("Callback"),
        }
    }
}

/// Executable hook with optional stdio redirection
#[derive(Debug)]
pub struct ExecHook {
    pub path: PathBuf,
    pub args: Vec<String>,
    stdin: Option<OwnedFd>,
    stdout: Option<OwnedFd>,
    stderr: Option<OwnedFd>,
}

/// The caller's ends of the pipes connected to an exec hook's stdio
#[derive(Debug, Default)]
pub struct HookPipes {
    /// write end, connected to the hook's stdin
    pub stdin: Option<OwnedFd>,
    /// read end, connected to the hook's stdout
    pub stdout: Option<OwnedFd>,
    /// read end, connected to the hook's stderr
    pub stderr: Option<OwnedFd>,
}

fn owned_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
    let (read, write) = unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)?;
    Ok(unsafe { (OwnedFd::from_raw_fd(read), OwnedFd::from_raw_fd(write)) })
}

impl HookCallback {
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(Pid) -> Result<(), ContainerError> + Send + Sync + 'static,
    {
        HookCallback::Callback(Arc::new(f))
    }

    /// Build an exec hook; `args[0]` is the name the program sees
    pub fn exec(
        path: &Path,
        args: Vec<String>,
        stdin: bool,
        stdout: bool,
        stderr: bool,
    ) -> nix::Result<(Self, HookPipes)> {
        let mut pipes = HookPipes::default();
        let mut hook = ExecHook {
            path: path.to_path_buf(),
            args,
            stdin: None,
            stdout: None,
            stderr: None,
        };
        if stdin {
            let (read, write) = owned_pipe()?;
            hook.stdin = Some(read);
            pipes.stdin = Some(write);
        }
        if stdout {
            let (read, write) = owned_pipe()?;
            hook.stdout = Some(write);
            pipes.stdout = Some(read);
        }
        if stderr {
            let (read, write) = owned_pipe()?;
            hook.stderr = Some(write);
            pipes.stderr = Some(read);
        }
        Ok((HookCallback::Exec(Arc::new(hook)), pipes))
    }

    pub fn run(&self, pid: Pid) -> Result<(), ContainerError> {
        match self {
            HookCallback::Callback(f) => f(pid),
            HookCallback::Exec(hook) => hook.run(),
        }
    }
}

impl ExecHook {
    fn run(&self) -> Result<(), ContainerError> {
        fn stdio(fd: &Option<OwnedFd>) -> std::io::Result<Stdio> {
            Ok(match fd {
                Some(fd) => Stdio::from(fd.try_clone()?),
                None => Stdio::inherit(),
            })
        }
        let mut command = Command::new(&self.path);
        if let Some((arg0, rest)) = self.args.split_first() {
            command.arg0(arg0).args(rest);
        }
        let mut child = command
            .stdin(stdio(&self.stdin)?)
            .stdout(stdio(&self.stdout)?)
            .stderr(stdio(&self.stderr)?)
            .spawn()?;
        log::debug!("exec hook {:?} started as pid {}", self.path, child.id());
        let status = child.wait()?;
        if status.success() {
            Ok(())
        } else {
            Err(ContainerError::ExecHook {
                path: self.path.clone(),
                status,
            })
        }
    }
}

/// One installed barrier, tying a child-side trampoline to the launcher
#[derive(Debug)]
pub struct HookState {
    event: HookEvent,
    reached: WaitablePipe,
    ready: WaitablePipe,
}

impl HookState {
    pub fn new(event: HookEvent) -> nix::Result<Self> {
        Ok(HookState {
            event,
            reached: WaitablePipe::new()?,
            ready: WaitablePipe::new()?,
        })
    }

    pub fn event(&self) -> HookEvent {
        self.event
    }

    /// The four pipe descriptors the child must keep open
    pub fn fds(&self) -> [RawFd; 4] {
        let (reached_read, reached_write) = self.reached.raw_fds();
        let (ready_read, ready_write) = self.ready.raw_fds();
        [reached_read, reached_write, ready_read, ready_write]
    }

    /// Child side of the barrier
    ///
    /// Closes the child's copy of `reached`, then blocks until the launcher
    /// closes `ready`.
    pub fn trampoline(&self) -> ChildHook {
        let [reached_read, reached_write, ready_read, ready_write] = self.fds();
        Arc::new(move || {
            close_raw(reached_read)?;
            close_raw(ready_write)?;
            close_raw(reached_write)?;
            wait_raw(ready_read)?;
            close_raw(ready_read)
        })
    }

    /// Add the child side of the barrier to the policy
    pub fn install(&self, policy: &mut JailPolicy) {
        for fd in self.fds().iter() {
            policy.preserve_fd(*fd);
        }
        policy.add_hook(self.event, self.trampoline());
    }

    /// Block until the child reaches the barrier
    pub fn wait_reached(&mut self) -> nix::Result<()> {
        self.ready.close_read();
        self.reached.wait()
    }

    /// Let the child continue past the barrier
    pub fn release(&mut self) {
        self.ready.signal();
    }

    /// Wait for the child to reach the event, run `callbacks` in order, then
    /// release the child
    ///
    /// A failing callback leaves the child blocked until this state is
    /// dropped, so the caller can kill it first.
    pub fn wait_for_hook_and_run(
        &mut self,
        callbacks: &[HookCallback],
        pid: Pid,
    ) -> Result<(), ContainerError> {
        let event = self.event;
        self.wait_reached().map_err(|errno| ContainerError::Hook {
            event,
            reason: format!("waiting for the child: {}", errno),
        })?;
        log::debug!("child {} reached {:?}", pid, event);
        for callback in callbacks {
            callback.run(pid).map_err(|e| ContainerError::Hook {
                event,
                reason: e.to_string(),
            })?;
        }
        self.release();
        Ok(())
    }
}
