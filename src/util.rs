use std::env;
use std::ffi::OsStr;
use std::path::Path;
use std::process::{Child, Command as ProcessCommand};

pub(crate) fn env_optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

/// Manifest key used in reports: the file name of the manifest path.
pub(crate) fn manifest_key(path: &Path) -> String {
    path.file_name()
        .and_then(OsStr::to_str)
        .map(str::to_string)
        .unwrap_or_else(|| path.display().to_string())
}

/// Split a configured command line into program and arguments.
pub(crate) fn split_command(raw: &str) -> Option<Vec<String>> {
    let parts = shlex::split(raw)?;
    if parts.is_empty() { None } else { Some(parts) }
}

pub(crate) fn build_external_command(program: &str, args: &[String]) -> ProcessCommand {
    let mut cmd = ProcessCommand::new(program);
    cmd.args(args);

    // Own process group, so a timeout can kill whatever the command spawned.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    cmd
}

/// Kill a child started by `build_external_command` together with its
/// process group, then reap it.
#[cfg(unix)]
pub(crate) fn kill_process_group(child: &mut Child) {
    let pid = child.id() as i32;
    unsafe {
        libc::killpg(pid, libc::SIGKILL);
    }
    let _ = child.wait();
}

#[cfg(not(unix))]
pub(crate) fn kill_process_group(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}
