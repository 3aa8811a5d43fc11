use std::process::Stdio;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use super::{build_external_command, kill_process_group, split_command, AuditError, AuditResult};

const PROBE_POLL_MS: u64 = 10;
/// Slack on top of the channel timeout for process startup and teardown.
const PROBE_GRACE_MS: u64 = 1_000;

/// Live control-system connectivity check, independent of the archiver's own
/// view. `Ok(false)` means "not connected within the timeout"; `Err` means the
/// probe itself could not run.
pub(crate) trait ConnectivityProbe: Sync {
    fn is_connected(&self, pv: &str) -> AuditResult<bool>;
}

/// Probe backed by the Channel Access command line client (`caget -w <secs>`).
#[derive(Debug, Clone)]
pub(crate) struct CommandProbe {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandProbe {
    pub(crate) fn new(command_line: &str, timeout: Duration) -> AuditResult<Self> {
        let command = split_command(command_line)
            .ok_or_else(|| AuditError::Config(format!("invalid probe command '{command_line}'")))?;
        Ok(Self { command, timeout })
    }

    fn args_for(&self, pv: &str) -> Vec<String> {
        let mut args: Vec<String> = self.command[1..].to_vec();
        args.push("-w".to_string());
        args.push(format!("{:.3}", self.timeout.as_secs_f64()));
        args.push(pv.to_string());
        args
    }
}

impl ConnectivityProbe for CommandProbe {
    fn is_connected(&self, pv: &str) -> AuditResult<bool> {
        let mut cmd = build_external_command(&self.command[0], &self.args_for(pv));
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let mut child = cmd.spawn().map_err(|e| AuditError::Config(format!(
            "cannot run connectivity probe '{}': {e}",
            self.command[0]
        )))?;

        let deadline = self.timeout + Duration::from_millis(PROBE_GRACE_MS);
        let start = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(pv = %pv, connected = status.success(), "connectivity probe");
                    return Ok(status.success());
                }
                Ok(None) if start.elapsed() >= deadline => {
                    kill_process_group(&mut child);
                    debug!(pv = %pv, "connectivity probe timed out");
                    return Ok(false);
                }
                Ok(None) => thread::sleep(Duration::from_millis(PROBE_POLL_MS)),
                Err(e) => {
                    kill_process_group(&mut child);
                    return Err(AuditError::Transport {
                        pv: pv.to_string(),
                        message: format!("connectivity probe wait failed: {e}"),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_arguments() {
        let probe = CommandProbe::new("caget -t", Duration::from_millis(250)).unwrap();
        assert_eq!(probe.args_for("PV:A"), vec!["-t", "-w", "0.250", "PV:A"]);
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(CommandProbe::new("  ", Duration::from_millis(250)).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn exit_status_decides_connection() {
        let connected = CommandProbe::new("true", Duration::from_millis(250)).unwrap();
        assert!(connected.is_connected("PV:A").unwrap());
        let disconnected = CommandProbe::new("false", Duration::from_millis(250)).unwrap();
        assert!(!disconnected.is_connected("PV:A").unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn hung_probe_counts_as_disconnected() {
        let probe = CommandProbe::new("sh -c 'sleep 5' probe", Duration::from_millis(50)).unwrap();
        let start = Instant::now();
        assert!(!probe.is_connected("PV:A").unwrap());
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn timeout_kills_spawned_grandchildren() {
        let pid_file = std::env::temp_dir().join(format!(
            "archiver-audit-grandchild-{}.pid",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&pid_file);
        let command = format!(
            "sh -c 'sleep 30 & echo $! > \"$1\"; wait' sh {}",
            pid_file.display()
        );
        let checker = CommandProbe::new(&command, Duration::from_millis(50)).unwrap();
        assert!(!checker.is_connected("PV:A").unwrap());

        let pid = std::fs::read_to_string(&pid_file).unwrap().trim().to_string();
        let stat = format!("/proc/{pid}/stat");
        let start = Instant::now();
        let gone = loop {
            let alive = std::fs::read_to_string(&stat)
                .map(|text| {
                    text.rsplit(')')
                        .next()
                        .and_then(|rest| rest.split_whitespace().next())
                        .is_some_and(|state| state != "Z")
                })
                .unwrap_or(false);
            if !alive {
                break true;
            }
            if start.elapsed() > Duration::from_secs(2) {
                break false;
            }
            thread::sleep(Duration::from_millis(20));
        };
        std::fs::remove_file(&pid_file).ok();
        assert!(gone, "background sleep {pid} survived the timeout");
    }

    #[test]
    fn missing_program_is_an_error() {
        let probe =
            CommandProbe::new("definitely-not-a-real-probe-binary", Duration::from_millis(50))
                .unwrap();
        assert!(probe.is_connected("PV:A").is_err());
    }
}
