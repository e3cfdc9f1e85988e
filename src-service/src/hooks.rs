//! Shell commands run around screencasts (`exec_before` / `exec_after`).

use std::io;
use std::process::{Child, Command, Stdio};

/// Spawn `cmd` through `sh -c` without waiting for it.
pub fn spawn_shell(cmd: &str) -> io::Result<Child> {
    Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .spawn()
}

/// Commands bracketing the lifetime of the active casts.
#[derive(Debug, Clone, Default)]
pub struct Hooks {
    before: Option<String>,
    after: Option<String>,
}

impl Hooks {
    pub fn new(before: Option<String>, after: Option<String>) -> Self {
        Self {
            before: before.filter(|c| !c.trim().is_empty()),
            after: after.filter(|c| !c.trim().is_empty()),
        }
    }

    pub fn run_before(&self) -> Option<io::Result<()>> {
        self.before.as_deref().map(|cmd| run_detached("exec_before", cmd))
    }

    pub fn run_after(&self) -> Option<io::Result<()>> {
        self.after.as_deref().map(|cmd| run_detached("exec_after", cmd))
    }
}

fn run_detached(label: &'static str, cmd: &str) -> io::Result<()> {
    tracing::info!("running {}: {}", label, cmd);
    let mut child = spawn_shell(cmd)?;
    // Reap in the background
    std::thread::spawn(move || match child.wait() {
        Ok(status) if !status.success() => tracing::warn!("{} exited with {}", label, status),
        Ok(_) => {}
        Err(e) => tracing::warn!("{} wait failed: {}", label, e),
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_commands_are_ignored() {
        let hooks = Hooks::new(Some("  ".into()), None);
        assert!(hooks.run_before().is_none());
        assert!(hooks.run_after().is_none());
    }

    #[test]
    fn test_hook_runs_command() {
        let marker = std::env::temp_dir().join(format!("wlcast-hook-{}", std::process::id()));
        let _ = std::fs::remove_file(&marker);
        let hooks = Hooks::new(Some(format!("touch {}", marker.display())), None);

        hooks.run_before().unwrap().unwrap();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !marker.exists() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert!(marker.exists());
        let _ = std::fs::remove_file(&marker);
    }

    #[test]
    fn test_spawn_shell_exit_status() {
        let status = spawn_shell("exit 3").unwrap().wait().unwrap();
        assert_eq!(status.code(), Some(3));
    }
}
