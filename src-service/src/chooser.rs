//! Output selection for new screencasts.
//!
//! Depending on the configured chooser type, the output is taken from the
//! config, picked by a command that prints an output name (`slurp`), or picked
//! from a dmenu-style menu fed with the output names on stdin.

use std::io::Write;
use std::process::{Command, Stdio};

use wlcast_common::{ChooserType, ScreencastConfig};

use crate::cast::OutputId;

/// Candidates for `ChooserType::Simple` when no command is configured.
const SIMPLE_CHOOSERS: &[&str] = &["slurp -f %o -or"];

/// Candidates for `ChooserType::Dmenu` when no command is configured.
const DMENU_CHOOSERS: &[&str] = &["wmenu -l 10", "wofi -d -n", "rofi -dmenu", "bemenu", "tofi"];

/// `sh` exit status for a command that does not exist.
const EXIT_COMMAND_NOT_FOUND: i32 = 127;

/// A compositor output as presented to the user.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputInfo {
    pub id: OutputId,
    /// Connector name, e.g. "DP-1"
    pub name: String,
    pub description: String,
    pub width: i32,
    pub height: i32,
    /// Refresh rate in mHz
    pub refresh_mhz: i32,
    /// `wl_output` transform
    pub transform: u32,
}

impl OutputInfo {
    /// Refresh rate in whole frames per second, if known.
    pub fn framerate(&self) -> Option<u32> {
        (self.refresh_mhz > 0).then(|| ((self.refresh_mhz + 500) / 1000) as u32)
    }
}

/// Picks the output to capture.
pub trait OutputChooser {
    fn choose(&mut self, outputs: &[OutputInfo]) -> Option<OutputId>;
}

/// Result of running one chooser command.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ChooserOutcome {
    Selected(String),
    Cancelled,
    /// The command could not be run; try the next candidate
    Unavailable,
}

#[derive(Debug, Clone)]
pub struct CommandChooser {
    chooser_type: ChooserType,
    command: Option<String>,
    output_name: Option<String>,
}

impl CommandChooser {
    pub fn new(
        chooser_type: ChooserType,
        command: Option<String>,
        output_name: Option<String>,
    ) -> Self {
        Self {
            chooser_type,
            command: command.filter(|c| !c.trim().is_empty()),
            output_name: output_name.filter(|n| !n.is_empty()),
        }
    }

    pub fn from_config(config: &ScreencastConfig) -> Self {
        Self::new(
            config.chooser_type,
            config.chooser_cmd.clone(),
            config.output_name.clone(),
        )
    }

    /// Configured output if present, else the first one.
    fn choose_without_asking(&self, outputs: &[OutputInfo]) -> Option<OutputId> {
        if let Some(name) = &self.output_name {
            if let Some(output) = outputs.iter().find(|o| &o.name == name) {
                return Some(output.id);
            }
            tracing::warn!("configured output {} not found, using the first output", name);
        }
        outputs.first().map(|o| o.id)
    }

    fn try_candidates(
        &self,
        candidates: &[&str],
        outputs: &[OutputInfo],
        dmenu: bool,
    ) -> Option<ChooserOutcome> {
        candidates
            .iter()
            .map(|cmd| run_chooser(cmd, outputs, dmenu))
            .find(|outcome| *outcome != ChooserOutcome::Unavailable)
    }

    fn outcome(&self, outputs: &[OutputInfo]) -> Option<ChooserOutcome> {
        match (self.chooser_type, self.command.as_deref()) {
            (ChooserType::None, _) => None,
            (ChooserType::Simple, Some(cmd)) | (ChooserType::Default, Some(cmd)) => {
                Some(run_chooser(cmd, outputs, false))
            }
            (ChooserType::Dmenu, Some(cmd)) => Some(run_chooser(cmd, outputs, true)),
            (ChooserType::Simple, None) => self.try_candidates(SIMPLE_CHOOSERS, outputs, false),
            (ChooserType::Dmenu, None) => self.try_candidates(DMENU_CHOOSERS, outputs, true),
            (ChooserType::Default, None) => self
                .try_candidates(SIMPLE_CHOOSERS, outputs, false)
                .or_else(|| self.try_candidates(DMENU_CHOOSERS, outputs, true)),
        }
    }
}

impl OutputChooser for CommandChooser {
    fn choose(&mut self, outputs: &[OutputInfo]) -> Option<OutputId> {
        if outputs.is_empty() {
            tracing::warn!("no outputs to choose from");
            return None;
        }

        match self.outcome(outputs) {
            Some(ChooserOutcome::Selected(name)) => {
                let found = outputs.iter().find(|o| o.name == name).map(|o| o.id);
                if found.is_none() {
                    tracing::warn!("chooser picked unknown output {:?}", name);
                }
                found
            }
            Some(ChooserOutcome::Cancelled) => {
                tracing::info!("output selection cancelled");
                None
            }
            Some(ChooserOutcome::Unavailable) | None => self.choose_without_asking(outputs),
        }
    }
}

/// Run a chooser command and read the selected output name from its stdout.
fn run_chooser(cmd: &str, outputs: &[OutputInfo], dmenu: bool) -> ChooserOutcome {
    tracing::debug!("running chooser: {}", cmd);

    let child = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .stdin(if dmenu { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn();

    let mut child = match child {
        Ok(child) => child,
        Err(e) => {
            tracing::warn!("failed to run chooser {}: {}", cmd, e);
            return ChooserOutcome::Unavailable;
        }
    };

    if dmenu {
        if let Some(mut stdin) = child.stdin.take() {
            let menu: String = outputs.iter().map(|o| format!("{}\n", o.name)).collect();
            // The chooser may exit before reading everything
            if let Err(e) = stdin.write_all(menu.as_bytes()) {
                tracing::debug!("chooser closed stdin early: {}", e);
            }
        }
    }

    let output = match child.wait_with_output() {
        Ok(output) => output,
        Err(e) => {
            tracing::warn!("chooser {} failed: {}", cmd, e);
            return ChooserOutcome::Unavailable;
        }
    };

    if output.status.code() == Some(EXIT_COMMAND_NOT_FOUND) {
        tracing::debug!("chooser {} not installed", cmd);
        return ChooserOutcome::Unavailable;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let selection = stdout.lines().next().unwrap_or("").trim();
    tracing::debug!(
        "chooser response: '{}' (exit: {:?})",
        selection,
        output.status.code()
    );

    if !output.status.success() || selection.is_empty() {
        return ChooserOutcome::Cancelled;
    }
    ChooserOutcome::Selected(selection.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outputs() -> Vec<OutputInfo> {
        ["eDP-1", "DP-2", "HDMI-A-1"]
            .iter()
            .enumerate()
            .map(|(i, name)| OutputInfo {
                id: OutputId(10 + i as u32),
                name: name.to_string(),
                description: String::new(),
                width: 1920,
                height: 1080,
                refresh_mhz: 59_951,
                transform: 0,
            })
            .collect()
    }

    #[test]
    fn test_none_uses_configured_output() {
        let mut chooser = CommandChooser::new(ChooserType::None, None, Some("DP-2".into()));
        assert_eq!(chooser.choose(&outputs()), Some(OutputId(11)));
    }

    #[test]
    fn test_none_falls_back_to_first_output() {
        let mut chooser = CommandChooser::new(ChooserType::None, None, Some("DP-9".into()));
        assert_eq!(chooser.choose(&outputs()), Some(OutputId(10)));
    }

    #[test]
    fn test_no_outputs() {
        let mut chooser = CommandChooser::new(ChooserType::None, None, None);
        assert_eq!(chooser.choose(&[]), None);
    }

    #[test]
    fn test_simple_command() {
        let mut chooser =
            CommandChooser::new(ChooserType::Simple, Some("echo HDMI-A-1".into()), None);
        assert_eq!(chooser.choose(&outputs()), Some(OutputId(12)));
    }

    #[test]
    fn test_dmenu_reads_names_from_stdin() {
        let mut chooser = CommandChooser::new(ChooserType::Dmenu, Some("tail -n 1".into()), None);
        assert_eq!(chooser.choose(&outputs()), Some(OutputId(12)));

        let mut chooser = CommandChooser::new(ChooserType::Dmenu, Some("grep DP-2".into()), None);
        assert_eq!(chooser.choose(&outputs()), Some(OutputId(11)));
    }

    #[test]
    fn test_cancelled_selection() {
        let mut chooser = CommandChooser::new(ChooserType::Simple, Some("exit 1".into()), None);
        assert_eq!(chooser.choose(&outputs()), None);
    }

    #[test]
    fn test_unknown_output_name() {
        let mut chooser = CommandChooser::new(ChooserType::Simple, Some("echo VGA-7".into()), None);
        assert_eq!(chooser.choose(&outputs()), None);
    }

    #[test]
    fn test_missing_command_falls_back() {
        let mut chooser = CommandChooser::new(
            ChooserType::Simple,
            Some("wlcast-no-such-chooser-binary".into()),
            Some("HDMI-A-1".into()),
        );
        assert_eq!(chooser.choose(&outputs()), Some(OutputId(12)));
    }

    #[test]
    fn test_framerate_rounding() {
        assert_eq!(outputs()[0].framerate(), Some(60));
        let mut unknown = outputs()[0].clone();
        unknown.refresh_mhz = 0;
        assert_eq!(unknown.framerate(), None);
    }
}
