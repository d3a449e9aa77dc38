//! Pause points between manifest patching and rebuild, where the user (or
//! their script) can inspect or change the decoded tree.

use crate::gadgetpatch::error::{PatchError, Result};
use inquire::{Confirm, InquireError};
use std::path::Path;
use std::process::Command;
use tracing::{info, warn};

/// Placeholder in `--exec` commands replaced with the working directory.
pub const TMP_PATH_PLACEHOLDER: &str = "TMP_PATH_HERE";

pub trait Checkpoint: Send + Sync {
    fn name(&self) -> &str;

    /// Runs with the decoded tree at `work_dir`. An error stops the session.
    fn before_rebuild(&self, work_dir: &Path) -> Result<()>;
}

/// Yes/no question put to the user.
pub trait Prompt: Send + Sync {
    fn confirm(&self, message: &str, help: Option<&str>) -> Result<bool>;
}

/// Asks on the terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalPrompt;

impl Prompt for TerminalPrompt {
    fn confirm(&self, message: &str, help: Option<&str>) -> Result<bool> {
        let mut question = Confirm::new(message).with_default(true);
        if let Some(help) = help {
            question = question.with_help_message(help);
        }

        question.prompt().map_err(prompt_err)
    }
}

fn prompt_err(e: InquireError) -> PatchError {
    match e {
        InquireError::OperationCanceled | InquireError::OperationInterrupted => PatchError::Aborted,
        other => PatchError::Hook(format!("prompt failed: {other}")),
    }
}

/// Runs a shell command inside the working directory.
pub struct ExecCommand {
    command: String,
    pass_temp_path: bool,
    assume_yes: bool,
    prompt: Box<dyn Prompt>,
}

impl ExecCommand {
    pub fn new(command: impl Into<String>, pass_temp_path: bool, assume_yes: bool) -> Self {
        Self {
            command: command.into(),
            pass_temp_path,
            assume_yes,
            prompt: Box::new(TerminalPrompt),
        }
    }

    pub fn with_prompt(mut self, prompt: impl Prompt + 'static) -> Self {
        self.prompt = Box::new(prompt);
        self
    }

    /// The command line actually handed to the shell.
    pub fn render(&self, work_dir: &Path) -> String {
        if !self.pass_temp_path {
            return self.command.clone();
        }

        let quoted = shell_quote(&work_dir.to_string_lossy());

        if self.command.contains(TMP_PATH_PLACEHOLDER) {
            self.command.replace(TMP_PATH_PLACEHOLDER, &quoted)
        } else {
            format!("{} {quoted}", self.command)
        }
    }
}

#[cfg(unix)]
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(not(unix))]
fn shell_quote(s: &str) -> String {
    format!("\"{s}\"")
}

#[cfg(unix)]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(not(unix))]
fn shell(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

impl Checkpoint for ExecCommand {
    fn name(&self) -> &str {
        "exec"
    }

    fn before_rebuild(&self, work_dir: &Path) -> Result<()> {
        let command = self.render(work_dir);

        if !self.assume_yes {
            let run = self
                .prompt
                .confirm(&format!("Run `{command}` before rebuilding?"), None)?;

            // the rebuild would miss whatever the command was meant to change
            if !run {
                warn!("Declined `{command}`, stopping");
                return Err(PatchError::Aborted);
            }
        }

        info!("Running `{command}` in {}", work_dir.display());

        let status = shell(&command)
            .current_dir(work_dir)
            .status()
            .map_err(|e| PatchError::Hook(format!("failed to start `{command}`: {e}")))?;

        if !status.success() {
            return Err(PatchError::Hook(format!("`{command}` exited with {status}")));
        }

        Ok(())
    }
}

/// Blocks until the user confirms the rebuild.
pub struct WaitForUser {
    prompt: Box<dyn Prompt>,
}

impl WaitForUser {
    pub fn new() -> Self {
        Self {
            prompt: Box::new(TerminalPrompt),
        }
    }

    pub fn with_prompt(prompt: impl Prompt + 'static) -> Self {
        Self {
            prompt: Box::new(prompt),
        }
    }
}

impl Default for WaitForUser {
    fn default() -> Self {
        Self::new()
    }
}

impl Checkpoint for WaitForUser {
    fn name(&self) -> &str {
        "wait"
    }

    fn before_rebuild(&self, work_dir: &Path) -> Result<()> {
        info!("Decoded APK is at {}", work_dir.display());

        let proceed = self.prompt.confirm(
            "Continue with the rebuild?",
            Some("Edit the decoded files now; answering no aborts"),
        )?;

        if proceed {
            Ok(())
        } else {
            Err(PatchError::Aborted)
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn renders_temp_path() {
        let dir = Path::new("/tmp/app-0123456789ab");

        assert_eq!(ExecCommand::new("ls", false, true).render(dir), "ls");
        assert_eq!(
            ExecCommand::new("ls -la", true, true).render(dir),
            "ls -la '/tmp/app-0123456789ab'"
        );
        assert_eq!(
            ExecCommand::new("cp hook.js TMP_PATH_HERE/assets/", true, true).render(dir),
            "cp hook.js '/tmp/app-0123456789ab'/assets/"
        );
        assert_eq!(
            ExecCommand::new("echo", true, true).render(Path::new("/tmp/it's")),
            r"echo '/tmp/it'\''s'"
        );
    }

    #[test]
    fn runs_inside_work_dir() {
        let dir = tempfile::tempdir().unwrap();

        ExecCommand::new("touch marker", false, true)
            .before_rebuild(dir.path())
            .unwrap();

        assert!(dir.path().join("marker").is_file());
    }

    #[test]
    fn non_zero_exit_is_fatal() {
        let dir = tempfile::tempdir().unwrap();

        let err = ExecCommand::new("exit 7", false, true)
            .before_rebuild(dir.path())
            .unwrap_err();

        assert!(matches!(err, PatchError::Hook(msg) if msg.contains("exit 7")));
    }

    struct Answer(bool);

    impl Prompt for Answer {
        fn confirm(&self, _message: &str, _help: Option<&str>) -> Result<bool> {
            Ok(self.0)
        }
    }

    #[test]
    fn declining_exec_aborts_without_running() {
        let dir = tempfile::tempdir().unwrap();

        let err = ExecCommand::new("touch marker", false, false)
            .with_prompt(Answer(false))
            .before_rebuild(dir.path())
            .unwrap_err();

        assert!(matches!(err, PatchError::Aborted));
        assert!(!dir.path().join("marker").exists());

        ExecCommand::new("touch marker", false, false)
            .with_prompt(Answer(true))
            .before_rebuild(dir.path())
            .unwrap();
        assert!(dir.path().join("marker").is_file());
    }

    #[test]
    fn declining_wait_aborts() {
        let dir = tempfile::tempdir().unwrap();

        assert!(matches!(
            WaitForUser::with_prompt(Answer(false)).before_rebuild(dir.path()),
            Err(PatchError::Aborted)
        ));
        assert!(WaitForUser::with_prompt(Answer(true)).before_rebuild(dir.path()).is_ok());
    }
}
