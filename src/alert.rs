/// Alert delivery: what happens when the inactivity countdown elapses.
///
/// The controller only decides *when* `fire()` is called. Sinks decide what a
/// fire looks like: a desktop notification with a sound, or a terminal bell.
/// Delivery is best-effort; failures come back as `SinkError` for the caller
/// to log and are never retried.
use crate::config::{AlertBackend, AlertConfig};
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

/// Errors produced while delivering an alert.
#[derive(Debug)]
pub enum SinkError {
    /// A notification or sound helper could not be started.
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// Writing to the terminal failed.
    Io(std::io::Error),
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkError::Spawn { program, source } => {
                write!(f, "failed to start {}: {}", program, source)
            }
            SinkError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for SinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SinkError::Spawn { source, .. } => Some(source),
            SinkError::Io(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for SinkError {
    fn from(e: std::io::Error) -> Self {
        SinkError::Io(e)
    }
}

/// Capability invoked exactly once per countdown expiry.
pub trait AlertSink: Send + Sync {
    fn fire(&self) -> Result<(), SinkError>;
}

/// Build the sink selected by `[alert] backend`.
pub fn sink_from_config(config: &AlertConfig) -> Arc<dyn AlertSink> {
    match config.backend {
        AlertBackend::Desktop => Arc::new(DesktopAlertSink::new(config.clone())),
        AlertBackend::Bell => Arc::new(BellAlertSink::new(config.message.clone())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Platform::MacOs
        } else if cfg!(target_os = "windows") {
            Platform::Windows
        } else {
            Platform::Linux
        }
    }
}

/// An external program invocation: program name plus arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl HelperCommand {
    fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

fn escape_applescript_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Desktop notification command, if the platform has one.
pub fn notification_command(platform: Platform, title: &str, body: &str) -> Option<HelperCommand> {
    match platform {
        Platform::Linux => Some(HelperCommand::new(
            "notify-send",
            &["--urgency=critical", "--app-name=edit-watchdog", title, body],
        )),
        Platform::MacOs => {
            let script = format!(
                r#"display notification "{}" with title "{}""#,
                escape_applescript_string(body),
                escape_applescript_string(title)
            );
            Some(HelperCommand::new("osascript", &["-e", &script]))
        }
        Platform::Windows => None,
    }
}

/// Repeated alert sound for the platform, run through the platform shell.
pub fn sound_command(platform: Platform, sound_file: Option<&Path>) -> HelperCommand {
    match platform {
        Platform::Linux => {
            let file = sound_file
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "/usr/share/sounds/alsa/Front_Left.wav".to_string());
            let play = format!("(paplay {f} || aplay {f})", f = shell_quote(&file));
            let script = format!("{play} && sleep 0.5 && {play}");
            HelperCommand::new("sh", &["-c", &script])
        }
        Platform::MacOs => {
            let file = sound_file
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "/System/Library/Sounds/Glass.aiff".to_string());
            let play = format!("afplay {}", shell_quote(&file));
            let script = format!("{play} && sleep 0.5 && {play} && sleep 0.5 && {play}");
            HelperCommand::new("sh", &["-c", &script])
        }
        Platform::Windows => HelperCommand::new(
            "powershell",
            &[
                "-c",
                "[console]::beep(800,300); Start-Sleep -Milliseconds 200; \
                 [console]::beep(1000,300); Start-Sleep -Milliseconds 200; \
                 [console]::beep(800,300)",
            ],
        ),
    }
}

/// Desktop notification plus platform sound.
///
/// Helpers run detached; their exit status is only logged. Must be fired from
/// inside a tokio runtime.
pub struct DesktopAlertSink {
    config: AlertConfig,
    platform: Platform,
}

impl DesktopAlertSink {
    pub fn new(config: AlertConfig) -> Self {
        Self {
            config,
            platform: Platform::current(),
        }
    }

    /// Commands a fire would run, in order.
    pub fn commands(&self) -> Vec<HelperCommand> {
        let mut commands = Vec::new();
        if self.config.notification {
            match notification_command(self.platform, &self.config.title, &self.config.message) {
                Some(cmd) => commands.push(cmd),
                None => tracing::debug!(platform = ?self.platform, "no desktop notifier"),
            }
        }
        if self.config.sound {
            commands.push(sound_command(
                self.platform,
                self.config.sound_file.as_deref(),
            ));
        }
        commands
    }
}

fn spawn_helper(cmd: &HelperCommand) -> Result<(), SinkError> {
    let mut child = tokio::process::Command::new(&cmd.program)
        .args(&cmd.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| SinkError::Spawn {
            program: cmd.program.clone(),
            source: e,
        })?;

    let program = cmd.program.clone();
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) if status.success() => {}
            Ok(status) => tracing::debug!(%program, %status, "alert helper exited unsuccessfully"),
            Err(e) => tracing::warn!(%program, error = %e, "failed to wait for alert helper"),
        }
    });
    Ok(())
}

impl AlertSink for DesktopAlertSink {
    fn fire(&self) -> Result<(), SinkError> {
        // Try every helper; a missing notifier should not silence the sound.
        let mut first_err = None;
        for cmd in self.commands() {
            if let Err(e) = spawn_helper(&cmd) {
                tracing::warn!(error = %e, "alert helper failed to start");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Rings the terminal bell on stderr and logs the alert.
pub struct BellAlertSink {
    message: String,
}

impl BellAlertSink {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    fn ring(&self, out: &mut impl Write) -> Result<(), SinkError> {
        out.write_all(b"\x07")?;
        out.flush()?;
        Ok(())
    }
}

impl AlertSink for BellAlertSink {
    fn fire(&self) -> Result<(), SinkError> {
        tracing::warn!(message = %self.message, "inactivity alert");
        self.ring(&mut std::io::stderr())
    }
}

/// Tell the user, once, that the watchdog could not start.
///
/// Waits for the notifier to exit and swallows its own failures.
pub async fn notify_activation_failure(error: &dyn std::error::Error) {
    let body = format!("Failed to activate: {error}");
    if let Some(cmd) = notification_command(Platform::current(), "edit-watchdog", &body) {
        show_notice(&cmd).await;
    }
}

/// Run `cmd` to completion; returns whether it exited successfully.
async fn show_notice(cmd: &HelperCommand) -> bool {
    match tokio::process::Command::new(&cmd.program)
        .args(&cmd.args)
        .output()
        .await
    {
        Ok(output) if output.status.success() => true,
        Ok(output) => {
            tracing::debug!(status = %output.status, "activation notice not shown");
            false
        }
        Err(e) => {
            tracing::debug!(error = %e, "activation notice not shown");
            false
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_linux_notification_command() {
        let cmd = notification_command(Platform::Linux, "Title", "Body").unwrap();
        assert_eq!(cmd.program, "notify-send");
        assert_eq!(
            cmd.args,
            vec!["--urgency=critical", "--app-name=edit-watchdog", "Title", "Body"]
        );
    }

    #[test]
    fn test_macos_notification_escapes_quotes() {
        let cmd = notification_command(Platform::MacOs, "Say \"hi\"", "back\\slash").unwrap();
        assert_eq!(cmd.program, "osascript");
        assert_eq!(
            cmd.args[1],
            r#"display notification "back\\slash" with title "Say \"hi\"""#
        );
    }

    #[test]
    fn test_windows_has_no_notifier() {
        assert!(notification_command(Platform::Windows, "t", "b").is_none());
    }

    #[test]
    fn test_linux_sound_falls_back_between_players() {
        let cmd = sound_command(Platform::Linux, None);
        assert_eq!(cmd.program, "sh");
        assert!(cmd.args[1].contains("paplay '/usr/share/sounds/alsa/Front_Left.wav'"));
        assert!(cmd.args[1].contains("|| aplay"));
    }

    #[test]
    fn test_sound_file_override_is_quoted() {
        let file = PathBuf::from("/tmp/it's done.wav");
        let cmd = sound_command(Platform::MacOs, Some(&file));
        assert!(cmd.args[1].starts_with(r"afplay '/tmp/it'\''s done.wav'"));
    }

    #[test]
    fn test_windows_sound_uses_powershell_beeps() {
        let cmd = sound_command(Platform::Windows, None);
        assert_eq!(cmd.program, "powershell");
        assert!(cmd.args[1].contains("[console]::beep(1000,300)"));
    }

    #[test]
    fn test_desktop_commands_respect_toggles() {
        let sink = DesktopAlertSink {
            config: AlertConfig {
                notification: false,
                ..Default::default()
            },
            platform: Platform::Linux,
        };
        let commands = sink.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].program, "sh");

        let silent = DesktopAlertSink {
            config: AlertConfig {
                notification: false,
                sound: false,
                ..Default::default()
            },
            platform: Platform::Linux,
        };
        assert!(silent.commands().is_empty());
    }

    #[tokio::test]
    async fn test_desktop_fire_reports_missing_helper() {
        let sink = DesktopAlertSink {
            config: AlertConfig {
                sound: false,
                ..Default::default()
            },
            platform: Platform::Linux,
        };
        // Swap the notifier for a binary that cannot exist.
        let mut cmd = sink.commands().remove(0);
        cmd.program = "edit-watchdog-missing-helper-xyz".to_string();
        let err = spawn_helper(&cmd).unwrap_err();
        assert!(matches!(err, SinkError::Spawn { .. }));
        assert!(err.to_string().contains("failed to start"));
    }

    #[tokio::test]
    async fn test_activation_notice_swallows_missing_notifier() {
        let cmd = HelperCommand {
            program: "edit-watchdog-missing-helper-xyz".to_string(),
            args: vec!["edit-watchdog".to_string()],
        };
        assert!(!show_notice(&cmd).await);
    }

    #[test]
    fn test_bell_writes_bel() {
        let sink = BellAlertSink::new("done");
        let mut out = Vec::new();
        sink.ring(&mut out).unwrap();
        assert_eq!(out, b"\x07");
    }

    #[test]
    fn test_sink_from_config_selects_backend() {
        let config = AlertConfig {
            backend: AlertBackend::Bell,
            ..Default::default()
        };
        // Bell sink never spawns anything, so firing it is safe in tests.
        assert!(sink_from_config(&config).fire().is_ok());
    }
}
