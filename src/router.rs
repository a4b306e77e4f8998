//! Event routing from the host into the watchdog.
//!
//! The host (an editor plugin) writes one JSON object per line describing
//! what just happened. The router decides which of the three watchdog intakes
//! each event maps to, if any, and calls it. All document filtering happens
//! here; the controller trusts what it is given.

use crate::config::RouterConfig;
use crate::subscription::{Subscription, SubscriptionSet};
use crate::watchdog::WatchdogController;
use glob::{MatchOptions, Pattern};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;

/// Raw host events, as written on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HostEvent {
    TextChanged {
        path: PathBuf,
        #[serde(default = "default_scheme")]
        scheme: String,
        #[serde(default)]
        changes: usize,
    },
    SelectionChanged {
        kind: SelectionKind,
    },
    ActiveTerminalChanged {
        #[serde(default)]
        terminal: Option<String>,
    },
    TerminalOpened {
        name: String,
    },
    TerminalClosed {
        name: String,
    },
}

fn default_scheme() -> String {
    "file".to_string()
}

/// How a selection change came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionKind {
    Keyboard,
    Mouse,
    /// Moved by a command or extension, not by the user.
    Command,
}

/// The three intakes of the watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogEvent {
    ContentChange,
    UserActivity,
    TerminalFocus,
}

#[derive(Debug)]
pub enum RouterError {
    InvalidPattern {
        pattern: String,
        source: glob::PatternError,
    },
}

impl std::fmt::Display for RouterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouterError::InvalidPattern { pattern, source } => {
                write!(f, "invalid exclude pattern {pattern:?}: {source}")
            }
        }
    }
}

impl std::error::Error for RouterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RouterError::InvalidPattern { source, .. } => Some(source),
        }
    }
}

/// Decides which documents count as source code.
#[derive(Debug, Clone)]
pub struct DocumentFilter {
    exclude: Vec<Pattern>,
    extensions: Vec<String>,
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

impl DocumentFilter {
    pub fn from_config(config: &RouterConfig) -> Result<Self, RouterError> {
        let exclude = config
            .exclude_patterns
            .iter()
            .map(|p| {
                Pattern::new(p).map_err(|e| RouterError::InvalidPattern {
                    pattern: p.clone(),
                    source: e,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let extensions = config
            .code_extensions
            .iter()
            .map(|e| e.to_lowercase())
            .collect();
        Ok(Self {
            exclude,
            extensions,
        })
    }

    /// Only file-backed documents, outside excluded locations, with a known
    /// source extension.
    pub fn is_relevant(&self, scheme: &str, path: &Path) -> bool {
        if scheme != "file" {
            tracing::debug!(scheme, "document excluded by scheme");
            return false;
        }

        let path_str = path.to_string_lossy();
        if let Some(pattern) = self
            .exclude
            .iter()
            .find(|p| p.matches_with(&path_str, MATCH_OPTIONS))
        {
            tracing::debug!(path = %path_str, pattern = %pattern, "document excluded by pattern");
            return false;
        }

        let lower = path_str.to_lowercase();
        match self.extensions.iter().find(|ext| lower.ends_with(ext.as_str())) {
            Some(ext) => {
                tracing::debug!(path = %path_str, extension = %ext, "document included");
                true
            }
            None => {
                tracing::debug!(path = %path_str, "document excluded, no source extension");
                false
            }
        }
    }

    /// Map a host event to at most one watchdog intake.
    pub fn classify(&self, event: &HostEvent) -> Option<WatchdogEvent> {
        match event {
            HostEvent::TextChanged {
                path,
                scheme,
                changes,
            } => {
                tracing::trace!(path = %path.display(), changes, "text changed");
                self.is_relevant(scheme, path)
                    .then_some(WatchdogEvent::ContentChange)
            }
            HostEvent::SelectionChanged { kind } => match kind {
                SelectionKind::Keyboard | SelectionKind::Mouse => Some(WatchdogEvent::UserActivity),
                SelectionKind::Command => None,
            },
            HostEvent::ActiveTerminalChanged { terminal } => {
                terminal.as_ref().map(|_| WatchdogEvent::TerminalFocus)
            }
            HostEvent::TerminalOpened { .. } => Some(WatchdogEvent::TerminalFocus),
            HostEvent::TerminalClosed { name } => {
                tracing::debug!(terminal = %name, "terminal closed");
                None
            }
        }
    }
}

/// Classify `event` and deliver it to `controller`. Returns what was delivered.
pub fn route(
    filter: &DocumentFilter,
    controller: &WatchdogController,
    event: &HostEvent,
) -> Option<WatchdogEvent> {
    let classified = filter.classify(event);
    match classified {
        Some(WatchdogEvent::ContentChange) => controller.on_code_change(),
        Some(WatchdogEvent::UserActivity) => controller.on_user_activity(),
        Some(WatchdogEvent::TerminalFocus) => controller.on_terminal_focus(),
        None => tracing::trace!(?event, "event ignored"),
    }
    classified
}

/// Routes host event channels into one controller.
///
/// Each attached channel gets its own pump task, held as a subscription.
/// `dispose` cancels all of them.
pub struct EventRouter {
    controller: Arc<WatchdogController>,
    filter: Arc<DocumentFilter>,
    subscriptions: SubscriptionSet,
}

impl EventRouter {
    pub fn new(controller: Arc<WatchdogController>, filter: DocumentFilter) -> Self {
        Self {
            controller,
            filter: Arc::new(filter),
            subscriptions: SubscriptionSet::new(),
        }
    }

    #[allow(dead_code)]
    pub fn dispatch(&self, event: &HostEvent) -> Option<WatchdogEvent> {
        route(&self.filter, &self.controller, event)
    }

    /// Start delivering events from `events` until the sender side closes or
    /// the router is disposed.
    pub fn attach(&mut self, name: &str, mut events: mpsc::Receiver<HostEvent>) {
        let controller = Arc::clone(&self.controller);
        let filter = Arc::clone(&self.filter);
        let source = name.to_string();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                route(&filter, &controller, &event);
            }
            tracing::debug!(%source, "event source closed");
        });
        self.subscriptions.push(Subscription::from_task(name, task));
    }

    pub fn dispose(&mut self) {
        tracing::debug!(subscriptions = self.subscriptions.len(), "router disposed");
        self.subscriptions.dispose();
    }
}

/// Read newline-delimited JSON host events from `reader` into `tx`.
///
/// Blank lines are skipped; malformed lines are logged and skipped. Returns
/// the number of events forwarded once the reader hits EOF or the receiver
/// goes away.
pub async fn read_host_events<R>(reader: R, tx: mpsc::Sender<HostEvent>) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut forwarded = 0;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<HostEvent>(line) {
            Ok(event) => {
                if tx.send(event).await.is_err() {
                    tracing::debug!("event receiver dropped, stopping reader");
                    break;
                }
                forwarded += 1;
            }
            Err(e) => tracing::warn!(error = %e, line, "skipping malformed host event"),
        }
    }
    Ok(forwarded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::testing::RecordingSink;
    use crate::config::WatchdogConfig;
    use crate::watchdog::Phase;
    use std::time::Duration;

    fn filter() -> DocumentFilter {
        DocumentFilter::from_config(&RouterConfig::default()).unwrap()
    }

    fn text_changed(path: &str) -> HostEvent {
        HostEvent::TextChanged {
            path: PathBuf::from(path),
            scheme: "file".to_string(),
            changes: 1,
        }
    }

    #[test]
    fn test_source_file_is_content_change() {
        assert_eq!(
            filter().classify(&text_changed("/home/dev/app/src/main.rs")),
            Some(WatchdogEvent::ContentChange)
        );
        assert_eq!(
            filter().classify(&text_changed("/home/dev/app/Component.TSX")),
            Some(WatchdogEvent::ContentChange)
        );
    }

    #[test]
    fn test_non_file_scheme_is_ignored() {
        let event = HostEvent::TextChanged {
            path: PathBuf::from("extension-output-1"),
            scheme: "output".to_string(),
            changes: 1,
        };
        assert_eq!(filter().classify(&event), None);
    }

    #[test]
    fn test_excluded_locations_are_ignored() {
        let f = filter();
        for path in [
            "/p/node_modules/left-pad/index.js",
            "/p/.git/COMMIT_EDITMSG",
            "/p/.github/workflows/ci.json",
            "/p/.vscode/settings.json",
            "/p/target/debug/build/out.rs",
            "/p/package-lock.json",
            "/p/Cargo.lock",
            "/p/logs/server.log",
            "/p/NODE_MODULES/x.js",
        ] {
            assert_eq!(f.classify(&text_changed(path)), None, "{path}");
        }
    }

    #[test]
    fn test_unknown_extension_is_ignored() {
        assert_eq!(filter().classify(&text_changed("/p/notes.txt")), None);
        assert_eq!(filter().classify(&text_changed("/p/Makefile")), None);
    }

    #[test]
    fn test_selection_kinds() {
        let f = filter();
        for (kind, expected) in [
            (SelectionKind::Keyboard, Some(WatchdogEvent::UserActivity)),
            (SelectionKind::Mouse, Some(WatchdogEvent::UserActivity)),
            (SelectionKind::Command, None),
        ] {
            assert_eq!(f.classify(&HostEvent::SelectionChanged { kind }), expected);
        }
    }

    #[test]
    fn test_terminal_events() {
        let f = filter();
        assert_eq!(
            f.classify(&HostEvent::ActiveTerminalChanged {
                terminal: Some("zsh".to_string())
            }),
            Some(WatchdogEvent::TerminalFocus)
        );
        assert_eq!(
            f.classify(&HostEvent::ActiveTerminalChanged { terminal: None }),
            None
        );
        assert_eq!(
            f.classify(&HostEvent::TerminalOpened {
                name: "bash".to_string()
            }),
            Some(WatchdogEvent::TerminalFocus)
        );
        assert_eq!(
            f.classify(&HostEvent::TerminalClosed {
                name: "bash".to_string()
            }),
            None
        );
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let config = RouterConfig {
            exclude_patterns: vec!["[unclosed".to_string()],
            ..Default::default()
        };
        let err = DocumentFilter::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("[unclosed"));
    }

    #[test]
    fn test_wire_format() {
        let event: HostEvent =
            serde_json::from_str(r#"{"event":"text_changed","path":"/p/a.rs"}"#).unwrap();
        assert_eq!(event, text_changed_with_changes("/p/a.rs", 0));

        let event: HostEvent =
            serde_json::from_str(r#"{"event":"selection_changed","kind":"mouse"}"#).unwrap();
        assert_eq!(
            event,
            HostEvent::SelectionChanged {
                kind: SelectionKind::Mouse
            }
        );

        let event: HostEvent =
            serde_json::from_str(r#"{"event":"active_terminal_changed","terminal":null}"#)
                .unwrap();
        assert_eq!(event, HostEvent::ActiveTerminalChanged { terminal: None });
    }

    fn text_changed_with_changes(path: &str, changes: usize) -> HostEvent {
        HostEvent::TextChanged {
            path: PathBuf::from(path),
            scheme: "file".to_string(),
            changes,
        }
    }

    #[tokio::test]
    async fn test_reader_skips_blank_and_malformed_lines() {
        let input = b"{\"event\":\"terminal_opened\",\"name\":\"zsh\"}\n\
                      \n\
                      not json\n\
                      {\"event\":\"bogus\"}\n\
                      {\"event\":\"selection_changed\",\"kind\":\"keyboard\"}\n";
        let (tx, mut rx) = mpsc::channel(8);
        let forwarded = read_host_events(&input[..], tx).await.unwrap();
        assert_eq!(forwarded, 2);
        assert_eq!(
            rx.recv().await,
            Some(HostEvent::TerminalOpened {
                name: "zsh".to_string()
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(HostEvent::SelectionChanged {
                kind: SelectionKind::Keyboard
            })
        );
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_reader_stops_when_receiver_dropped() {
        let input = b"{\"event\":\"terminal_opened\",\"name\":\"a\"}\n\
                      {\"event\":\"terminal_opened\",\"name\":\"b\"}\n";
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        assert_eq!(read_host_events(&input[..], tx).await.unwrap(), 0);
    }

    fn watchdog(sink: Arc<RecordingSink>) -> Arc<WatchdogController> {
        let config = WatchdogConfig {
            countdown_duration: Duration::from_secs(60),
            ..Default::default()
        };
        Arc::new(WatchdogController::new(config, sink))
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_drives_controller() {
        let sink = Arc::new(RecordingSink::default());
        let controller = watchdog(sink.clone());
        let router = EventRouter::new(Arc::clone(&controller), filter());

        // Selection alone never starts a countdown.
        router.dispatch(&HostEvent::SelectionChanged {
            kind: SelectionKind::Keyboard,
        });
        assert_eq!(controller.snapshot().phase, Phase::Idle);

        // Edits to excluded files never start one either.
        router.dispatch(&text_changed("/p/node_modules/x.js"));
        assert_eq!(controller.snapshot().phase, Phase::Idle);

        assert_eq!(
            router.dispatch(&text_changed("/p/src/lib.rs")),
            Some(WatchdogEvent::ContentChange)
        );
        assert_eq!(controller.snapshot().phase, Phase::Armed);

        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(sink.fired(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attached_channel_routes_until_disposed() {
        let sink = Arc::new(RecordingSink::default());
        let controller = watchdog(sink.clone());
        let mut router = EventRouter::new(Arc::clone(&controller), filter());
        let (tx, rx) = mpsc::channel(8);
        router.attach("test", rx);

        tx.send(text_changed("/p/src/app.py")).await.unwrap();
        settle().await;
        assert_eq!(controller.snapshot().phase, Phase::Armed);

        router.dispose();
        controller.dispose();
        settle().await;

        // The pump is gone, so the channel is closed.
        assert!(tx.send(text_changed("/p/src/app.py")).await.is_err());
        tokio::time::advance(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(sink.fired(), 0);
    }
}
