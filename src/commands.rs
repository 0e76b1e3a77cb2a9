// =============================================================================
// Command Bus — file-drop IPC between the operator CLI and the orchestrator
// =============================================================================
//
// Two files in a dedicated directory, both written atomically via
// write-then-rename so neither side can observe a torn read:
//
//   pending_command.json   operator -> orchestrator
//   command_response.json  orchestrator -> operator
//
// A rolling command_history.json keeps the last 200 requests. The
// orchestrator drains the directory at every cycle and every sleep tick;
// the client polls for the response with a short timeout.
// =============================================================================

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

const PENDING_FILE: &str = "pending_command.json";
const RESPONSE_FILE: &str = "command_response.json";
const HISTORY_FILE: &str = "command_history.json";
const HISTORY_LIMIT: usize = 200;

/// The closed set of operator commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    // Decisions
    Yes,
    No,
    // Control
    Hold,
    Start,
    Stop,
    Estop,
    Update,
    // Information
    Status,
    Portfolio,
    Defcon,
    Trades,
    Broker,
    Help,
    // Configuration
    Mode,
    Interval,
    // Manual trading
    Buy,
    Sell,
    // Stage triggers
    Briefing,
    Research,
    Hunt,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Yes => "yes",
            Self::No => "no",
            Self::Hold => "hold",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Estop => "estop",
            Self::Update => "update",
            Self::Status => "status",
            Self::Portfolio => "portfolio",
            Self::Defcon => "defcon",
            Self::Trades => "trades",
            Self::Broker => "broker",
            Self::Help => "help",
            Self::Mode => "mode",
            Self::Interval => "interval",
            Self::Buy => "buy",
            Self::Sell => "sell",
            Self::Briefing => "briefing",
            Self::Research => "research",
            Self::Hunt => "hunt",
        }
    }

    /// Canonical name or a known alias, with or without a leading slash.
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim().trim_start_matches('/').to_lowercase();
        match name.as_str() {
            "yes" | "y" | "approve" => Some(Self::Yes),
            "no" | "n" | "reject" | "deny" => Some(Self::No),
            "hold" | "pause" | "wait" => Some(Self::Hold),
            "start" | "resume" | "go" => Some(Self::Start),
            "stop" | "quit" | "shutdown" => Some(Self::Stop),
            "estop" | "emergency" | "kill" | "panic" => Some(Self::Estop),
            "update" | "refresh" | "cycle" | "now" => Some(Self::Update),
            "status" | "info" | "s" => Some(Self::Status),
            "portfolio" | "pf" | "positions" => Some(Self::Portfolio),
            "defcon" | "dc" | "alert" => Some(Self::Defcon),
            "trades" | "pending" | "recent" => Some(Self::Trades),
            "broker" | "agent" => Some(Self::Broker),
            "help" | "h" | "?" => Some(Self::Help),
            "mode" => Some(Self::Mode),
            "interval" | "freq" => Some(Self::Interval),
            "buy" | "long" => Some(Self::Buy),
            "sell" | "exit" | "close" => Some(Self::Sell),
            "briefing" | "daily" | "report" => Some(Self::Briefing),
            "research" | "scan" => Some(Self::Research),
            "hunt" | "hound" | "sniff" => Some(Self::Hunt),
            _ => None,
        }
    }

    pub fn help_text() -> &'static str {
        "Decisions:     yes, no, buy TICKER SHARES [@PRICE], sell TICKER [ID] [@PRICE]\n\
         Control:       hold, start, stop, estop, update, research, hunt\n\
         Information:   status, portfolio, defcon, trades, broker, briefing, help\n\
         Configuration: mode <disabled|semi_auto|full_auto>, interval <minutes>"
    }
}

/// One request dropped by the operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    #[serde(default)]
    pub args: String,
    pub timestamp: String,
}

impl CommandRequest {
    pub fn new(command: Command, args: &str) -> Self {
        Self {
            command: command.as_str().to_string(),
            args: args.to_string(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn parsed(&self) -> Option<Command> {
        Command::parse(&self.command)
    }
}

/// Structured handler result written back for the operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub ok: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl CommandResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
            data: None,
        }
    }

    pub fn ok_with(message: impl Into<String>, data: Value) -> Self {
        Self {
            ok: true,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            data: None,
        }
    }
}

/// Both sides of the IPC channel; the orchestrator and the `sentinel-cmd`
/// client construct one over the same directory.
pub struct CommandBus {
    dir: PathBuf,
}

impl CommandBus {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create command dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn pending_path(&self) -> PathBuf {
        self.dir.join(PENDING_FILE)
    }

    fn response_path(&self) -> PathBuf {
        self.dir.join(RESPONSE_FILE)
    }

    fn history_path(&self) -> PathBuf {
        self.dir.join(HISTORY_FILE)
    }

    /// Atomic write: sibling tmp file, then rename over the target.
    fn write_atomic(&self, path: &Path, content: &str) -> Result<()> {
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to rename into {}", path.display()))?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Orchestrator side
    // -------------------------------------------------------------------------

    /// Take the pending command, if any. The file is removed so a command is
    /// only ever processed once.
    pub fn poll(&self) -> Option<CommandRequest> {
        let path = self.pending_path();
        if !path.exists() {
            return None;
        }

        let content = std::fs::read_to_string(&path).ok()?;
        let _ = std::fs::remove_file(&path);

        match serde_json::from_str::<CommandRequest>(&content) {
            Ok(request) => {
                info!(command = %request.command, args = %request.args, "command received");
                self.append_history(&request);
                Some(request)
            }
            Err(e) => {
                warn!(error = %e, "malformed command file dropped");
                None
            }
        }
    }

    /// Write the handler's response for the waiting client.
    pub fn respond(&self, response: &CommandResponse) {
        let content = match serde_json::to_string_pretty(response) {
            Ok(content) => content,
            Err(e) => {
                warn!(error = %e, "response serialisation failed");
                return;
            }
        };
        if let Err(e) = self.write_atomic(&self.response_path(), &content) {
            warn!(error = %e, "response write failed");
        }
    }

    /// Append to the rolling history (last 200 kept).
    fn append_history(&self, request: &CommandRequest) {
        let path = self.history_path();
        let mut history: Vec<CommandRequest> = std::fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();

        history.push(request.clone());
        let overflow = history.len().saturating_sub(HISTORY_LIMIT);
        if overflow > 0 {
            history.drain(..overflow);
        }

        if let Ok(content) = serde_json::to_string_pretty(&history) {
            if let Err(e) = self.write_atomic(&path, &content) {
                debug!(error = %e, "history write failed");
            }
        }
    }

    pub fn history(&self) -> Vec<CommandRequest> {
        std::fs::read_to_string(self.history_path())
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default()
    }

    // -------------------------------------------------------------------------
    // Client side
    // -------------------------------------------------------------------------

    /// Drop a command for the orchestrator. Any stale response is cleared
    /// first so the caller never reads a previous command's result.
    pub fn send(&self, request: &CommandRequest) -> Result<()> {
        let _ = std::fs::remove_file(self.response_path());
        let content = serde_json::to_string_pretty(request)?;
        self.write_atomic(&self.pending_path(), &content)?;
        Ok(())
    }

    /// Poll for the orchestrator's response.
    pub fn wait_for_response(&self, timeout: Duration) -> Option<CommandResponse> {
        let deadline = Instant::now() + timeout;
        let path = self.response_path();
        while Instant::now() < deadline {
            if path.exists() {
                if let Ok(content) = std::fs::read_to_string(&path) {
                    if let Ok(response) = serde_json::from_str::<CommandResponse>(&content) {
                        let _ = std::fs::remove_file(&path);
                        return Some(response);
                    }
                }
            }
            std::thread::sleep(Duration::from_millis(300));
        }
        None
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_parse_accepts_aliases_and_slashes() {
        assert_eq!(Command::parse("yes"), Some(Command::Yes));
        assert_eq!(Command::parse("/yes"), Some(Command::Yes));
        assert_eq!(Command::parse("/approve"), Some(Command::Yes));
        assert_eq!(Command::parse("ESTOP"), Some(Command::Estop));
        assert_eq!(Command::parse("pf"), Some(Command::Portfolio));
        assert_eq!(Command::parse("unknown_thing"), None);
    }

    #[test]
    fn canonical_names_are_the_closed_set() {
        for (name, command) in [
            ("yes", Command::Yes),
            ("no", Command::No),
            ("hold", Command::Hold),
            ("start", Command::Start),
            ("stop", Command::Stop),
            ("estop", Command::Estop),
            ("update", Command::Update),
            ("status", Command::Status),
            ("portfolio", Command::Portfolio),
            ("defcon", Command::Defcon),
            ("trades", Command::Trades),
            ("broker", Command::Broker),
            ("help", Command::Help),
            ("mode", Command::Mode),
            ("interval", Command::Interval),
            ("buy", Command::Buy),
            ("sell", Command::Sell),
            ("briefing", Command::Briefing),
            ("research", Command::Research),
            ("hunt", Command::Hunt),
        ] {
            assert_eq!(command.as_str(), name);
            assert_eq!(Command::parse(name), Some(command));
        }
    }

    #[test]
    fn roundtrip_through_the_bus() {
        let dir = std::env::temp_dir().join(format!("sentinel-bus-{}", uuid::Uuid::new_v4()));
        let bus = CommandBus::new(&dir).unwrap();

        // Nothing pending initially.
        assert!(bus.poll().is_none());

        let request = CommandRequest::new(Command::Hold, "");
        bus.send(&request).unwrap();

        let received = bus.poll().unwrap();
        assert_eq!(received.parsed(), Some(Command::Hold));

        // The pending file is consumed: a second poll sees nothing.
        assert!(bus.poll().is_none());

        bus.respond(&CommandResponse::ok("Trading HOLD activated."));
        let response = bus.wait_for_response(Duration::from_secs(2)).unwrap();
        assert!(response.ok);
        assert!(response.message.contains("HOLD"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn history_keeps_last_200_and_replays_append() {
        let dir = std::env::temp_dir().join(format!("sentinel-hist-{}", uuid::Uuid::new_v4()));
        let bus = CommandBus::new(&dir).unwrap();

        // The same command sent twice yields two history entries.
        for _ in 0..2 {
            bus.send(&CommandRequest::new(Command::Hold, "")).unwrap();
            bus.poll().unwrap();
        }
        assert_eq!(bus.history().len(), 2);

        for i in 0..210 {
            bus.send(&CommandRequest::new(Command::Status, &i.to_string())).unwrap();
            bus.poll().unwrap();
        }
        let history = bus.history();
        assert_eq!(history.len(), HISTORY_LIMIT);
        // Oldest entries were evicted.
        assert_eq!(history.last().unwrap().args, "209");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn malformed_pending_file_is_dropped() {
        let dir = std::env::temp_dir().join(format!("sentinel-bad-{}", uuid::Uuid::new_v4()));
        let bus = CommandBus::new(&dir).unwrap();
        std::fs::write(dir.join(PENDING_FILE), "{not json").unwrap();
        assert!(bus.poll().is_none());
        // The bad file is gone, not retried forever.
        assert!(!dir.join(PENDING_FILE).exists());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
