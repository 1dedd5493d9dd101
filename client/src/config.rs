use anyhow::{bail, Context, Result};
use clap::Parser;
use url::Url;

use crate::constants::LOCAL_WS_URL;
use crate::identity::Role;

/// Join a technical interview from the terminal.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// access code shared by both participants
    #[arg(long, env = "TECHMEET_ROOM")]
    pub room: String,
    /// `candidate` or `interviewer`
    #[arg(long, env = "TECHMEET_ROLE")]
    pub role: String,
    /// name shown next to chat messages
    #[arg(long, env = "TECHMEET_NAME")]
    pub name: Option<String>,
    /// WebSocket endpoint of the signaling relay
    #[arg(long = "signal-url", env = "TECHMEET_SIGNAL_URL", default_value = LOCAL_WS_URL)]
    pub signal_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub room_code: String,
    pub role: Role,
    pub display_name: String,
    pub signal_url: Url,
    /// Absent means the interview runs without the AI monitor.
    pub api_key: Option<String>,
}

impl Config {
    /// Flags and `TECHMEET_*` from the process, key from `GEMINI_API_KEY`
    /// or `API_KEY`.
    pub fn load() -> Result<Self> {
        Self::resolve(Cli::parse(), |name| std::env::var(name).ok())
    }

    pub fn resolve(cli: Cli, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let room_code = cli.room.trim().to_string();
        if room_code.is_empty() {
            bail!("room code must not be empty");
        }
        if room_code.chars().any(char::is_whitespace) {
            bail!("room code '{room_code}' must not contain whitespace");
        }

        let role: Role = cli.role.trim().parse()?;
        let display_name = cli
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| role.label().to_string());

        let signal_url = Url::parse(cli.signal_url.trim())
            .with_context(|| format!("invalid signaling URL '{}'", cli.signal_url))?;
        if !matches!(signal_url.scheme(), "ws" | "wss") {
            bail!("signaling URL must use ws:// or wss://, got {}", signal_url.scheme());
        }

        let api_key = ["GEMINI_API_KEY", "API_KEY"]
            .iter()
            .filter_map(|name| env(name))
            .map(|key| key.trim().to_string())
            .find(|key| !key.is_empty());

        Ok(Self {
            room_code,
            role,
            display_name,
            signal_url,
            api_key,
        })
    }
}
