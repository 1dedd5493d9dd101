use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{Duration, Instant};
use url::Url;

use techmeet::audio::device::{MicrophoneCapture, SpeakerOutput};
use techmeet::audio::{AudioOutput, ClockOutput, PipelineCallbacks};
use techmeet::catalog::{Catalog, Language};
use techmeet::config::Config;
use techmeet::constants::{AUDIO_OUTPUT_SAMPLE_RATE, VERSION};
use techmeet::engine::LiveConfig;
use techmeet::gemini::{GeminiLive, GeminiText};
use techmeet::interview::{AiSetup, Interview};
use techmeet::media::MediaStream;
use techmeet::proctor::{Visibility, VisibilitySource};
use techmeet::report::{EvaluationReport, ReportClient};
use techmeet::session::SessionEvent;
use techmeet::signal::{SignalClient, SignalStatsSnapshot};
use techmeet::sync::{SyncNotice, Synchronizer};
use techmeet::utils::{format_time, unescape_newlines};
use techmeet::{PeerIdentity, Role};

const CONNECT_ATTEMPTS: u32 = 3;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "techmeet=debug,info".into()),
        )
        .init();

    let config = Config::load()?;
    tracing::info!(
        "techmeet {} joining room {} as {}",
        VERSION,
        config.room_code,
        config.role
    );

    let signal = connect_signaling(config.signal_url.as_str()).await?;

    let (sync, mut notices) = Synchronizer::new(Arc::new(Catalog::builtin()), &config.display_name);
    let sync = Arc::new(Mutex::new(sync));

    let local_stream = MediaStream::new();
    let capture = match MicrophoneCapture::start(local_stream.clone()) {
        Ok(capture) => Some(capture),
        Err(e) => {
            tracing::warn!("No microphone, joining without audio: {e:#}");
            None
        }
    };

    let report = match &config.api_key {
        Some(key) => Some(ReportClient::new(GeminiText::new(key.as_str())?)),
        None => {
            tracing::info!("No API key set; AI monitor, /run and the report are disabled");
            None
        }
    };

    let visibility = VisibilitySource::new();
    let (mut interview, mut events) = Interview::start(
        PeerIdentity::new(config.room_code.clone(), config.role),
        signal.clone(),
        Arc::clone(&sync),
        local_stream,
        &visibility,
        ai_setup(&config),
    )
    .await;
    println!("Status: {:?}. Type /help for commands.", interview.status());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let command = Command::parse(&line);
                    if command == Command::End {
                        break;
                    }
                    run_command(command, &interview, &signal, &visibility, report.as_ref()).await;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("stdin closed: {e}");
                    break;
                }
            },
            Some(notice) = notices.recv() => print_notice(notice),
            Some(event) = events.recv() => print_event(event),
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let summary = interview.end();
    if let Some(capture) = capture {
        capture.stop();
    }
    signal.shutdown();
    println!("Interview over after {}.", format_time(interview.elapsed().as_secs_f64()));

    if let Some(report) = report {
        println!("Generating report for \"{}\"...", summary.question_title);
        let result = report
            .generate_report(&summary.code, summary.language, &summary.question_title)
            .await;
        print_report(&result);
    }
    Ok(())
}

/// Connect to the relay, waking a sleeping deployment first.
async fn connect_signaling(url: &str) -> Result<SignalClient> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        warm_up_backend(url).await;
        match SignalClient::connect_ws(url).await {
            Ok((client, disconnected)) => {
                tracing::info!("Connected to signaling server at {url}");
                tokio::spawn(async move {
                    if disconnected.await.is_ok() {
                        tracing::warn!("Signaling server connection lost");
                    }
                });
                return Ok(client);
            }
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                let delay = Duration::from_secs(2 * attempt as u64);
                tracing::warn!("Failed to connect to {url} ({e:#}); retrying in {delay:?}");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("signaling server at {url} unreachable"));
            }
        }
    }
}

async fn warm_up_backend(ws_url: &str) {
    let Some(health_url) = health_url_from_ws(ws_url) else {
        return;
    };
    let client = reqwest::Client::new();
    match client
        .get(&health_url)
        .timeout(Duration::from_secs(10))
        .send()
        .await
    {
        Ok(response) => tracing::debug!("Warmup {} returned {}", health_url, response.status()),
        Err(e) => tracing::debug!("Warmup {} failed: {}", health_url, e),
    }
}

fn health_url_from_ws(ws_url: &str) -> Option<String> {
    let parsed = Url::parse(ws_url).ok()?;
    let scheme = match parsed.scheme() {
        "ws" => "http",
        "wss" => "https",
        _ => return None,
    };

    let mut http = parsed;
    http.set_scheme(scheme).ok()?;
    http.set_path("/healthz");
    http.set_query(None);
    http.set_fragment(None);
    Some(http.to_string())
}

fn ai_setup(config: &Config) -> Option<AiSetup> {
    let key = config.api_key.as_ref()?;
    if config.role != Role::Candidate {
        return None;
    }
    let output: Arc<dyn AudioOutput> = match SpeakerOutput::open() {
        Ok(speaker) => Arc::new(speaker),
        Err(e) => {
            tracing::warn!("No audio output device, AI voice muted: {e:#}");
            Arc::new(ClockOutput::new(AUDIO_OUTPUT_SAMPLE_RATE))
        }
    };
    Some(AiSetup {
        engine: Arc::new(GeminiLive::new(key.as_str())),
        config: LiveConfig::default(),
        output,
        callbacks: PipelineCallbacks {
            on_close: Arc::new(|| println!("[ai] session closed")),
            on_error: Arc::new(|e: String| println!("[ai] error: {e}")),
            ..PipelineCallbacks::default()
        },
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Chat(String),
    Code(String),
    Lang(String),
    Question(String),
    Run,
    State,
    ChatFocus(bool),
    Away,
    Back,
    Redial,
    End,
    Help,
    Unknown(String),
    Empty,
}

impl Command {
    fn parse(line: &str) -> Self {
        let line = line.trim_end_matches('\r');
        let Some(rest) = line.strip_prefix('/') else {
            return if line.trim().is_empty() {
                Command::Empty
            } else {
                Command::Chat(line.to_string())
            };
        };
        let (name, arg) = match rest.split_once(' ') {
            Some((name, arg)) => (name, arg),
            None => (rest, ""),
        };
        match name {
            "code" => Command::Code(unescape_newlines(arg)),
            "lang" => Command::Lang(arg.trim().to_string()),
            "question" => Command::Question(arg.trim().to_string()),
            "run" => Command::Run,
            "state" => Command::State,
            "chat" => match arg.trim() {
                "on" => Command::ChatFocus(true),
                "off" => Command::ChatFocus(false),
                _ => Command::Unknown(line.to_string()),
            },
            "away" => Command::Away,
            "back" => Command::Back,
            "redial" => Command::Redial,
            "end" => Command::End,
            "help" => Command::Help,
            _ => Command::Unknown(line.to_string()),
        }
    }
}

async fn run_command(
    command: Command,
    interview: &Interview,
    signal: &SignalClient,
    visibility: &VisibilitySource,
    report: Option<&ReportClient>,
) {
    let sync = interview.sync();
    match command {
        Command::Chat(text) => {
            sync.lock().send_chat(&text);
        }
        Command::Code(code) => sync.lock().edit_code(code),
        Command::Lang(name) => match name.parse::<Language>() {
            Ok(language) => {
                sync.lock().change_language(language);
                print_code(sync);
            }
            Err(e) => println!("{e}"),
        },
        Command::Question(id) => {
            if sync.lock().change_question(&id) {
                print_code(sync);
            } else {
                let ids: Vec<String> = sync
                    .lock()
                    .catalog()
                    .questions()
                    .iter()
                    .map(|q| q.id.clone())
                    .collect();
                println!("Unknown question '{id}'. Available: {}", ids.join(", "));
            }
        }
        Command::Run => {
            let Some(report) = report else {
                println!("Running code needs an API key.");
                return;
            };
            let state = sync.lock().snapshot();
            println!("Running...");
            println!("{}", report.run_code(&state.code, state.language).await);
        }
        Command::State => {
            let mut guard = sync.lock();
            let state = guard.snapshot();
            println!(
                "[{}] {:?}, peer channel {}, AI {:?}",
                format_time(interview.elapsed().as_secs_f64()),
                interview.status(),
                if guard.is_channel_open() { "open" } else { "closed" },
                interview.ai_status(),
            );
            println!("Relay: {}", describe_link(&signal.stats_snapshot()));
            println!(
                "Question: {}  Language: {}",
                state.active_question_id.as_deref().unwrap_or("-"),
                state.language.display_name()
            );
            println!("{}", state.code);
            for alert in guard.active_alerts(Instant::now()) {
                println!("(!) {}", alert.text);
            }
            if guard.has_unread_chat() {
                println!("(unread chat)");
            }
        }
        Command::ChatFocus(focused) => {
            let mut guard = sync.lock();
            guard.set_chat_focused(focused);
            if focused {
                for chat in guard.chat_log() {
                    println!("<{}> {}", chat.sender, chat.text);
                }
            }
        }
        Command::Away => visibility.set(Visibility::Hidden),
        Command::Back => visibility.set(Visibility::Visible),
        Command::Redial => {
            if !interview.redial().await {
                println!("Only the interviewer can redial.");
            }
        }
        Command::Help => print_help(),
        Command::Unknown(line) => println!("Unknown command: {line}. Type /help."),
        Command::End | Command::Empty => {}
    }
}

fn print_code(sync: &Arc<Mutex<Synchronizer>>) {
    println!("{}", sync.lock().snapshot().code);
}

fn print_notice(notice: SyncNotice) {
    match notice {
        SyncNotice::State(state) => println!(
            "[sync] {} / {}:\n{}",
            state.active_question_id.as_deref().unwrap_or("-"),
            state.language,
            state.code
        ),
        SyncNotice::Chat(chat) => println!("<{}> {}", chat.sender, chat.text),
        SyncNotice::Alert(alert) => println!("(!) {}", alert.text),
    }
}

fn print_event(event: SessionEvent) {
    match event {
        SessionEvent::ChannelOpen => println!("[peer] connected"),
        SessionEvent::ChannelClosed => println!("[peer] channel closed"),
        SessionEvent::RemoteStream(_) => println!("[peer] receiving media"),
        SessionEvent::CallClosed => println!("[peer] call ended"),
        SessionEvent::PeerUnavailable(who) => {
            println!("[peer] {who} has not joined yet; /redial once they are here")
        }
        SessionEvent::Error(e) => println!("[peer] error: {e}"),
    }
}

fn print_report(report: &EvaluationReport) {
    println!("Score: {}/100", report.score);
    println!("Time: {}  Space: {}", report.time_complexity, report.space_complexity);
    println!("{}", report.feedback);
    for strength in &report.strengths {
        println!("  + {strength}");
    }
    for improvement in &report.improvements {
        println!("  - {improvement}");
    }
}

fn print_help() {
    println!(
        "text            send chat
/code <text>    replace the code (\\n for newlines)
/lang <lang>    javascript, python or java
/question <id>  switch problem
/run            simulate running the code
/state          show the shared state
/chat on|off    focus or leave the chat view
/away, /back    leave or return to the interview window
/redial         dial the candidate again (interviewer)
/end            finish the interview"
    );
}

fn describe_link(stats: &SignalStatsSnapshot) -> String {
    let mut line = format!(
        "{} ({} msgs / {} B out, {} msgs / {} B in)",
        stats.endpoint_label.as_deref().unwrap_or("not connected"),
        stats.messages_out,
        stats.bytes_out,
        stats.messages_in,
        stats.bytes_in,
    );
    if let Some(up) = stats.connected_duration {
        line.push_str(&format!(", up {}", format_time(up as f64)));
    }
    if let Some(age) = stats.last_message_age {
        line.push_str(&format!(", last message {age:.1}s ago"));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_link() {
        let stats = SignalStatsSnapshot {
            bytes_out: 120,
            bytes_in: 64,
            messages_out: 3,
            messages_in: 2,
            last_message_age: Some(2.0),
            connected_duration: Some(75.0),
            endpoint_label: Some("ws://localhost:3005/ws".into()),
        };
        assert_eq!(
            describe_link(&stats),
            "ws://localhost:3005/ws (3 msgs / 120 B out, 2 msgs / 64 B in), up 01:15, last message 2.0s ago"
        );

        let idle = SignalStatsSnapshot {
            bytes_out: 0,
            bytes_in: 0,
            messages_out: 0,
            messages_in: 0,
            last_message_age: None,
            connected_duration: None,
            endpoint_label: None,
        };
        assert_eq!(describe_link(&idle), "not connected (0 msgs / 0 B out, 0 msgs / 0 B in)");
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("hello there"), Command::Chat("hello there".into()));
        assert_eq!(Command::parse("  "), Command::Empty);
        assert_eq!(
            Command::parse(r"/code def f():\n    pass"),
            Command::Code("def f():\n    pass".into())
        );
        assert_eq!(Command::parse("/lang python"), Command::Lang("python".into()));
        assert_eq!(Command::parse("/question two-sum"), Command::Question("two-sum".into()));
        assert_eq!(Command::parse("/chat on"), Command::ChatFocus(true));
        assert_eq!(Command::parse("/chat maybe"), Command::Unknown("/chat maybe".into()));
        assert_eq!(Command::parse("/end"), Command::End);
        assert_eq!(Command::parse("/dance"), Command::Unknown("/dance".into()));
    }

    #[test]
    fn test_health_url_from_ws() {
        assert_eq!(
            health_url_from_ws("ws://localhost:3005/ws").as_deref(),
            Some("http://localhost:3005/healthz")
        );
        assert_eq!(
            health_url_from_ws("wss://relay.example.com/ws?x=1").as_deref(),
            Some("https://relay.example.com/healthz")
        );
        assert_eq!(health_url_from_ws("http://localhost"), None);
    }
}
