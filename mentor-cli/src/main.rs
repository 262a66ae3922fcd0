//! mentor-cli — terminal frontend for the Mentor tutoring service
//!
//! Talks to the HTTP interface; streamed replies print as they arrive, the
//! way a browser client would render them.
//!
//! # Subcommands
//! - `status`                                 — show server health
//! - `token [--user <uuid>] [--ttl-secs N]`   — mint a dev bearer token
//! - `new-session [--mode <mode>]`            — create a tutoring session
//! - `sessions`                               — list your sessions
//! - `history <session>`                      — print a transcript
//! - `chat <session> <text>`                  — ask and stream the reply
//! - `feedback <message> --rating <r>`        — rate an assistant message

use std::io::{BufRead, BufReader, Write};

use clap::{Parser, Subcommand};
use serde::Serialize;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8900";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(
    name = "mentor-cli",
    version,
    about = "Mentor tutoring service — terminal client"
)]
struct Cli {
    /// Tutoring server URL (overrides MENTOR_HTTP_URL env var)
    #[arg(long, env = "MENTOR_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    /// Bearer token (overrides MENTOR_TOKEN env var)
    #[arg(long, env = "MENTOR_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show tutoring server status
    Status,

    /// Mint a signed bearer token for local development
    Token {
        /// User id to embed; a fresh one is generated when omitted
        #[arg(long)]
        user: Option<String>,

        /// Token lifetime in seconds
        #[arg(long, default_value_t = 3600)]
        ttl_secs: i64,
    },

    /// Create a tutoring session
    NewSession {
        /// Dialogue mode for the session
        #[arg(
            long,
            default_value = "guided_questioning",
            value_parser = ["guided_questioning", "direct_answer"]
        )]
        mode: String,
    },

    /// List your sessions
    Sessions,

    /// Print a session transcript
    History {
        /// Session id
        session: String,
    },

    /// Ask a question and stream the tutor's reply
    Chat {
        /// Session id
        session: String,

        /// The question to ask
        text: String,
    },

    /// Rate an assistant message
    Feedback {
        /// Message id
        message: String,

        /// Rating to record
        #[arg(long, value_parser = ["positive", "negative"])]
        rating: String,

        /// Optional free-text comment
        #[arg(long)]
        text: Option<String>,
    },
}

// ============================================================================
// SSE line parsing
// ============================================================================

/// One interpreted line of the chat stream.
#[derive(Debug, PartialEq)]
pub enum TurnLine {
    /// A fragment of the reply.
    Delta(String),
    /// The turn finished; payload carries message ids and `persisted`.
    Done(serde_json::Value),
    /// The turn failed mid-stream; payload carries `kind` and `error`.
    Error(serde_json::Value),
    /// Comments, blank separators, or anything else.
    Ignore,
}

/// Stateful line reader for the server's SSE framing. Frames are an optional
/// `event:` line followed by a `data:` line; a blank line closes the frame.
#[derive(Debug, Default)]
pub struct SseLineReader {
    event: Option<String>,
}

impl SseLineReader {
    pub fn push(&mut self, line: &str) -> TurnLine {
        if line.is_empty() {
            self.event = None;
            return TurnLine::Ignore;
        }
        if let Some(name) = line.strip_prefix("event:") {
            self.event = Some(name.trim().to_string());
            return TurnLine::Ignore;
        }
        let Some(data) = line.strip_prefix("data:") else {
            return TurnLine::Ignore;
        };
        let Ok(value) = serde_json::from_str::<serde_json::Value>(data.trim_start()) else {
            return TurnLine::Ignore;
        };
        match self.event.as_deref() {
            Some("done") => TurnLine::Done(value),
            Some("error") => TurnLine::Error(value),
            _ => match value.get("delta").and_then(|d| d.as_str()) {
                Some(delta) => TurnLine::Delta(delta.to_string()),
                None => TurnLine::Ignore,
            },
        }
    }
}

/// Render one transcript entry for terminal output.
pub fn render_message(message: &serde_json::Value) -> String {
    let role = message["role"].as_str().unwrap_or("?");
    let content = message["content"].as_str().unwrap_or("");
    let feedback = match message["feedback_rating"].as_i64() {
        Some(1) => "  [rated +]",
        Some(-1) => "  [rated -]",
        _ => "",
    };
    format!("{role:>9} | {content}{feedback}")
}

// ============================================================================
// HTTP client calls
// ============================================================================

fn blocking_client(timeout_secs: u64) -> anyhow::Result<reqwest::blocking::Client> {
    Ok(reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()?)
}

fn fail_on_http_error(resp: reqwest::blocking::Response) -> reqwest::blocking::Response {
    if resp.status().is_success() {
        return resp;
    }
    let status = resp.status();
    let body = resp.text().unwrap_or_default();
    eprintln!("mentor-cli: server returned {}: {}", status, body);
    std::process::exit(1);
}

fn send_or_exit(
    request: reqwest::blocking::RequestBuilder,
    url: &str,
) -> reqwest::blocking::Response {
    match request.send() {
        Ok(resp) => fail_on_http_error(resp),
        Err(e) => {
            eprintln!("mentor-cli: connection failed to {}: {}", url, e);
            std::process::exit(1);
        }
    }
}

fn require_token(token: Option<String>) -> String {
    match token {
        Some(t) if !t.is_empty() => t,
        _ => {
            eprintln!("mentor-cli: a bearer token is required (--token or MENTOR_TOKEN)");
            std::process::exit(1);
        }
    }
}

/// Show the server status by calling GET /health.
fn do_status(server: &str) -> anyhow::Result<()> {
    let client = blocking_client(10)?;
    let url = format!("{}/health", server);

    match client.get(&url).send() {
        Ok(r) if r.status().is_success() => {
            let body: serde_json::Value = r.json().unwrap_or_default();
            println!("Mentor server: {}", body["status"].as_str().unwrap_or("unknown"));
            println!("Version:       {}", body["version"].as_str().unwrap_or("?"));
            println!("Database:      {}", body["database"].as_str().unwrap_or("?"));
        }
        Ok(r) => {
            eprintln!("mentor-cli: server unhealthy (HTTP {})", r.status());
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("mentor-cli: cannot reach {}: {}", url, e);
            std::process::exit(1);
        }
    }

    Ok(())
}

#[derive(Debug, Serialize)]
struct Claims {
    sub: String,
    exp: usize,
    iat: usize,
}

/// Mint a development token signed with MENTOR_JWT_SECRET.
fn do_token(user: Option<String>, ttl_secs: i64) -> anyhow::Result<()> {
    let secret = std::env::var("MENTOR_JWT_SECRET").unwrap_or_default();
    if secret.is_empty() {
        eprintln!("mentor-cli: MENTOR_JWT_SECRET must be set to mint tokens");
        std::process::exit(1);
    }

    let user_id = match user {
        Some(raw) => match raw.parse::<uuid::Uuid>() {
            Ok(id) => id,
            Err(_) => {
                eprintln!("mentor-cli: --user must be a UUID, got: {}", raw);
                std::process::exit(1);
            }
        },
        None => uuid::Uuid::new_v4(),
    };

    let now = chrono::Utc::now().timestamp();
    let claims = Claims {
        sub: user_id.to_string(),
        exp: (now + ttl_secs) as usize,
        iat: now as usize,
    };
    let token = jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
    )?;

    eprintln!("user: {}", user_id);
    println!("{}", token);
    Ok(())
}

/// Create a session via POST /sessions.
fn do_new_session(server: &str, token: &str, mode: &str) -> anyhow::Result<()> {
    let client = blocking_client(10)?;
    let url = format!("{}/sessions", server);
    let resp = send_or_exit(
        client
            .post(&url)
            .bearer_auth(token)
            .json(&serde_json::json!({"mode": mode})),
        &url,
    );
    let session: serde_json::Value = resp.json()?;
    println!("{}", session["id"].as_str().unwrap_or("?"));
    eprintln!("mode: {}", session["mode"].as_str().unwrap_or("?"));
    Ok(())
}

/// List the caller's sessions via GET /sessions.
fn do_sessions(server: &str, token: &str) -> anyhow::Result<()> {
    let client = blocking_client(10)?;
    let url = format!("{}/sessions", server);
    let resp = send_or_exit(client.get(&url).bearer_auth(token), &url);
    let body: serde_json::Value = resp.json()?;
    let sessions = body["sessions"].as_array().cloned().unwrap_or_default();

    if sessions.is_empty() {
        eprintln!("No sessions yet");
        return Ok(());
    }
    for session in &sessions {
        println!(
            "{}  {:20}  {}",
            session["id"].as_str().unwrap_or("?"),
            session["mode"].as_str().unwrap_or("?"),
            session["created_at"].as_str().unwrap_or("?"),
        );
    }
    Ok(())
}

/// Print a transcript via GET /sessions/{id}/messages.
fn do_history(server: &str, token: &str, session: &str) -> anyhow::Result<()> {
    let client = blocking_client(10)?;
    let url = format!("{}/sessions/{}/messages", server, session);
    let resp = send_or_exit(client.get(&url).bearer_auth(token), &url);
    let body: serde_json::Value = resp.json()?;
    let messages = body["messages"].as_array().cloned().unwrap_or_default();

    if messages.is_empty() {
        eprintln!("Transcript is empty");
        return Ok(());
    }
    for message in &messages {
        println!("{}", render_message(message));
    }
    Ok(())
}

/// Run one chat turn, printing fragments as they arrive.
fn do_chat(server: &str, token: &str, session: &str, text: &str) -> anyhow::Result<()> {
    // Generation can legitimately take a while; allow a long read.
    let client = blocking_client(300)?;
    let url = format!("{}/sessions/{}/chat", server, session);
    let resp = send_or_exit(
        client
            .post(&url)
            .bearer_auth(token)
            .json(&serde_json::json!({"text": text})),
        &url,
    );

    let mut reader = BufReader::new(resp);
    let mut parser = SseLineReader::default();
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            // Stream closed without a done event.
            println!();
            eprintln!("mentor-cli: stream ended before completion");
            std::process::exit(1);
        }
        match parser.push(line.trim_end_matches(['\r', '\n'])) {
            TurnLine::Delta(delta) => {
                print!("{}", delta);
                std::io::stdout().flush()?;
            }
            TurnLine::Done(value) => {
                println!();
                if value["persisted"] == false {
                    eprintln!("mentor-cli: warning: the reply could not be saved");
                }
                return Ok(());
            }
            TurnLine::Error(value) => {
                println!();
                eprintln!(
                    "mentor-cli: turn failed: {}",
                    value["error"].as_str().unwrap_or("unknown error")
                );
                std::process::exit(1);
            }
            TurnLine::Ignore => {}
        }
    }
}

/// Record feedback via POST /messages/{id}/feedback.
fn do_feedback(
    server: &str,
    token: &str,
    message: &str,
    rating: &str,
    text: Option<&str>,
) -> anyhow::Result<()> {
    let client = blocking_client(10)?;
    let url = format!("{}/messages/{}/feedback", server, message);
    send_or_exit(
        client
            .post(&url)
            .bearer_auth(token)
            .json(&serde_json::json!({"rating": rating, "text": text})),
        &url,
    );
    eprintln!("Feedback recorded");
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();
    let server = cli.server.trim_end_matches('/').to_string();
    let token = cli.token;

    let result = match cli.command {
        Commands::Status => do_status(&server),
        Commands::Token { user, ttl_secs } => do_token(user, ttl_secs),
        Commands::NewSession { mode } => {
            do_new_session(&server, &require_token(token), &mode)
        }
        Commands::Sessions => do_sessions(&server, &require_token(token)),
        Commands::History { session } => do_history(&server, &require_token(token), &session),
        Commands::Chat { session, text } => {
            do_chat(&server, &require_token(token), &session, &text)
        }
        Commands::Feedback {
            message,
            rating,
            text,
        } => do_feedback(
            &server,
            &require_token(token),
            &message,
            &rating,
            text.as_deref(),
        ),
    };

    if let Err(e) = result {
        eprintln!("mentor-cli: {}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ========================================================================
    // TEST 1: plain data lines are deltas
    // ========================================================================
    #[test]
    fn test_sse_delta_line() {
        let mut parser = SseLineReader::default();
        let line = parser.push(r#"data: {"delta":"Hello "}"#);
        assert_eq!(line, TurnLine::Delta("Hello ".to_string()));
    }

    // ========================================================================
    // TEST 2: an event line tags the following data line
    // ========================================================================
    #[test]
    fn test_sse_done_event() {
        let mut parser = SseLineReader::default();
        assert_eq!(parser.push("event: done"), TurnLine::Ignore);
        let line = parser.push(r#"data: {"persisted":true,"assistant_message_id":"x"}"#);
        match line {
            TurnLine::Done(value) => assert_eq!(value["persisted"], true),
            other => panic!("expected Done, got {other:?}"),
        }
    }

    // ========================================================================
    // TEST 3: blank lines close a frame, resetting the event name
    // ========================================================================
    #[test]
    fn test_sse_blank_line_resets_event() {
        let mut parser = SseLineReader::default();
        parser.push("event: done");
        parser.push("");
        let line = parser.push(r#"data: {"delta":"more"}"#);
        assert_eq!(line, TurnLine::Delta("more".to_string()));
    }

    // ========================================================================
    // TEST 4: error frames carry the payload through
    // ========================================================================
    #[test]
    fn test_sse_error_event() {
        let mut parser = SseLineReader::default();
        parser.push("event: error");
        let line = parser.push(r#"data: {"kind":"provider","error":"try again"}"#);
        match line {
            TurnLine::Error(value) => {
                assert_eq!(value["kind"], "provider");
                assert_eq!(value["error"], "try again");
            }
            other => panic!("expected Error, got {other:?}"),
        }
    }

    // ========================================================================
    // TEST 5: comments, garbage, and non-JSON data are ignored
    // ========================================================================
    #[test]
    fn test_sse_ignores_noise() {
        let mut parser = SseLineReader::default();
        assert_eq!(parser.push(": keep-alive"), TurnLine::Ignore);
        assert_eq!(parser.push("retry: 3000"), TurnLine::Ignore);
        assert_eq!(parser.push("data: not-json"), TurnLine::Ignore);
        assert_eq!(parser.push(r#"data: {"unknown":"shape"}"#), TurnLine::Ignore);
    }

    // ========================================================================
    // TEST 6: delta content survives exactly, including whitespace
    // ========================================================================
    #[test]
    fn test_sse_delta_preserves_whitespace() {
        let mut parser = SseLineReader::default();
        let line = parser.push(r#"data: {"delta":"  two  spaces  "}"#);
        assert_eq!(line, TurnLine::Delta("  two  spaces  ".to_string()));
    }

    // ========================================================================
    // TEST 7: transcript rendering shows role, content, and rating marks
    // ========================================================================
    #[test]
    fn test_render_message() {
        let plain = render_message(&json!({
            "role": "user",
            "content": "What is a stack?",
        }));
        assert_eq!(plain, "     user | What is a stack?");

        let rated = render_message(&json!({
            "role": "assistant",
            "content": "Think of plates.",
            "feedback_rating": 1,
        }));
        assert_eq!(rated, "assistant | Think of plates.  [rated +]");

        let negative = render_message(&json!({
            "role": "assistant",
            "content": "Too terse.",
            "feedback_rating": -1,
        }));
        assert!(negative.ends_with("[rated -]"));
    }
}
