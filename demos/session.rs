//! Interactive REPL driving a real context engine against a local database.
//!
//! Usage:
//!   cargo run --example session
//!   cargo run --example session -- --max-tokens 500
//!   cargo run --example session -- --db /tmp/demo.db --session work --vector
//!
//! Each line is appended as a user message (tokens estimated). Lines like
//! `@./src/lib.rs 1200` attach a file reference with that token budget.
//! Type "/status", "/stats", "/compact <1|2|3>", or "exit".

use std::io::{self, BufRead, Write};

use clap::Parser;
use vesper_context::{
    estimate_tokens, CompactionLevel, ContextEngine, EngineConfig, FileMode, Role, SessionConfig,
    SessionStore,
};

#[derive(Parser)]
#[command(name = "session", about = "Drive a vesper-context engine from the terminal")]
struct Cli {
    /// Database path (defaults to a throwaway temp file)
    #[arg(long)]
    db: Option<std::path::PathBuf>,

    /// Session id
    #[arg(long, default_value = "demo")]
    session: String,

    /// Token ceiling for the session
    #[arg(long, default_value_t = 2_000)]
    max_tokens: i64,

    /// Enable embedding-based relevance scoring (needs a local endpoint)
    #[arg(long)]
    vector: bool,
}

fn parse_file_ref(line: &str) -> Option<(&str, i64)> {
    let rest = line.strip_prefix('@')?;
    let (path, tokens) = rest.split_once(' ')?;
    Some((path, tokens.trim().parse().ok()?))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let _tmp;
    let db_path = match cli.db {
        Some(path) => path,
        None => {
            let dir = tempfile::tempdir().expect("temp dir");
            let path = dir.path().join("sessions.db");
            _tmp = dir;
            path
        }
    };

    let store = SessionStore::open(&db_path).expect("open store");
    if store.get_session(&cli.session).expect("get session").is_none() {
        store
            .create_session(
                &SessionConfig::new(&cli.session).with_max_context_tokens(cli.max_tokens),
            )
            .expect("create session");
    }

    let config = EngineConfig {
        max_tokens: cli.max_tokens,
        use_vector_scoring: cli.vector,
        ..EngineConfig::default()
    };
    let mut engine = ContextEngine::new(store, &cli.session, config).expect("engine");

    eprintln!("vesper-context session demo");
    eprintln!("db: {}", db_path.display());
    eprintln!("session: {} ({} token ceiling)", cli.session, cli.max_tokens);
    eprintln!("---");

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        eprint!("\x1b[1;36myou>\x1b[0m ");
        io::stderr().flush().ok();

        let line = match lines.next() {
            Some(Ok(line)) => line,
            _ => break,
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if matches!(trimmed, "exit" | "quit" | "/q") {
            break;
        }

        if trimmed == "/status" {
            let status = engine.status().expect("status");
            eprintln!(
                "  {}/{} tokens ({:.1}%), {} messages, level {:?}, can_compact: {}",
                status.current_tokens,
                status.max_tokens,
                status.usage_percentage,
                status.message_count,
                status.level,
                status.can_compact,
            );
            continue;
        }
        if trimmed == "/stats" {
            let stats = engine.stats().expect("stats");
            eprintln!(
                "  {} compactions ({} soft / {} hard / {} emergency), {} tokens freed",
                stats.total_compactions,
                stats.soft_count,
                stats.hard_count,
                stats.emergency_count,
                stats.total_tokens_freed,
            );
            for event in &stats.recent {
                eprintln!(
                    "    [{}] level {} {:?}: {} -> {} tokens",
                    event.timestamp,
                    event.level,
                    event.strategy,
                    event.tokens_before,
                    event.tokens_after,
                );
            }
            continue;
        }
        if let Some(level) = trimmed.strip_prefix("/compact ") {
            let level = match level.trim() {
                "1" => CompactionLevel::Soft,
                "2" => CompactionLevel::Hard,
                "3" => CompactionLevel::Emergency,
                other => {
                    eprintln!("  unknown level '{other}', use 1, 2, or 3");
                    continue;
                }
            };
            let freed = engine.force_compact(level).await.expect("compact");
            eprintln!("  freed {freed} tokens");
            continue;
        }

        let before = engine.stats().expect("stats").total_compactions;

        let mut refs = Vec::new();
        let mut tokens = estimate_tokens(trimmed);
        if let Some((path, ref_tokens)) = parse_file_ref(trimmed) {
            refs.push((path, FileMode::Full, ref_tokens));
            tokens += ref_tokens;
        }
        engine
            .append(Role::User, trimmed, tokens, &refs)
            .await
            .expect("append");

        // Fake the model's turn so the conversation has both sides.
        let reply = format!("ack: {}", trimmed.chars().take(40).collect::<String>());
        engine
            .append(Role::Assistant, &reply, estimate_tokens(&reply), &[])
            .await
            .expect("append");
        eprint!("\x1b[1;32magent>\x1b[0m ");
        println!("{reply}");

        let status = engine.status().expect("status");
        let after = engine.stats().expect("stats").total_compactions;
        if after > before {
            eprintln!("\x1b[35m  [compacted -> {} tokens]\x1b[0m", status.current_tokens);
        }
        eprintln!(
            "\x1b[2m  [{}/{} tokens, {:.1}%]\x1b[0m",
            status.current_tokens, status.max_tokens, status.usage_percentage
        );
    }

    eprintln!("bye.");
}
