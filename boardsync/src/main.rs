//! `boardsync`: interactive demo of optimistic board synchronization.
//!
//! Runs the engine against an in-memory store seeded from a JSON file and
//! reads commands from stdin. Configuration via CLI flags, environment
//! variables, or config file (`~/.config/boardsync/config.toml`).
//!
//! ```bash
//! cargo run --bin boardsync -- --user-id alice --seed tasks.json
//!
//! # Or via environment variables
//! BOARDSYNC_USER=alice cargo run --bin boardsync -- --seed tasks.json
//! ```

use std::io;
use std::path::Path;

use clap::Parser;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use boardsync::board::{BoardError, BoardSync, BoardView, RequestOutcome};
use boardsync::config::{BoardConfig, CliArgs};
use boardsync::status;
use boardsync::store::StoreError;
use boardsync::store::memory::InMemoryStore;
use boardsync_proto::task::fields;
use boardsync_proto::{CanonicalStatus, FieldMap, RawTask, TaskId};

const HELP: &str = "\
commands:
  show                      print the board
  move <id> <column>        move a task (todo, in_progress, done, ...)
  title <id> <text>         rename a task
  delete <id>               delete a task
  fail-next                 make the next store write fail
  help                      show this help
  quit                      exit";

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = CliArgs::parse();

    // Load and resolve configuration (CLI args > env > config file > defaults).
    let config = match BoardConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            BoardConfig::default()
        }
    };

    // Logs go to a file; stdout is reserved for the board.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    tracing::info!("boardsync starting");

    let store = InMemoryStore::new();
    if let Some(path) = cli.seed.as_deref() {
        let seeded = seed_store(&store, path)?;
        tracing::info!(seeded, path = %path.display(), "store seeded");
    }

    let owner = config.owner();
    if owner.is_none() {
        eprintln!("No --user-id given; the board stays empty.");
    }

    let (sync, mut errors) = BoardSync::new(store.clone(), config.to_sync_config());
    sync.start(owner);

    println!("{HELP}");
    let result = run_repl(&sync, &store, &mut errors).await;

    sync.shutdown();
    tracing::info!("boardsync exiting");
    result
}

/// Initialize file-based logging.
///
/// Logs are written to a file (never stdout, which shows the board).
/// Uses `RUST_LOG` if set, otherwise falls back to `level`.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("boardsync.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Loads a JSON array of task documents into the store.
fn seed_store(store: &InMemoryStore, path: &Path) -> io::Result<usize> {
    let contents = std::fs::read_to_string(path)?;
    let docs: Vec<Value> = serde_json::from_str(&contents)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let mut seeded = 0;
    for doc in docs {
        match RawTask::from_value(doc) {
            Ok(raw) => {
                if store.insert(raw).is_some() {
                    seeded += 1;
                } else {
                    tracing::warn!("seed document without id skipped");
                }
            }
            Err(e) => tracing::warn!(error = %e, "seed entry skipped"),
        }
    }
    Ok(seeded)
}

/// What the loop should do after a command.
enum Flow {
    Continue,
    Quit,
}

/// Reads commands until `quit` or end of input, printing the board after
/// every reconciliation pass and every asynchronous error.
async fn run_repl(
    sync: &BoardSync<InMemoryStore>,
    store: &InMemoryStore,
    errors: &mut mpsc::Receiver<BoardError>,
) -> io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut board_rx = sync.watch_board();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if matches!(handle_command(sync, store, line.trim()), Flow::Quit) {
                    break;
                }
            }
            Some(err) = errors.recv() => {
                let hint = if err.retryable { " (retry to try again)" } else { "" };
                println!("! {err}{hint}");
            }
            changed = board_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = board_rx.borrow_and_update().clone();
                print_board(&view);
            }
        }
    }
    Ok(())
}

fn handle_command(sync: &BoardSync<InMemoryStore>, store: &InMemoryStore, line: &str) -> Flow {
    let mut parts = line.splitn(3, char::is_whitespace);
    let command = parts.next().unwrap_or_default();
    let id = parts.next().map(TaskId::new);
    let rest = parts.next().map(str::trim);

    match (command, id, rest) {
        ("", _, _) => {}
        ("quit" | "exit", _, _) => return Flow::Quit,
        ("help", _, _) => println!("{HELP}"),
        ("show", _, _) => print_board(&sync.board()),
        ("fail-next", _, _) => {
            store.fail_next_write(StoreError::Unavailable("injected failure".to_string()));
            println!("next write will fail");
        }
        ("move", Some(id), Some(column)) => match status::classify(column) {
            Some(to) => match sync.request_move(&id, to) {
                Ok(RequestOutcome::Issued(_)) => {}
                Ok(RequestOutcome::Unchanged) => println!("{id} is already in {to}"),
                Err(e) => println!("! {e}"),
            },
            None => println!("! unknown column {column:?}"),
        },
        ("title", Some(id), Some(text)) if !text.is_empty() => {
            let mut update = FieldMap::new();
            update.insert(fields::TITLE.to_string(), Value::String(text.to_string()));
            match sync.request_edit(&id, update) {
                Ok(RequestOutcome::Issued(_)) => {}
                Ok(RequestOutcome::Unchanged) => println!("{id} already has that title"),
                Err(e) => println!("! {e}"),
            }
        }
        ("delete", Some(id), _) => {
            if let Err(e) = sync.request_delete(&id) {
                println!("! {e}");
            }
        }
        _ => println!("! unrecognized command, try `help`"),
    }
    Flow::Continue
}

fn print_board(view: &BoardView) {
    println!("== board ({}) ==", view.health);
    for status in CanonicalStatus::ALL {
        let entries = view.board.column(status);
        println!("{status} ({})", entries.len());
        for entry in entries {
            let marker = if entry.optimistic { '*' } else { ' ' };
            println!(
                " {marker} {:<12} {} [{}]",
                entry.task.id,
                entry.task.title,
                entry.task.priority.as_str()
            );
        }
    }
}
