mod commands;
mod net;
mod render;

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use mender_core::config::MenderCfg;
use mender_core::repair::{
    ChannelListener, FileSet, GenerationError, Listeners, LlmPatchGenerator, PatchGenerator,
    RepairEvent, RepairOrchestrator, TracingListener,
};
use mender_core::sandbox::{
    self, ConsoleArg, ConsoleLevel, ConsoleSink, NetworkRequest, Rejection, SandboxContext,
    ScriptFault, join_args,
};
use mender_core::session::{PreviewSession, SessionHandle, ShutdownGuard};
use mender_core::types::{FilePatch, Origin, PreviewError, RepairContext};
use mender_llm::provider::LlmError;
use rustyline::error::ReadlineError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use commands::ReplCommand;

const DB_CONNECT_TIMEOUT_SECS: u64 = 3;

#[derive(Parser, Debug)]
#[command(
    name = "mender",
    about = "Capture runtime errors from a sandboxed preview and repair them",
    version
)]
struct Args {
    /// Project directory loaded as the repairable file set
    #[arg(short, long, default_value = ".")]
    root: PathBuf,

    /// Write applied patches back to disk
    #[arg(short, long)]
    write_back: bool,

    /// Origin URL the sandbox reports from
    #[arg(short, long, default_value = "http://localhost:5173/")]
    url: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // The REPL owns the terminal, so logs go to a file.
    if std::env::var("RUST_LOG").is_ok() {
        let file = std::fs::File::create("/tmp/mender.log")?;
        tracing_subscriber::registry()
            .with(EnvFilter::from_default_env())
            .with(fmt::layer().json().with_target(true).with_writer(file))
            .init();
    }

    let (pool, mut notices) = connect_db().await;
    let cfg = match &pool {
        Some(pool) => MenderCfg::load(pool).await?,
        None => MenderCfg::from_env(),
    };

    let root = args.root.canonicalize()?;
    let files = FileSet::load_dir(&root)?;
    notices.push(format!("loaded {} files from {}", files.len(), root.display()));

    let generator: Arc<dyn PatchGenerator> = match mender_llm::http::from_env() {
        Some(provider) => {
            notices.push(format!("patch generator: {}", provider.model()));
            Arc::new(LlmPatchGenerator::new(Arc::new(provider)))
        }
        None => {
            notices.push("no patch generator configured (set MENDER_LLM_MODEL and MENDER_LLM_API_KEY); every repair will fail".into());
            Arc::new(Unconfigured)
        }
    };

    let (events, events_rx) = ChannelListener::new();
    let listeners = Listeners::new().with(events).with(TracingListener);
    let mut orchestrator = RepairOrchestrator::new(&cfg, files, generator, listeners);
    if let Some(pool) = &pool {
        orchestrator = orchestrator.with_pool(pool.clone());
    }
    if args.write_back {
        orchestrator = orchestrator.with_write_back(root.clone());
    }

    let shutdown = ShutdownGuard::new();
    shutdown.spawn_signal_listener();
    let token = shutdown.token();
    let (session, task) = PreviewSession::spawn(&cfg, orchestrator, &token);

    let ctx = SandboxContext::new(
        Origin {
            url: Some(args.url),
            user_agent: Some(concat!("mender/", env!("CARGO_PKG_VERSION")).into()),
        },
        Arc::new(StdoutConsole),
        Arc::new(net::HttpNetwork::new()),
    );
    sandbox::install(&ctx, cfg.instrumentation(), session.transport());

    let result = run_repl(&ctx, &session, events_rx, token.clone(), notices).await;
    token.cancel();
    if let Err(e) = task.await {
        tracing::warn!(error = %e, "session task ended abnormally");
    }
    result
}

/// Optional database. Any failure falls back to an ephemeral session.
async fn connect_db() -> (Option<sqlx::PgPool>, Vec<String>) {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        return (None, Vec::new());
    };
    let connect_result = tokio::time::timeout(
        Duration::from_secs(DB_CONNECT_TIMEOUT_SECS),
        sqlx::postgres::PgPoolOptions::new()
            .max_connections(4)
            .connect(&url),
    )
    .await;

    let reason = match connect_result {
        Ok(Ok(pool)) => match sqlx::migrate!("../../migrations").run(&pool).await {
            Ok(()) => {
                tracing::info!("database connected and migrations applied");
                return (Some(pool), Vec::new());
            }
            Err(e) => {
                tracing::warn!(error = %e, "database migration failed, running ephemeral");
                "database migration failed".to_string()
            }
        },
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "failed to connect DATABASE_URL, running ephemeral");
            "could not connect to DATABASE_URL".to_string()
        }
        Err(_) => {
            tracing::warn!(timeout_secs = DB_CONNECT_TIMEOUT_SECS, "database connect timed out, running ephemeral");
            format!("database connect timed out ({DB_CONNECT_TIMEOUT_SECS}s)")
        }
    };
    (None, vec![format!("note: {reason}; config from environment, attempts not persisted")])
}

/// Stand-in when no provider is configured.
struct Unconfigured;

#[async_trait::async_trait]
impl PatchGenerator for Unconfigured {
    fn name(&self) -> &str {
        "unconfigured"
    }

    async fn generate(
        &self,
        _error: &PreviewError,
        _context: &RepairContext,
    ) -> Result<Vec<FilePatch>, GenerationError> {
        Err(LlmError::Unavailable("no provider configured".into()).into())
    }
}

/// The sandbox's own console, printed above the prompt.
struct StdoutConsole;

impl ConsoleSink for StdoutConsole {
    fn write(&self, level: ConsoleLevel, args: &[ConsoleArg]) {
        let tag = match level {
            ConsoleLevel::Log => "log",
            ConsoleLevel::Warn => "warn",
            ConsoleLevel::Error => "error",
        };
        println!("[console.{tag}] {}", join_args(args));
    }
}

async fn run_repl(
    ctx: &SandboxContext,
    session: &SessionHandle,
    mut events_rx: mpsc::UnboundedReceiver<RepairEvent>,
    token: CancellationToken,
    notices: Vec<String>,
) -> anyhow::Result<()> {
    for notice in notices {
        println!("{notice}");
    }
    println!("type `help` for commands");

    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<InputEvent>();
    let (ready_tx, ready_rx) = std::sync::mpsc::channel::<()>();
    spawn_input_thread(line_tx, ready_rx);
    request_next_prompt(&ready_tx);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            event = events_rx.recv() => {
                let Some(event) = event else {
                    break;
                };
                clear_current_line()?;
                println!("{}", render::event(&event));
            }
            line = line_rx.recv() => {
                let Some(line) = line else {
                    break;
                };
                match line {
                    InputEvent::Line(line) => {
                        if !line.trim().is_empty() {
                            match commands::parse(&line) {
                                Ok(ReplCommand::Quit) => break,
                                Ok(cmd) => {
                                    if let Err(e) = execute(ctx, session, cmd).await {
                                        println!("{e}");
                                        break;
                                    }
                                }
                                Err(msg) => println!("{msg}"),
                            }
                        }
                        request_next_prompt(&ready_tx);
                    }
                    InputEvent::Interrupted => {
                        token.cancel();
                        break;
                    }
                    InputEvent::Eof => break,
                    InputEvent::Error(err) => {
                        eprintln!("input error: {err}");
                        break;
                    }
                }
            }
        }
    }
    drop(ready_tx);
    println!();
    Ok(())
}

/// Run one command against the sandbox or the session.
async fn execute(
    ctx: &SandboxContext,
    session: &SessionHandle,
    cmd: ReplCommand,
) -> anyhow::Result<()> {
    match cmd {
        ReplCommand::Throw(message) => {
            if let Err(fault) = ctx.raise(ScriptFault::new(message)) {
                println!("uncaught: {}", fault.message);
            }
        }
        ReplCommand::Reject(message) => {
            if let Err(rejection) = ctx.reject(Rejection::new(message)) {
                println!("unhandled rejection: {}", rejection.message);
            }
        }
        ReplCommand::Log(args) => ctx.console_log(&args),
        ReplCommand::Warn(args) => ctx.console_warn(&args),
        ReplCommand::Error(args) => ctx.console_error(&args),
        ReplCommand::Fetch { method, url } => {
            match ctx.fetch(NetworkRequest::new(method, url)).await {
                Ok(resp) => println!("{} {}", resp.status, resp.status_text),
                Err(e) => println!("fetch failed: {e}"),
            }
        }
        ReplCommand::Xhr { method, url } => match ctx.open_request(&method, &url).send(None).await {
            Ok(resp) => println!("{} {}", resp.status, resp.status_text),
            Err(e) => println!("request failed: {e}"),
        },
        ReplCommand::Load(elapsed) => ctx.finish_load(elapsed),
        ReplCommand::Op(text) => session.set_last_operation(Some(text)).await?,
        ReplCommand::Edit { path, content } => {
            let revision = session.edit_file(path.as_str(), content).await?;
            session.set_active_file(path.as_str()).await?;
            println!("{path} now at revision {revision}");
        }
        ReplCommand::Open(path) => {
            if session.set_active_file(path.as_str()).await? {
                println!("{path} is now the active file");
            } else {
                println!("open: {path} is not in the file set");
            }
        }
        ReplCommand::Files => {
            let files = session.files().await?;
            for path in files.paths() {
                let marker = if files.active() == Some(path) { "*" } else { " " };
                println!("{marker} {path} (rev {})", files.revision(path).unwrap_or_default());
            }
        }
        ReplCommand::Stats => println!("{}", render::breaker(&session.stats().await?)),
        ReplCommand::Status => println!("{}", render::status(&session.status().await?)),
        ReplCommand::Reset => {
            session.reset().await?;
            println!("breaker reset");
        }
        ReplCommand::History => println!("{}", render::history(&session.history().await?)),
        ReplCommand::Help => println!("{}", commands::HELP),
        ReplCommand::Quit => {}
    }
    Ok(())
}

fn clear_current_line() -> anyhow::Result<()> {
    print!("\r\x1b[2K");
    io::stdout().flush()?;
    Ok(())
}

fn request_next_prompt(ready_tx: &std::sync::mpsc::Sender<()>) {
    let _ = ready_tx.send(());
}

fn spawn_input_thread(
    line_tx: mpsc::UnboundedSender<InputEvent>,
    ready_rx: std::sync::mpsc::Receiver<()>,
) {
    std::thread::spawn(move || {
        let mut editor = match rustyline::DefaultEditor::new() {
            Ok(editor) => editor,
            Err(e) => {
                let _ = line_tx.send(InputEvent::Error(e.to_string()));
                return;
            }
        };

        while ready_rx.recv().is_ok() {
            match editor.readline("mender> ") {
                Ok(line) => {
                    let _ = editor.add_history_entry(line.as_str());
                    if line_tx.send(InputEvent::Line(line)).is_err() {
                        break;
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    let _ = line_tx.send(InputEvent::Interrupted);
                    break;
                }
                Err(ReadlineError::Eof) => {
                    let _ = line_tx.send(InputEvent::Eof);
                    break;
                }
                Err(e) => {
                    let _ = line_tx.send(InputEvent::Error(e.to_string()));
                    break;
                }
            }
        }
    });
}

enum InputEvent {
    Line(String),
    Interrupted,
    Eof,
    Error(String),
}
