use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn, Level};

use easel_core::clock::{Clock, SystemClock};
use easel_core::ids::SessionId;
use easel_core::messages::ConversationMessage;
use easel_core::session::SessionState;
use easel_core::sink::SessionSink;
use easel_engine::budget::BudgetConfig;
use easel_engine::executor::{ActionExecutor, ExecutorConfig};
use easel_engine::indexer::SceneIndexer;
use easel_engine::intent::{HeuristicIntents, IntentStrategy};
use easel_engine::scene::InMemoryScene;
use easel_engine::session::{
    MemorySink, SessionConfig, SessionRegistry, SessionRequest, SessionRunner,
};
use easel_llm::{GatewayConfig, InMemoryRateLimits};
use easel_store::events::EventRepo;
use easel_store::{Database, SqliteSink};
use easel_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "easel", about = "Natural-language editing for canvas scenes")]
struct Cli {
    /// Log at debug level.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the snapshot of a scene.
    Index {
        #[arg(long)]
        scene: PathBuf,
    },
    /// Run a full session against the configured providers.
    Run {
        #[arg(long)]
        scene: PathBuf,
        #[arg(long)]
        prompt: String,
        /// JSON array of `{role, content}` messages.
        #[arg(long)]
        history: Option<PathBuf>,
        /// Where to write the edited scene.
        #[arg(long)]
        out: Option<PathBuf>,
        /// SQLite database for sessions, events and actions.
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        max_tokens: Option<u32>,
    },
    /// Apply the keyword-based intents for a prompt, without a model.
    Intents {
        #[arg(long)]
        scene: PathBuf,
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Replay stored events of a session as SSE frames.
    Events {
        #[arg(long)]
        db: PathBuf,
        #[arg(long)]
        session: String,
        /// Only events after this sequence number.
        #[arg(long, default_value_t = 0)]
        since: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let telemetry = TelemetryConfig {
        log_level: if cli.verbose { Level::DEBUG } else { Level::INFO },
        json: cli.json_logs,
        ..TelemetryConfig::default()
    };
    init_telemetry(&telemetry).context("failed to initialize logging")?;

    match cli.command {
        Command::Index { scene } => index(&scene),
        Command::Run {
            scene,
            prompt,
            history,
            out,
            db,
            max_tokens,
        } => {
            run(
                &scene,
                prompt,
                history.as_deref(),
                out.as_deref(),
                db.as_deref(),
                max_tokens,
            )
            .await
        }
        Command::Intents { scene, prompt, out } => intents(&scene, &prompt, out.as_deref()).await,
        Command::Events { db, session, since } => events(&db, &session, since),
    }
}

fn load_scene(path: &Path) -> Result<InMemoryScene> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read scene {}", path.display()))?;
    InMemoryScene::from_json(&raw).with_context(|| format!("invalid scene {}", path.display()))
}

fn save_scene(scene: &InMemoryScene, path: &Path) -> Result<()> {
    let json = scene.to_json().context("failed to serialize scene")?;
    std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
    info!(path = %path.display(), "scene written");
    Ok(())
}

fn index(scene: &Path) -> Result<()> {
    let scene = load_scene(scene)?;
    let snapshot = SceneIndexer::new(Arc::new(SystemClock)).index(&scene);
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn run(
    scene_path: &Path,
    prompt: String,
    history: Option<&Path>,
    out: Option<&Path>,
    db: Option<&Path>,
    max_tokens: Option<u32>,
) -> Result<()> {
    let mut scene = load_scene(scene_path)?;
    let history: Vec<ConversationMessage> = match history {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("invalid history {}", path.display()))?
        }
        None => Vec::new(),
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let gateway = GatewayConfig::from_env()
        .build(Arc::new(InMemoryRateLimits::new()), clock.clone())
        .context("failed to configure model gateway")?;
    if gateway.routes().is_empty() {
        bail!("no provider credentials configured (set GEMINI_API_KEY or OPENROUTER_API_KEY)");
    }

    let sink: Arc<dyn SessionSink> = match db {
        Some(path) => {
            let db = Database::open(path)
                .with_context(|| format!("failed to open database {}", path.display()))?;
            Arc::new(SqliteSink::new(db))
        }
        None => Arc::new(MemorySink::new()),
    };

    let mut budget = BudgetConfig::default();
    if let Some(max) = max_tokens {
        budget.max_tokens = max;
    }
    let config = SessionConfig::default();
    let registry = SessionRegistry::new(config.clone(), clock.clone());
    let runner = SessionRunner::new(
        Arc::new(gateway),
        Arc::new(ActionExecutor::new(ExecutorConfig::default())),
        sink,
        clock,
    )
    .with_budget(budget)
    .with_config(config);

    let handle = registry.create();
    info!(session_id = %handle.id(), "session started");

    let mut rx = handle.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Ok(line) = serde_json::to_string(&event) {
                        println!("{line}");
                    }
                    if event.is_terminal() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event printer fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let cancel_on_interrupt = {
        let handle = Arc::clone(&handle);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cancelling session");
                handle.cancel();
            }
        })
    };

    let report = runner
        .run(&handle, &mut scene, SessionRequest::new(prompt).with_history(history))
        .await?;
    cancel_on_interrupt.abort();
    if let Err(e) = printer.await {
        warn!(error = %e, "event printer stopped");
    }
    registry.cleanup_stale();

    if let Some(out) = out {
        save_scene(&scene, out)?;
    }
    if report.state != SessionState::Completed {
        bail!(
            "session {} failed: {}",
            report.session_id,
            report.error.as_deref().unwrap_or("unknown error")
        );
    }
    info!(
        actions = report.actions.len(),
        provider_model = ?report.provider_model,
        "session finished"
    );
    Ok(())
}

async fn intents(scene_path: &Path, prompt: &str, out: Option<&Path>) -> Result<()> {
    let mut scene = load_scene(scene_path)?;
    let strategy = HeuristicIntents;
    let actions = strategy.actions_for(prompt);
    info!(strategy = strategy.name(), actions = actions.len(), "intents detected");

    let executor = ActionExecutor::new(ExecutorConfig::default());
    let outcomes = executor.execute_batch(&mut scene, &actions).await;
    for (action, outcome) in actions.iter().zip(&outcomes) {
        let line = serde_json::json!({"action": action, "outcome": outcome});
        println!("{line}");
    }

    if let Some(out) = out {
        save_scene(&scene, out)?;
    }
    Ok(())
}

fn events(db: &Path, session: &str, since: u64) -> Result<()> {
    let db = Database::open(db)
        .with_context(|| format!("failed to open database {}", db.display()))?;
    let events = EventRepo::new(db)
        .list_since(&SessionId::from_raw(session), since)
        .context("failed to load events")?;
    if events.is_empty() {
        warn!(session, since, "no stored events");
    }
    for event in events {
        print!("{}", event.to_sse());
    }
    Ok(())
}
