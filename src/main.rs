// Module declarations
mod agent;
mod agent_log;
mod anthropic;
mod bus;
mod cli;
mod collaborate;
mod commands;
mod config;
mod context;
mod embeddings;
mod errors;
mod llm;
mod logging;
mod memory_store;
mod memory_sync;
mod openai;
mod scheduler;
mod session;
mod shell_guard;
mod tools;
mod util;
mod vector_index;
mod workspace_guard;

// Every module's items live in one crate-root namespace; modules refer to each other
// through `crate::Name`.
#[allow(unused_imports)]
pub(crate) use agent::*;
#[allow(unused_imports)]
pub(crate) use agent_log::*;
#[allow(unused_imports)]
pub(crate) use anthropic::*;
#[allow(unused_imports)]
pub(crate) use bus::*;
#[allow(unused_imports)]
pub(crate) use cli::*;
#[allow(unused_imports)]
pub(crate) use collaborate::*;
#[allow(unused_imports)]
pub(crate) use commands::*;
#[allow(unused_imports)]
pub(crate) use config::*;
#[allow(unused_imports)]
pub(crate) use context::*;
#[allow(unused_imports)]
pub(crate) use embeddings::*;
#[allow(unused_imports)]
pub(crate) use errors::*;
#[allow(unused_imports)]
pub(crate) use llm::*;
#[allow(unused_imports)]
pub(crate) use logging::*;
#[allow(unused_imports)]
pub(crate) use memory_store::*;
#[allow(unused_imports)]
pub(crate) use memory_sync::*;
#[allow(unused_imports)]
pub(crate) use openai::*;
#[allow(unused_imports)]
pub(crate) use scheduler::*;
#[allow(unused_imports)]
pub(crate) use session::*;
#[allow(unused_imports)]
pub(crate) use shell_guard::*;
#[allow(unused_imports)]
pub(crate) use tools::*;
#[allow(unused_imports)]
pub(crate) use util::*;
#[allow(unused_imports)]
pub(crate) use vector_index::*;
#[allow(unused_imports)]
pub(crate) use workspace_guard::*;

use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{Local, TimeZone};
use clap::Parser;

const LOGO: &str = "🤖";
const PRINTER_POLL: Duration = Duration::from_millis(250);

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    if let Command::Init { force } = cli.command {
        return run_init(&config_path, force);
    }

    let mut config = load_config(&config_path)?;
    config.apply_env_overrides();

    match cli.command {
        Command::Init { .. } => Ok(()),

        Command::Chat { session } => run_chat(config, &session),

        Command::Ask { message, session } => {
            let provider = build_default_provider(&config)?;
            let memory = memory_handle(&config);
            let scheduler = open_scheduler(&config);
            let mut agent = AgentLoop::new(config, MessageBus::new(), provider, scheduler, memory);
            let reply = agent.process_direct(&message, &session);
            println!("\n{LOGO} {reply}");
            Ok(())
        }

        Command::Index => {
            let backend = LazyMemory::from_config(&config).get()?;
            let report = backend.index_all();
            println!(
                "Indexed {} chunks from {} files into {}",
                report.chunks,
                report.files,
                backend.index.path().display()
            );
            for failure in &report.failures {
                eprintln!("  failed: {failure}");
            }
            let stats = backend.index.get_stats()?;
            println!(
                "Index holds {} chunks across {} files (dimension {}, {} backend)",
                stats.total_chunks,
                stats.indexed_files,
                stats.dimension,
                if stats.has_sqlite_vec { "sqlite-vec" } else { "cosine" }
            );
            Ok(())
        }

        Command::Search { query, limit, weight } => {
            let backend = LazyMemory::from_config(&config).get()?;
            let limit = limit.unwrap_or_else(|| backend.default_limit()).max(1);
            let weight = weight.unwrap_or(config.memory.vector_weight);
            let embedding = backend.embedder.embed(&query)?;
            let hits = backend.index.hybrid_search(&embedding, &query, limit, weight)?;
            if hits.is_empty() {
                println!("No memories found for: {query}");
                return Ok(());
            }
            for (i, hit) in hits.iter().enumerate() {
                println!(
                    "{}. {}:{}-{} (score {:.3})",
                    i + 1,
                    hit.file_path,
                    hit.start_line,
                    hit.end_line,
                    hit.score
                );
                let snippet: String = hit.text.chars().take(240).collect();
                println!("   {}", snippet.replace('\n', " "));
            }
            Ok(())
        }

        Command::Sessions => {
            let sessions = SessionManager::new(config.data_dir_path().join("sessions"));
            let all = sessions.list_sessions();
            if all.is_empty() {
                println!("No sessions found.");
                return Ok(());
            }
            for info in all {
                let name = info.name.map(|n| format!(" ({n})")).unwrap_or_default();
                println!(
                    "{}{name}  {} messages  updated {}",
                    info.key, info.message_count, info.updated_at
                );
            }
            Ok(())
        }

        Command::Collab { task } => {
            let collaborator = Collaborator::from_config(&config);
            let result = collaborator.collaborate(&task, &|text| println!("{text}\n"));
            println!("{}", summarize_result(&result));
            if result.success {
                println!("\n{}", result.final_synthesis);
                Ok(())
            } else {
                Err(result.error.unwrap_or_else(|| "collaboration failed".into()).into())
            }
        }

        Command::Status => {
            print_status(&config_path, &config);
            Ok(())
        }
    }
}

fn run_init(config_path: &Path, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let config = if config_path.exists() && !force {
        println!("Config already exists: {} (use --force to overwrite)", config_path.display());
        load_config(config_path)?
    } else {
        let config = FileConfig::default();
        save_config(config_path, &config)?;
        println!("Wrote {}", config_path.display());
        config
    };
    let workspace = config.workspace_path();
    for created in bootstrap_workspace(&workspace)? {
        println!("Created {}", created.display());
    }
    println!("Workspace ready at {}", workspace.display());
    println!("Add an API key under providers in {} to start chatting.", config_path.display());
    Ok(())
}

/// Memory tools are registered only when memory is enabled; the backend opens on first use.
fn memory_handle(config: &FileConfig) -> Option<Arc<LazyMemory>> {
    config
        .memory
        .enabled
        .then(|| Arc::new(LazyMemory::from_config(config)))
}

fn open_scheduler(config: &FileConfig) -> Option<Arc<dyn Scheduler>> {
    open_cron_service(config).map(|service| service as Arc<dyn Scheduler>)
}

fn open_cron_service(config: &FileConfig) -> Option<Arc<CronService>> {
    let path = CronService::default_path(&config.data_dir_path());
    match CronService::open(&path) {
        Ok(service) => Some(Arc::new(service)),
        Err(e) => {
            tracing::warn!(target: "scheduler", error = %e, "reminders disabled");
            None
        }
    }
}

/// Interactive channel: a stdin reader and an outbound printer talk to the agent only
/// through the bus. The agent runs on this thread until `exit` or end of input.
fn run_chat(config: FileConfig, session: &str) -> Result<(), Box<dyn std::error::Error>> {
    let provider = build_default_provider(&config)?;
    let (channel, chat_id) = session.split_once(':').unwrap_or(("cli", session));
    let (channel, chat_id) = (channel.to_string(), chat_id.to_string());

    let bus = MessageBus::new();
    let memory = memory_handle(&config);
    if let Some(memory) = &memory {
        match memory.get() {
            Ok(backend) => {
                spawn_background_index(backend);
            }
            Err(e) => tracing::warn!(target: "memory", error = %e, "memory unavailable"),
        }
    }
    let cron = open_cron_service(&config);
    let scheduler = cron.clone().map(|service| service as Arc<dyn Scheduler>);
    let mut agent = AgentLoop::new(config, bus.clone(), provider, scheduler, memory);
    let running = agent.running_flag();

    if let Some(cron) = cron {
        let job_bus = bus.clone();
        cron.spawn_ticker(running.clone(), move |job| {
            if !AgentLoop::handle_job(&job_bus, &job) {
                tracing::warn!(target: "scheduler", id = %job.id, "bus closed, job dropped");
            }
        });
    }

    let printer_bus = bus.clone();
    let printer_running = running.clone();
    let printer_channel = channel.clone();
    let printer = thread::Builder::new().name("cli-printer".into()).spawn(move || {
        while printer_running.load(Ordering::SeqCst) {
            let Some(msg) = printer_bus.consume_outbound(PRINTER_POLL) else {
                continue;
            };
            if msg.channel == printer_channel {
                println!("\n{LOGO} {}\n", msg.content);
            } else {
                println!("\n{LOGO} [{}:{}] {}\n", msg.channel, msg.chat_id, msg.content);
            }
        }
    })?;

    let reader_bus = bus.clone();
    let reader_running = running.clone();
    thread::Builder::new().name("cli-reader".into()).spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            let text = line.trim();
            if text.is_empty() {
                continue;
            }
            if matches!(text, "exit" | "quit" | "/exit" | "/quit") {
                break;
            }
            if !reader_bus.publish_inbound(InboundMessage::new(&channel, "user", &chat_id, text)) {
                break;
            }
        }
        println!("Goodbye!");
        reader_running.store(false, Ordering::SeqCst);
    })?;

    println!("{LOGO} Interactive mode (type exit to quit)\n");
    let _ = io::stdout().flush();
    agent.run();
    let _ = printer.join();
    for msg in bus.drain_outbound() {
        println!("\n{LOGO} {}\n", msg.content);
    }
    Ok(())
}

fn mark(ok: bool) -> &'static str {
    if ok { "✓" } else { "✗" }
}

fn print_status(config_path: &Path, config: &FileConfig) {
    let workspace = config.workspace_path();
    println!("{LOGO} icron Status\n");
    println!("Config: {} {}", config_path.display(), mark(config_path.exists()));
    println!("Workspace: {} {}", workspace.display(), mark(workspace.exists()));
    println!("Model: {}", config.agent.model);
    println!(
        "Provider: {}",
        config.resolve_provider().unwrap_or_else(|| "not configured".into())
    );
    let configured = config.configured_providers();
    println!(
        "Configured providers: {}",
        if configured.is_empty() { "none".to_string() } else { configured.join(", ") }
    );
    for name in KNOWN_PROVIDERS {
        let state = if config.api_key_for(name).is_some() { "✓" } else { "not set" };
        println!("  {name}: {state}");
    }
    println!(
        "Web search: {}",
        if config.tools.web_search.api_key.trim().is_empty() { "not set" } else { "✓" }
    );
    let index_path = workspace.join(MEMORY_DIR).join(INDEX_FILE_NAME);
    println!(
        "Memory: {} (index {})",
        if config.memory.enabled { "enabled" } else { "disabled" },
        if index_path.exists() { "built" } else { "not built" }
    );
    if let Some(cron) = open_cron_service(config) {
        let jobs = cron.list_jobs();
        println!("Scheduled jobs: {}", jobs.len());
        for job in jobs.iter().take(10) {
            let next = job
                .next_run_at_ms
                .and_then(|ms| Local.timestamp_millis_opt(ms).single())
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_default();
            println!("  {} {} {next}", job.id, job.name);
        }
    }
    let sessions = SessionManager::new(config.data_dir_path().join("sessions"));
    println!("Sessions: {}", sessions.list_sessions().len());
}
