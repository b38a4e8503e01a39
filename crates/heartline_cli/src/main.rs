use clap::{Parser, Subcommand};
use heartline_core::{
    ChatError, Choice, ChoiceData, HeartlineConfig, PersonaProfile, ScenarioType, ScriptLibrary,
    StaticEntitlement, StaticPersonaDirectory,
};
use heartline_gateway::GatewayServer;
use heartline_memory::{ConversationStore, InMemoryStore, SqliteStore};
use heartline_reasoning::{providers, ChatEngine, TurnOutcome, TurnRequest};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "heartline", author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, env = "HEARTLINE_CONFIG", default_value = "heartline.toml")]
    config: PathBuf,

    /// Keep everything in memory instead of SQLite
    #[arg(long)]
    ephemeral: bool,

    /// Log as JSON lines
    #[arg(long, env = "HEARTLINE_LOG_JSON")]
    log_json: bool,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long, env = "HEARTLINE_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Users granted premium choices (comma separated)
    #[arg(long = "premium-user", env = "HEARTLINE_PREMIUM_USERS", value_delimiter = ',')]
    premium_users: Vec<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP gateway
    Serve {
        /// Bind address, overrides the config (host:port)
        #[arg(long)]
        bind: Option<String>,
    },
    /// Chat with a persona in the terminal
    Chat {
        #[arg(short, long, default_value = "luna")]
        persona: String,
        #[arg(short, long, default_value = "local")]
        user: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    let _guard = init_logging(cli.log_json, cli.log_dir.as_deref());

    let mut cfg = if cli.config.exists() {
        HeartlineConfig::load(&cli.config)?
    } else {
        HeartlineConfig::load_or_default(&cli.config)
    };

    match cli.command.unwrap_or(Command::Chat {
        persona: "luna".into(),
        user: "local".into(),
    }) {
        Command::Serve { bind } => {
            if let Some(bind) = bind {
                let (host, port) = bind
                    .rsplit_once(':')
                    .ok_or_else(|| anyhow::anyhow!("--bind must be host:port, got {}", bind))?;
                cfg.gateway.host = host.to_string();
                cfg.gateway.port = port.parse()?;
            }
            let engine = build_engine(&cfg, cli.ephemeral, cli.premium_users).await?;
            GatewayServer::new(engine, &cfg.gateway.host, cfg.gateway.port)
                .serve()
                .await
        }
        Command::Chat { persona, user } => {
            let engine = build_engine(&cfg, cli.ephemeral, cli.premium_users).await?;
            run_chat(engine, &user, &persona).await
        }
    }
}

/// `RUST_LOG` filter (default `info`), human or JSON output, optional daily file.
fn init_logging(json: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "heartline.log"));
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };
    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().with_writer(io::stderr)).init();
    }
    guard
}

fn default_persona() -> PersonaProfile {
    let mut luna = PersonaProfile::new(
        "luna",
        "Luna",
        "Warm, a little shy at first, teases once she trusts you",
    );
    luna.backstory = Some("Works nights at a bookshop cafe and writes poems nobody has read yet.".into());
    luna.interests = vec!["poetry".into(), "rainy days".into(), "cats".into()];
    luna
}

async fn build_engine(cfg: &HeartlineConfig, ephemeral: bool, premium_users: Vec<String>) -> anyhow::Result<Arc<ChatEngine>> {
    let store: Arc<dyn ConversationStore> = if ephemeral {
        info!("Using in-memory store");
        Arc::new(InMemoryStore::new())
    } else {
        if let Some(parent) = cfg.storage.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        info!("Opening database at {}", cfg.storage.db_path.display());
        Arc::new(SqliteStore::new(&cfg.storage.db_path, cfg.storage.timeout()).await?)
    };

    let mut personas = StaticPersonaDirectory::load_dir(&cfg.storage.persona_dir).await?;
    if personas.is_empty() {
        warn!(
            "No personas found in {}, using the built-in default",
            cfg.storage.persona_dir.display()
        );
        personas.insert(default_persona());
    }
    info!("Personas: {}", personas.ids().join(", "));

    let scripts = ScriptLibrary::load_dir(&cfg.storage.scripts_dir).await?;
    let llm = providers::from_config(&cfg.llm)?;
    info!("LLM provider '{}' with model {}", cfg.llm.provider, cfg.llm.model);

    let engine = ChatEngine::from_config(
        cfg,
        store,
        Arc::new(personas),
        Arc::new(scripts),
        llm,
        Arc::new(StaticEntitlement::new(premium_users)),
    )?;
    Ok(Arc::new(engine))
}

// ============================================================================
// Terminal chat
// ============================================================================

const HELP: &str = "Commands:
  /pick <n>    select a shown choice (1, 2, ... or c1, c2, ...)
  /accept      accept the offered scenario
  /decline     decline the offered scenario
  /new         start a fresh session
  /rel         show the relationship
  /history     show this session's messages
  quit         exit";

struct ChatState {
    session_id: Option<Uuid>,
    offered: Option<ScenarioType>,
    /// Choices on screen and the message that presented them.
    choices: Vec<Choice>,
    message_id: Option<Uuid>,
}

impl ChatState {
    fn choice(&self, arg: &str) -> Option<&Choice> {
        let arg = arg.trim();
        if let Ok(n) = arg.parse::<usize>() {
            return n.checked_sub(1).and_then(|i| self.choices.get(i));
        }
        self.choices
            .iter()
            .find(|c| c.id == arg || c.local_id() == arg)
    }
}

async fn run_chat(engine: Arc<ChatEngine>, user: &str, persona_id: &str) -> anyhow::Result<()> {
    let persona = engine.sessions().persona(persona_id).await?;
    println!("Chatting with {}. Type /help for commands, 'quit' to exit.", persona.name);

    let mut state = ChatState {
        session_id: None,
        offered: None,
        choices: Vec::new(),
        message_id: None,
    };
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    prompt()?;
    while let Some(line) = lines.next_line().await? {
        let input = line.trim();
        if input == "quit" || input == "exit" {
            break;
        }
        if !input.is_empty() {
            if let Err(e) = handle_line(&engine, &mut state, user, &persona, input).await {
                tracing::debug!("Command failed: {}", e);
                println!("[error] {}", e.public_message());
            }
        }
        prompt()?;
    }
    Ok(())
}

fn prompt() -> io::Result<()> {
    print!("> ");
    io::stdout().flush()
}

async fn handle_line(
    engine: &ChatEngine,
    state: &mut ChatState,
    user: &str,
    persona: &PersonaProfile,
    input: &str,
) -> Result<(), ChatError> {
    let (command, arg) = input.split_once(' ').unwrap_or((input, ""));
    match command {
        "/help" => println!("{}", HELP),
        "/new" => {
            let session = engine.start_session(user, &persona.id).await?;
            state.session_id = Some(session.id);
            state.offered = None;
            state.choices.clear();
            state.message_id = None;
            println!("(new session {})", session.id);
        }
        "/rel" => {
            let rel = engine.relationship(user, &persona.id).await?;
            println!(
                "{} | affection {} trust {} intimacy {} | {} messages",
                rel.stage, rel.affection, rel.trust, rel.intimacy, rel.message_count
            );
        }
        "/history" => {
            let Some(id) = state.session_id else {
                println!("(no session yet)");
                return Ok(());
            };
            for m in engine.history(user, id).await? {
                println!("#{} {:?}: {}", m.sequence_number, m.role, m.content);
            }
        }
        "/accept" | "/decline" => {
            let (Some(id), Some(scenario)) = (state.session_id, state.offered) else {
                println!("(no scenario on offer)");
                return Ok(());
            };
            let resp = engine
                .respond_to_scenario(user, id, scenario, command == "/accept")
                .await?;
            state.offered = None;
            if let Some(opening) = resp.opening {
                println!("{}: {}", persona.name, opening.content);
                for (i, c) in opening.choices_presented.iter().enumerate() {
                    println!("  {}) {}", i + 1, c.text);
                }
                state.choices = opening.choices_presented;
                state.message_id = Some(opening.id);
            } else if !resp.accepted {
                println!("(maybe another time)");
            }
        }
        "/pick" => {
            let Some(choice) = state.choice(arg) else {
                println!("(no such choice)");
                return Ok(());
            };
            let req = TurnRequest {
                persona_id: persona.id.clone(),
                message: String::new(),
                session_id: state.session_id,
                choice_data: Some(ChoiceData {
                    choice_id: choice.id.clone(),
                    message_id: state.message_id,
                }),
            };
            let outcome = engine.chat_turn(user, req).await?;
            show(state, persona, outcome);
        }
        _ => {
            let req = TurnRequest {
                persona_id: persona.id.clone(),
                message: input.to_string(),
                session_id: state.session_id,
                choice_data: None,
            };
            let outcome = engine.chat_turn(user, req).await?;
            show(state, persona, outcome);
        }
    }
    Ok(())
}

fn show(state: &mut ChatState, persona: &PersonaProfile, outcome: TurnOutcome) {
    state.session_id = Some(outcome.session_id);
    if let Some(paywall) = &outcome.paywall {
        println!("[premium] {}", paywall.tease);
        return;
    }

    println!("\n{} [{}]: {}", persona.name, outcome.emotion, outcome.content);
    if let Some(thought) = &outcome.inner_thought {
        println!("  ({})", thought);
    }
    for (i, c) in outcome.choices.iter().enumerate() {
        let tag = if c.is_premium { " [premium]" } else { "" };
        println!("  {}) {}{}", i + 1, c.text, tag);
    }
    if outcome.affection_change != 0 {
        println!("  ~ affection {:+}", outcome.affection_change);
    }
    if let Some(t) = &outcome.stage_changed {
        println!("  ~ {} -> {}", t.from, t.to);
    }
    if let Some(signal) = &outcome.scenario_trigger {
        if let Some(scenario) = signal.scenario_type {
            state.offered = Some(scenario);
            println!("  [scenario: {}] /accept or /decline", scenario);
        }
    }
    println!();
    state.choices = outcome.choices;
    state.message_id = outcome.message_id;
}
