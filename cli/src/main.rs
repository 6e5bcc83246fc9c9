//! Augur CLI - Command-line interface for the Augur fortune-telling runtime

use anyhow::{Context, Result};
use augur_core::agent::specialists::i18n;
use augur_core::{
    Config, Message, Runtime, SessionStore, get_config_path, get_data_dir, kinds, load_config,
    save_config,
};
use clap::{Parser, Subcommand};
use console::Style;
use std::io::Write;
use tracing::Level;
use tracing_subscriber::EnvFilter;

const AUGUR_LOGO: &str = r#"
    _
   / \  _   _  __ _ _   _ _ __
  / _ \| | | |/ _` | | | | '__|
 / ___ \ |_| | (_| | |_| | |
/_/   \_\__,_|\__, |\__,_|_|
              |___/
"#;

/// Name of the agent that fronts every conversation
const MASTER_AGENT: &str = "master_agent";

/// Sender name used for messages typed at the terminal
const CLI_SENDER: &str = "cli";

/// Augur - Multi-agent fortune teller
#[derive(Parser, Debug)]
#[command(name = "augur")]
#[command(version)]
#[command(about = "Augur - Multi-agent fortune teller", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write the default configuration
    Onboard {
        /// Overwrite an existing config without asking
        #[arg(short, long)]
        force: bool,
    },

    /// Talk to the fortune master
    Chat {
        /// Single message to send; omit for interactive mode
        #[arg(short, long)]
        message: Option<String>,
        /// Session ID to resume
        #[arg(short, long)]
        session: Option<String>,
        /// Reply language (zh or en)
        #[arg(short, long, default_value = "zh")]
        language: String,
        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Show runtime status
    Status {
        /// Print the full status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage sessions
    Session {
        #[command(subcommand)]
        session_cmd: SessionCommands,
    },
}

#[derive(Subcommand, Debug)]
enum SessionCommands {
    /// List all sessions
    List {
        /// Show detailed information
        #[arg(short, long)]
        verbose: bool,
    },

    /// Show session details
    Show {
        /// Session ID
        id: String,
    },

    /// Delete a session
    Delete {
        /// Session ID
        id: String,
        /// Confirm deletion without prompt
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Onboard { force } => {
            command_onboard(force).await?;
        }
        Commands::Chat {
            message,
            session,
            language,
            verbose,
        } => {
            command_chat(message, session, language, verbose).await?;
        }
        Commands::Status { json } => {
            command_status(json).await?;
        }
        Commands::Session { session_cmd } => {
            command_session(session_cmd).await?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::builder().parse("debug")?
    } else {
        EnvFilter::from_default_env().add_directive(Level::WARN.into())
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

/// Saved config, or the defaults when none has been written yet
async fn load_or_default() -> Result<Config> {
    if get_config_path().exists() {
        Ok(load_config().await?)
    } else {
        Ok(Config::default())
    }
}

fn confirm(question: &str) -> Result<bool> {
    print!("{} [y/N]: ", question);
    std::io::stdout().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_lowercase().starts_with('y'))
}

/// Write the default configuration
async fn command_onboard(force: bool) -> Result<()> {
    let green = Style::new().green();

    println!("{}{} AUGUR SETUP", AUGUR_LOGO, green.apply_to(">>>"));

    let config_path = get_config_path();

    if config_path.exists() && !force {
        println!("\n⚠️  Config already exists at {}", config_path.display());
        if !confirm("Overwrite it with the defaults?")? {
            println!("Cancelled.");
            return Ok(());
        }
    }

    let config = Config::default();
    save_config(&config).await?;
    println!("\n✅ Created config at {}", config_path.display());

    let sessions = config.sessions.storage_dir();
    tokio::fs::create_dir_all(&sessions)
        .await
        .with_context(|| format!("creating {}", sessions.display()))?;
    println!("✅ Session storage at {}", sessions.display());

    println!("\n{} augur is ready!", green.apply_to(">>>"));
    println!("\nNext steps:");
    println!("  1. Review the agent roster in {}", config_path.display());
    println!("  2. Chat: augur chat");

    Ok(())
}

/// Talk to the master agent
async fn command_chat(
    message: Option<String>,
    session: Option<String>,
    language: String,
    verbose: bool,
) -> Result<()> {
    init_logging(verbose)?;

    let config = load_or_default().await?;
    let runtime = Runtime::new(config);
    runtime.start().await?;

    let session_id = match session {
        Some(id) => id,
        None => runtime.sessions().create(None, &language).await,
    };

    let result = match message {
        Some(text) => {
            let reply = ask(&runtime, &session_id, &language, &text).await;
            render_reply(&reply, &language);
            Ok(())
        }
        None => chat_loop(&runtime, &session_id, &language).await,
    };

    runtime.stop().await?;
    result
}

async fn chat_loop(runtime: &Runtime, session_id: &str, language: &str) -> Result<()> {
    let dim = Style::new().dim();

    println!("{}", AUGUR_LOGO);
    println!("{}\n", dim.apply_to(format!("session {}", session_id)));

    // An empty message brings up the menu
    let reply = ask(runtime, session_id, language, "").await;
    render_reply(&reply, language);

    loop {
        print!("\n> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = tokio::task::spawn_blocking(|| console::Term::stdout().read_line()) => line??,
            _ = tokio::signal::ctrl_c() => break,
        };
        let input = line.trim();

        if input.is_empty() {
            continue;
        }
        if matches!(input.to_lowercase().as_str(), "quit" | "exit" | "q" | "退出") {
            break;
        }

        let reply = ask(runtime, session_id, language, input).await;
        render_reply(&reply, language);
    }

    println!("\n{}", i18n::text("quit_message", language));
    Ok(())
}

async fn ask(runtime: &Runtime, session_id: &str, language: &str, text: &str) -> Message {
    let request = Message::new(kinds::USER_INTERACTION, CLI_SENDER, MASTER_AGENT)
        .with_session(session_id)
        .with_language(language)
        .with_value("content", text);
    runtime.request_with_retry(request).await
}

fn render_reply(reply: &Message, language: &str) {
    let green = Style::new().green();
    let red = Style::new().red();
    let cyan = Style::new().cyan();

    if let Some(error) = reply.get_str("error") {
        println!("\n{} {}", red.apply_to("❌"), red.apply_to(error));
        return;
    }

    match reply.kind() {
        kinds::SYSTEM_MENU | kinds::INPUT_PROMPT => {
            let text = reply
                .get_str("menu")
                .or_else(|| reply.get_str("message"))
                .unwrap_or_default();
            if reply.get("error").and_then(|v| v.as_bool()) == Some(true) {
                println!("\n{}", red.apply_to(text));
            } else {
                println!("\n{}", text);
            }
        }
        kinds::FORTUNE_RESPONSE => {
            println!("\n{}", cyan.apply_to(i18n::text("result_title", language)));
            println!("{}", "=".repeat(40));
            println!("{}", reply.get_str("reading").unwrap_or_default());
        }
        kinds::CHAT_RESPONSE => {
            println!(
                "\n{}{}",
                i18n::text("fortune_master", language),
                green.apply_to(reply.get_str("response").unwrap_or_default())
            );
        }
        other => {
            let payload = serde_json::to_string_pretty(reply.payload()).unwrap_or_default();
            println!("\n[{}]\n{}", other, payload);
        }
    }
}

/// Show status
async fn command_status(json: bool) -> Result<()> {
    let green = Style::new().green();
    let red = Style::new().red();

    let config_path = get_config_path();
    let data_dir = get_data_dir();
    let config = load_or_default().await?;

    let runtime = Runtime::new(config);
    runtime.initialize().await?;
    let status = runtime.status().await;
    runtime.stop().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("{}\n{} {} Status\n", AUGUR_LOGO, status.name, status.version);

    println!(
        "Config: {} {}",
        config_path.display(),
        if config_path.exists() {
            green.apply_to("✅")
        } else {
            console::style("defaults").dim()
        }
    );
    println!("Data: {}", data_dir.display());
    println!(
        "Sessions: {} active",
        status.session_store.active_sessions
    );

    println!("\nAgents ({}):", status.agents.len());
    for (name, report) in &status.agents {
        let health = if report.health.healthy {
            green.apply_to("healthy")
        } else {
            red.apply_to("unhealthy")
        };
        println!("  {} [{}] {}", name, report.status.state, health);
    }

    println!("\nTools ({}):", status.tools.len());
    for tool in &status.tools {
        println!("  {} ({}) - {}", tool.name, tool.class, tool.description);
    }

    Ok(())
}

/// Session commands
async fn command_session(cmd: SessionCommands) -> Result<()> {
    let config = load_or_default().await?;
    let sessions = SessionStore::new(&config.sessions);
    sessions.initialize().await?;

    match cmd {
        SessionCommands::List { verbose } => {
            let session_list = sessions.list().await;

            if session_list.is_empty() {
                println!("No sessions found.");
            } else {
                println!("Sessions ({}):\n", session_list.len());

                for info in &session_list {
                    if verbose {
                        println!("  ID: {}", info.session_id);
                        println!("    Language: {}", info.language);
                        println!(
                            "    System: {}",
                            info.current_system.as_deref().unwrap_or("N/A")
                        );
                        println!("    Readings: {}", info.readings);
                        println!(
                            "    Created: {}",
                            info.created_at.format("%Y-%m-%d %H:%M:%S UTC")
                        );
                        println!(
                            "    Updated: {}",
                            info.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
                        );
                        println!();
                    } else {
                        println!(
                            "  {} ({})",
                            info.session_id,
                            info.updated_at.format("%Y-%m-%d %H:%M")
                        );
                    }
                }
            }
        }
        SessionCommands::Show { id } => match sessions.get(&id).await {
            Some(session) => {
                println!("Session: {}\n", session.session_id);
                println!(
                    "Created: {}",
                    session.created_at.format("%Y-%m-%d %H:%M:%S UTC")
                );
                println!(
                    "Updated: {}",
                    session.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
                );
                println!("Language: {}", session.language);
                println!("Readings: {}\n", session.fortune_history.len());

                for reading in &session.fortune_history {
                    println!(
                        "{} [{}]",
                        Style::new().magenta().apply_to(&reading.system),
                        reading.timestamp.format("%Y-%m-%d %H:%M:%S")
                    );
                }
                if !session.fortune_history.is_empty() {
                    println!();
                }

                for turn in &session.chat_context {
                    let role_style = match turn.role.as_str() {
                        "user" => Style::new().cyan(),
                        "assistant" => Style::new().green(),
                        _ => Style::new().dim(),
                    };

                    println!(
                        "{} [{}]",
                        role_style.apply_to(&turn.role),
                        turn.timestamp.format("%H:%M:%S")
                    );
                    println!("  {}\n", turn.content);
                }
            }
            None => {
                println!("Session not found: {}", id);
            }
        },
        SessionCommands::Delete { id, force } => {
            if !force {
                println!("Are you sure you want to delete session '{}'?", id);
                println!("This action cannot be undone.");
                if !confirm("Continue?")? {
                    println!("Cancelled.");
                    return Ok(());
                }
            }

            if sessions.delete(&id).await {
                println!("Deleted session: {}", id);
            } else {
                println!("Session not found: {}", id);
            }
        }
    }

    Ok(())
}
