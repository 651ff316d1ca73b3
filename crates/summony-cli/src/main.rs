mod commands;
mod configuration;

use anyhow::{anyhow, Result};
use bat::PrettyPrinter;
use clap::Parser;
use cliclack::{input, spinner};
use console::style;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use commands::Command;
use configuration::Settings;
use summony::dispatch::{Conversation, RoundReport, RoundUpdate};
use summony::logger::{JsonFileLogger, ModelCallLogger, NullLogger};
use summony::params::Params;
use summony::providers::factory::provider_for_kind;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Model to talk to; repeat for several agents
    #[arg(short, long = "model")]
    models: Vec<String>,

    /// System prompt given to every agent
    #[arg(short, long)]
    system: Option<String>,

    /// Config file (defaults to summony/config.toml in the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for per-agent model call logs
    #[arg(long)]
    logs_dir: Option<PathBuf>,

    /// Resume a saved conversation
    #[arg(long)]
    load: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut settings = Settings::load(cli.config.as_deref())?;
    if !cli.models.is_empty() {
        settings.models = cli.models;
    }
    if cli.system.is_some() {
        settings.system_prompt = cli.system;
    }
    if cli.logs_dir.is_some() {
        settings.logs_dir = cli.logs_dir;
    }

    let logs_dir = settings.logs_dir.clone();
    let mut conversation = match &cli.load {
        Some(path) => load(path, logs_dir.as_deref())?,
        None => Conversation::from_models(
            &settings.models,
            settings.system_prompt.as_deref(),
            &settings.params,
            |name| logger_for(logs_dir.as_deref(), name),
        )?,
    };

    print_agents(&conversation);
    println!(
        "{}",
        style("- type /exit to end the session, /alt to re-ask").dim()
    );
    println!();

    let mut prefill: Option<String> = None;
    loop {
        let line: String = input("Message:").placeholder("").multiline().interact()?;

        let command = match Command::parse(&line) {
            Ok(command) => command,
            Err(err) => {
                println!("{}", style(err).yellow());
                continue;
            }
        };

        let outcome = match command {
            Command::Exit => break,
            Command::Prompt(prompt) => {
                let prefill = prefill.take();
                round(&mut conversation, Some(&prompt), prefill.as_deref()).await
            }
            Command::Alt => round(&mut conversation, None, None).await,
            Command::Prefill(text) => {
                println!("{}", style("Next replies will start with your prefill").dim());
                prefill = Some(text);
                Ok(())
            }
            Command::Select { agent, alt } => conversation
                .select_alternate(agent, alt)
                .map_err(anyhow::Error::from)
                .and_then(|()| {
                    let agent = conversation.agent(agent)?;
                    render(agent.last_text().unwrap_or_default())
                }),
            Command::Active(indices) => conversation
                .set_active(&indices)
                .map(|()| print_agents(&conversation))
                .map_err(anyhow::Error::from),
            Command::Set { key, value } => {
                conversation.set_param(&key, value);
                Ok(())
            }
            Command::Save(path) => conversation.save(&path).map(|()| {
                println!("{}", style(format!("Saved to {}", path.display())).dim());
            }),
            Command::Load(path) => load(&path, logs_dir.as_deref()).map(|loaded| {
                conversation = loaded;
                print_agents(&conversation);
            }),
        };

        if let Err(err) = outcome {
            println!("{}", style(format!("{:#}", err)).red());
        }
        println!();
    }
    Ok(())
}

async fn round(
    conversation: &mut Conversation,
    prompt: Option<&str>,
    prefill: Option<&str>,
) -> Result<()> {
    let spin = spinner();
    spin.start("awaiting replies");

    let names: Vec<String> = conversation
        .agents()
        .iter()
        .map(|agent| agent.name().to_string())
        .collect();
    let result = conversation
        .dispatch(prompt, prefill, None, &Params::new(), |update| {
            spin.set_message(progress(&names, &update));
        })
        .await;

    match result {
        Ok(report) => {
            spin.stop("");
            show_report(&report)
        }
        Err(err) => {
            spin.error(err.to_string());
            Err(err.into())
        }
    }
}

fn progress(names: &[String], update: &RoundUpdate<'_>) -> String {
    update
        .texts
        .iter()
        .map(|(agent, text)| {
            let name = names.get(*agent).map(String::as_str).unwrap_or("?");
            format!("{}: {} chars", name, text.chars().count())
        })
        .collect::<Vec<_>>()
        .join(" | ")
}

fn show_report(report: &RoundReport) -> Result<()> {
    for outcome in &report.outcomes {
        println!(
            "{}",
            style(format!("[{}] {}", outcome.agent, outcome.name)).bold()
        );
        if !outcome.text.is_empty() {
            render(&outcome.text)?;
        }
        if let Some(err) = &outcome.error {
            println!("{}", style(err).red());
        }
        println!();
    }
    Ok(())
}

fn print_agents(conversation: &Conversation) {
    let active = conversation.active_agents();
    for (index, agent) in conversation.agents().iter().enumerate() {
        let marker = if active.contains(&index) { "*" } else { " " };
        println!(
            "{} {}",
            marker,
            style(format!("[{}] {} ({})", index, agent.name(), agent.model())).dim()
        );
    }
}

fn load(path: &Path, logs_dir: Option<&Path>) -> Result<Conversation> {
    Conversation::load(
        path,
        |kind, _| provider_for_kind(kind),
        |name| logger_for(logs_dir, name),
    )
}

fn logger_for(logs_dir: Option<&Path>, name: &str) -> Arc<dyn ModelCallLogger> {
    match logs_dir {
        Some(dir) => Arc::new(JsonFileLogger::new(dir, name)),
        None => Arc::new(NullLogger),
    }
}

fn render(content: &str) -> Result<()> {
    PrettyPrinter::new()
        .input_from_bytes(content.as_bytes())
        .language("markdown")
        .print()
        .map_err(|err| anyhow!("Failed to render reply: {}", err))?;
    Ok(())
}
