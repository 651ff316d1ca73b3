use anyhow::{anyhow, bail, Result};
use serde_json::Value;
use std::path::PathBuf;

/// One line of input at the prompt
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Plain text sent to every active agent
    Prompt(String),
    /// Re-ask the active agents for another reply to their last prompt
    Alt,
    /// Seed the replies to the next prompt
    Prefill(String),
    Select { agent: usize, alt: usize },
    Active(Vec<usize>),
    Set { key: String, value: Value },
    Save(PathBuf),
    Load(PathBuf),
    Exit,
}

impl Command {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let Some(rest) = line.strip_prefix('/') else {
            if line.is_empty() {
                bail!("Nothing to send");
            }
            return Ok(Command::Prompt(line.to_string()));
        };

        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };

        match name {
            "alt" => Ok(Command::Alt),
            "exit" | "quit" => Ok(Command::Exit),
            "prefill" => {
                if arg.is_empty() {
                    bail!("Usage: /prefill TEXT");
                }
                Ok(Command::Prefill(arg.to_string()))
            }
            "select" => {
                let mut parts = arg.split_whitespace();
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(agent), Some(alt), None) => Ok(Command::Select {
                        agent: parse_index(agent)?,
                        alt: parse_index(alt)?,
                    }),
                    _ => bail!("Usage: /select AGENT ALT"),
                }
            }
            "active" => {
                if arg.is_empty() {
                    bail!("Usage: /active I,J,...");
                }
                let indices = arg
                    .split(',')
                    .map(|part| parse_index(part.trim()))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Command::Active(indices))
            }
            "set" => {
                let (key, value) = arg
                    .split_once('=')
                    .ok_or_else(|| anyhow!("Usage: /set KEY=VALUE"))?;
                let key = key.trim();
                if key.is_empty() {
                    bail!("Usage: /set KEY=VALUE");
                }
                Ok(Command::Set {
                    key: key.to_string(),
                    value: parse_value(value.trim()),
                })
            }
            "save" | "load" => {
                if arg.is_empty() {
                    bail!("Usage: /{} FILE", name);
                }
                let path = PathBuf::from(arg);
                Ok(if name == "save" {
                    Command::Save(path)
                } else {
                    Command::Load(path)
                })
            }
            other => bail!("Unknown command /{}", other),
        }
    }
}

fn parse_index(s: &str) -> Result<usize> {
    s.parse()
        .map_err(|_| anyhow!("Expected an index, got {:?}", s))
}

// JSON when it parses, a plain string otherwise
fn parse_value(s: &str) -> Value {
    serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.to_string()))
}
