use serde::{Deserialize, Serialize};

use super::message::{ChatMessage, Message};
use super::role::Role;
use crate::errors::{AgentError, AgentResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
/// One position in a timeline
pub enum Turn {
    Single(Message),
    /// Alternate replies to the same preceding context, in the order they were generated
    Branch(Vec<Message>),
}

impl Turn {
    /// The message that represents this turn when building context:
    /// the chosen branch member if any, otherwise the last one
    pub fn resolved(&self) -> &Message {
        match self {
            Turn::Single(message) => message,
            Turn::Branch(members) => members
                .iter()
                .find(|m| m.is_chosen())
                .or_else(|| members.last())
                .expect("branch turns are never empty"),
        }
    }

    pub fn role(&self) -> Role {
        self.resolved().role
    }

    pub fn members(&self) -> &[Message] {
        match self {
            Turn::Single(message) => std::slice::from_ref(message),
            Turn::Branch(members) => members,
        }
    }

    pub fn is_branch(&self) -> bool {
        matches!(self, Turn::Branch(_))
    }

    pub fn chosen_index(&self) -> Option<usize> {
        match self {
            Turn::Single(_) => None,
            Turn::Branch(members) => members.iter().position(|m| m.is_chosen()),
        }
    }

    /// Append an alternate, turning a single message into a branch first
    fn push_alternate(&mut self, message: Message) -> usize {
        if let Turn::Single(existing) = self {
            let existing = existing.clone();
            *self = Turn::Branch(vec![existing]);
        }
        match self {
            Turn::Branch(members) => {
                members.push(message);
                members.len() - 1
            }
            Turn::Single(_) => unreachable!(),
        }
    }
}

/// Address of one message inside a timeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub turn: usize,
    pub member: Option<usize>,
}

/// Ordered sequence of turns owned by one agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Turn>", into = "Vec<Turn>")]
pub struct Timeline {
    turns: Vec<Turn>,
}

impl TryFrom<Vec<Turn>> for Timeline {
    type Error = AgentError;

    fn try_from(turns: Vec<Turn>) -> AgentResult<Self> {
        Timeline::from_turns(turns)
    }
}

impl From<Timeline> for Vec<Turn> {
    fn from(timeline: Timeline) -> Self {
        timeline.turns
    }
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_turns(turns: Vec<Turn>) -> AgentResult<Self> {
        if turns.iter().any(|t| matches!(t, Turn::Branch(m) if m.is_empty())) {
            return Err(AgentError::MalformedSnapshot("empty branch turn".to_string()));
        }
        Ok(Self { turns })
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn push(&mut self, message: Message) -> Slot {
        self.turns.push(Turn::Single(message));
        Slot {
            turn: self.turns.len() - 1,
            member: None,
        }
    }

    /// Drop every turn from `len` on
    pub fn truncate(&mut self, len: usize) {
        self.turns.truncate(len);
    }

    /// Replace the leading system turn, or insert one
    pub fn set_system_prompt<S: Into<String>>(&mut self, content: S) {
        let message = Turn::Single(Message::system(content));
        match self.turns.first() {
            Some(turn) if turn.role() == Role::System => self.turns[0] = message,
            _ => self.turns.insert(0, message),
        }
    }

    /// Add `message` as another alternate of the last turn
    pub fn push_alternate(&mut self, message: Message) -> AgentResult<Slot> {
        let turn = self.turns.len().checked_sub(1).ok_or_else(|| {
            AgentError::NothingToReask("the timeline is empty".to_string())
        })?;
        let member = self.turns[turn].push_alternate(message);
        Ok(Slot {
            turn,
            member: Some(member),
        })
    }

    pub fn get_mut(&mut self, slot: Slot) -> Option<&mut Message> {
        match (self.turns.get_mut(slot.turn)?, slot.member) {
            (Turn::Single(message), None) => Some(message),
            (Turn::Branch(members), Some(member)) => members.get_mut(member),
            _ => None,
        }
    }

    pub fn get(&self, slot: Slot) -> Option<&Message> {
        match (self.turns.get(slot.turn)?, slot.member) {
            (Turn::Single(message), None) => Some(message),
            (Turn::Branch(members), Some(member)) => members.get(member),
            _ => None,
        }
    }

    /// Mark one branch member as chosen, clearing the flag on its siblings
    pub fn select(&mut self, turn: usize, member: usize) -> AgentResult<()> {
        match self.turns.get_mut(turn) {
            Some(Turn::Branch(members)) if member < members.len() => {
                for (i, m) in members.iter_mut().enumerate() {
                    m.chosen = Some(i == member);
                }
                Ok(())
            }
            Some(Turn::Branch(members)) => Err(AgentError::InvalidAlternate(format!(
                "turn {} has {} alternates, got index {}",
                turn,
                members.len(),
                member
            ))),
            Some(Turn::Single(_)) => Err(AgentError::InvalidAlternate(format!(
                "turn {} has no alternates",
                turn
            ))),
            None => Err(AgentError::InvalidAlternate(format!(
                "turn {} does not exist",
                turn
            ))),
        }
    }

    /// Flatten the first `upto` turns into the context sent to a provider
    pub fn context(&self, upto: usize) -> Vec<ChatMessage> {
        self.turns
            .iter()
            .take(upto)
            .map(|turn| turn.resolved().to_chat())
            .collect()
    }

    /// Count of assistant messages, alternates included
    pub fn assistant_messages(&self) -> usize {
        self.turns
            .iter()
            .flat_map(|t| t.members())
            .filter(|m| m.role == Role::Assistant)
            .count()
    }
}
