pub mod builtin;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::config::Config;
use crate::knowledge::KnowledgeBase;
use crate::parser::ParsedInput;
use crate::session::Announcement;

/// Outcome of routing one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Text(String),
    /// Deliberately send nothing
    Suppressed,
}

impl Reply {
    pub fn text(s: impl Into<String>) -> Self {
        Reply::Text(s.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Private,
}

/// What a multi-turn command is waiting for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InteractionState {
    /// `find` listed topics; `show <n>` picks one
    Finding,
}

/// Short-lived state shared by handlers across messages.
///
/// A single slot for the whole process: it is not keyed by sender or room,
/// so interleaved conversations overwrite each other's continuation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BotContext {
    pub last_interaction_state: Option<InteractionState>,
    pub pending_command_list: Option<Vec<String>>,
}

impl BotContext {
    pub fn clear(&mut self) {
        self.last_interaction_state = None;
        self.pending_command_list = None;
    }
}

/// Collaborators handlers may consult
pub struct Services {
    pub config: Config,
    pub knowledge: Arc<dyn KnowledgeBase>,
    /// Wakes the room scanner for an immediate reconciliation
    pub rescan: Arc<Notify>,
    /// Queue drained by the session manager, which posts each announcement
    pub announcements: UnboundedSender<Announcement>,
}

/// Everything a handler sees besides the input and the context
pub struct HandlerEnv<'a> {
    pub services: &'a Services,
    pub commands: &'a CommandSet,
}

pub type Handler =
    Arc<dyn Fn(&ParsedInput, &mut BotContext, &HandlerEnv<'_>) -> Result<Reply> + Send + Sync>;

pub struct Command {
    pub canonical_name: String,
    /// Aliases in the order they were added
    pub aliases: Vec<String>,
    pub handler: Handler,
    pub visibility: Visibility,
}

/// Named handlers plus aliases, filled at startup
#[derive(Default)]
pub struct CommandRegistry {
    commands: Vec<Command>,
    aliases: HashMap<String, String>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Registering an existing name replaces its handler.
    pub fn register<F>(&mut self, name: &str, visibility: Visibility, handler: F)
    where
        F: Fn(&ParsedInput, &mut BotContext, &HandlerEnv<'_>) -> Result<Reply> + Send + Sync + 'static,
    {
        let name = name.to_lowercase();
        let handler: Handler = Arc::new(handler);

        // a canonical name always shadows an alias of the same spelling
        if let Some(target) = self.aliases.remove(&name) {
            if let Some(cmd) = self.commands.iter_mut().find(|c| c.canonical_name == target) {
                cmd.aliases.retain(|a| *a != name);
            }
        }

        if let Some(existing) = self.commands.iter_mut().find(|c| c.canonical_name == name) {
            debug!("Replacing handler for command: {}", name);
            existing.handler = handler;
            existing.visibility = visibility;
            return;
        }

        debug!("Registered command: {}", name);
        self.commands.push(Command {
            canonical_name: name,
            aliases: Vec::new(),
            handler,
            visibility,
        });
    }

    /// Make `alias` resolve to the same handler as `canonical`
    pub fn alias(&mut self, alias: &str, canonical: &str) -> Result<()> {
        let alias = alias.to_lowercase();
        let canonical = canonical.to_lowercase();

        if self.position(&alias).is_some() {
            anyhow::bail!("Cannot alias '{}': it is already a command", alias);
        }

        // aliasing an alias points at its canonical command
        let target = self.aliases.get(&canonical).cloned().unwrap_or(canonical);
        let index = self
            .position(&target)
            .ok_or_else(|| anyhow::anyhow!("Cannot alias '{}' to unknown command '{}'", alias, target))?;

        if let Some(previous) = self.aliases.insert(alias.clone(), target.clone()) {
            if let Some(i) = self.position(&previous) {
                self.commands[i].aliases.retain(|a| *a != alias);
            }
        }
        self.commands[index].aliases.push(alias);
        Ok(())
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.commands.iter().position(|c| c.canonical_name == name)
    }

    /// Canonical names first, then aliases
    pub fn resolve(&self, keyword: &str) -> Option<&Command> {
        let keyword = keyword.to_lowercase();
        if let Some(i) = self.position(&keyword) {
            return Some(&self.commands[i]);
        }
        let target = self.aliases.get(&keyword)?;
        self.position(target).map(|i| &self.commands[i])
    }

    /// Names of public commands, each followed by its aliases
    pub fn list_public(&self) -> Vec<String> {
        self.commands
            .iter()
            .filter(|c| c.visibility == Visibility::Public)
            .flat_map(|c| std::iter::once(c.canonical_name.clone()).chain(c.aliases.iter().cloned()))
            .collect()
    }

    /// Every registered name, private ones included
    fn all_names(&self) -> Vec<String> {
        self.commands
            .iter()
            .flat_map(|c| std::iter::once(c.canonical_name.clone()).chain(c.aliases.iter().cloned()))
            .collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Finish registration and take the name snapshot
    pub fn freeze(self) -> CommandSet {
        let cmd_list = self.all_names();
        info!(
            "Command set frozen with {} names ({} public)",
            cmd_list.len(),
            self.list_public().len()
        );
        CommandSet {
            registry: self,
            cmd_list,
        }
    }
}

/// Registry after startup: no more registration, names fixed
pub struct CommandSet {
    registry: CommandRegistry,
    cmd_list: Vec<String>,
}

impl CommandSet {
    pub fn resolve(&self, keyword: &str) -> Option<&Command> {
        self.registry.resolve(keyword)
    }

    /// Public names from the frozen snapshot, in registration order
    pub fn list_public(&self) -> Vec<String> {
        self.cmd_list
            .iter()
            .filter(|name| {
                self.resolve(name)
                    .is_some_and(|c| c.visibility == Visibility::Public)
            })
            .cloned()
            .collect()
    }

    #[cfg(test)]
    pub fn cmd_list(&self) -> &[String] {
        &self.cmd_list
    }

    pub fn is_command(&self, keyword: &str) -> bool {
        let keyword = keyword.to_lowercase();
        self.cmd_list.iter().any(|c| *c == keyword)
    }
}
