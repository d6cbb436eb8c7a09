use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::commands::{BotContext, Command, CommandSet, HandlerEnv, Reply, Services};
use crate::knowledge::render_topic;
use crate::parser::ParsedInput;

/// Command that acknowledges `thanks @user` messages
pub const THANKS_COMMAND: &str = "thanks";

/// Reply sent when a handler fails
pub const FAILURE_REPLY: &str = "something went wrong";

/// Look up a clean topic: static replies first, then wiki pages.
pub fn check_wiki(services: &Services, key: &str) -> Option<String> {
    if let Some(reply) = services.knowledge.static_reply(key) {
        return Some(reply);
    }

    match services.knowledge.get_topic(key) {
        Ok(Some(topic)) => {
            debug!("Wiki hit for {}: {}", key, topic.topic);
            Some(render_topic(
                &topic,
                &services.config.bot,
                &services.config.gitter,
            ))
        }
        Ok(None) => None,
        Err(e) => {
            warn!("Knowledge lookup failed for {}: {:#}", key, e);
            None
        }
    }
}

/// Picks exactly one reply (or suppression) for a parsed message.
///
/// Branches are tried in order: help, thanks, command, echo. The first
/// applicable branch decides; a suppressed result is final.
pub struct Router {
    commands: CommandSet,
    services: Arc<Services>,
}

impl Router {
    pub fn new(commands: CommandSet, services: Arc<Services>) -> Self {
        Self { commands, services }
    }

    pub fn route(&self, input: &ParsedInput, ctx: &mut BotContext) -> Reply {
        if input.is_help_request {
            return self.check_help(input);
        }

        if input.is_thanks_request {
            if let Some(cmd) = self.commands.resolve(THANKS_COMMAND) {
                return self.dispatch(cmd, input, ctx);
            }
        }

        let keyword = input.intent_keyword.as_deref().unwrap_or(&input.keyword);
        if self.commands.is_command(keyword) {
            if let Some(cmd) = self.commands.resolve(keyword) {
                return self.dispatch(cmd, input, ctx);
            }
        }

        Reply::Text(format!("you said: {}", input.clean_text))
    }

    fn check_help(&self, input: &ParsedInput) -> Reply {
        let key = input.clean_topic.as_deref().unwrap_or_default();
        if let Some(reply) = check_wiki(&self.services, key) {
            return Reply::Text(reply);
        }
        Reply::Text(format!(
            "searching for **{}**",
            input.topic.as_deref().unwrap_or_default()
        ))
    }

    /// Run a handler; errors and panics become [`FAILURE_REPLY`]
    fn dispatch(&self, cmd: &Command, input: &ParsedInput, ctx: &mut BotContext) -> Reply {
        let env = HandlerEnv {
            services: &self.services,
            commands: &self.commands,
        };

        debug!("Dispatching command: {}", cmd.canonical_name);
        match catch_unwind(AssertUnwindSafe(|| (cmd.handler)(input, ctx, &env))) {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                error!(
                    "Command '{}' failed in {}: {:#}",
                    cmd.canonical_name,
                    input.room_name(),
                    e
                );
                Reply::text(FAILURE_REPLY)
            }
            Err(_) => {
                error!(
                    "Command '{}' panicked in {}",
                    cmd.canonical_name,
                    input.room_name()
                );
                Reply::text(FAILURE_REPLY)
            }
        }
    }
}
