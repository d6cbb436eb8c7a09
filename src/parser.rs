//! Turns raw chat text into a [`ParsedInput`].
//!
//! Classification is table-driven: [`PATTERNS`] is tried in order and the
//! first pattern that matches decides the intent. Text no pattern claims is
//! left as a literal command candidate (first token + params).

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::debug;

use crate::platform::InboundMessage;

/// Structured form of one inbound message
#[derive(Debug, Clone)]
pub struct ParsedInput {
    pub raw_text: String,
    /// Text with markup and the leading bot mention removed
    pub clean_text: String,
    /// First token of `clean_text`, lowercased
    pub keyword: String,
    pub topic: Option<String>,
    /// `topic` lowercased and hyphenated; the knowledge base key
    pub clean_topic: Option<String>,
    pub intent_keyword: Option<String>,
    pub is_help_request: bool,
    pub is_thanks_request: bool,
    /// Remainder after the first token. `None` for a bare command,
    /// `Some("")` when only whitespace followed it.
    pub params: Option<String>,
    /// Users mentioned with `@name`, in order of first appearance
    pub mentions: Vec<String>,
    pub message: InboundMessage,
}

impl ParsedInput {
    /// True when the command was followed by actual text
    pub fn has_params(&self) -> bool {
        self.params.as_deref().is_some_and(|p| !p.is_empty())
    }

    pub fn params_str(&self) -> &str {
        self.params.as_deref().unwrap_or("")
    }

    pub fn sender(&self) -> &str {
        &self.message.sender_name
    }

    pub fn room_name(&self) -> &str {
        &self.message.room_name
    }
}

/// Lowercase a topic and collapse whitespace runs into single hyphens
pub fn clean_topic(topic: &str) -> String {
    topic
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase()
}

struct Pattern {
    name: &'static str,
    regex: Regex,
    apply: fn(&Captures, &mut ParsedInput),
}

static PATTERNS: Lazy<Vec<Pattern>> = Lazy::new(|| {
    vec![
        Pattern {
            name: "help",
            regex: Regex::new(r"(?i)^(help|wiki|check|hint|tip)[ \t]+([^\n]*\S)").unwrap(),
            apply: |caps, input| {
                let topic = caps[2].trim().to_string();
                input.is_help_request = true;
                input.intent_keyword = Some(caps[1].to_lowercase());
                input.clean_topic = Some(clean_topic(&topic));
                input.params = Some(topic.clone());
                input.topic = Some(topic);
            },
        },
        Pattern {
            name: "thanks",
            regex: Regex::new(r"(?i)\b(thanks|thank you|ty)\s+@([\w-]+)").unwrap(),
            apply: |_caps, input| {
                input.is_thanks_request = true;
                input.intent_keyword = Some("thanks".to_string());
            },
        },
    ]
});

static MARKUP_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]*>").unwrap());

static DECORATION: Lazy<Regex> = Lazy::new(|| Regex::new(r"[*`~]").unwrap());

/// `@name` at the start or after a non-word character, so `a@b.com` is not a mention
static MENTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:^|[^\w@])@([\w-]+)").unwrap());

pub struct InputParser {
    /// Matches a leading `@botname` (with optional `:` or `,`) addressed to us
    self_mention: Regex,
}

impl InputParser {
    pub fn new(bot_name: &str) -> Result<Self> {
        let pattern = format!(r"(?i)^\s*@{}\b[:,]?\s*", regex::escape(bot_name));
        let self_mention = Regex::new(&pattern)
            .with_context(|| format!("Invalid bot name for mention matching: {}", bot_name))?;
        Ok(Self { self_mention })
    }

    fn sanitize(&self, text: &str) -> String {
        let text = MARKUP_TAGS.replace_all(text, "");
        let text = DECORATION.replace_all(&text, "");
        let text = self.self_mention.replace(&text, "");
        text.trim_start().to_string()
    }

    pub fn parse(&self, message: &InboundMessage) -> ParsedInput {
        let sanitized = self.sanitize(&message.text);

        let (first, params) = match sanitized.split_once(char::is_whitespace) {
            Some((first, rest)) => (first, Some(rest.trim().to_string())),
            None => (sanitized.as_str(), None),
        };

        let clean_text = sanitized.trim_end().to_string();

        let mut mentions: Vec<String> = Vec::new();
        for caps in MENTION.captures_iter(&clean_text) {
            let name = caps[1].to_string();
            if !mentions.contains(&name) {
                mentions.push(name);
            }
        }

        let mut input = ParsedInput {
            raw_text: message.text.clone(),
            keyword: first.to_lowercase(),
            clean_text,
            topic: None,
            clean_topic: None,
            intent_keyword: None,
            is_help_request: false,
            is_thanks_request: false,
            params,
            mentions,
            message: message.clone(),
        };

        let text = input.clean_text.clone();
        for pattern in PATTERNS.iter() {
            if let Some(caps) = pattern.regex.captures(&text) {
                debug!("Input matched {} pattern", pattern.name);
                (pattern.apply)(&caps, &mut input);
                break;
            }
        }

        input
    }
}
