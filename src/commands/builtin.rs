//! Commands the bot ships with.

use anyhow::Result;
use chrono::{Duration, NaiveDate, Utc};

use super::{BotContext, CommandRegistry, HandlerEnv, InteractionState, Reply, Visibility};
use crate::parser::{clean_topic, ParsedInput};
use crate::router::{check_wiki, THANKS_COMMAND};
use crate::session::Announcement;

/// How many topics the `topics` listing shows
const TOPIC_LIST_LIMIT: usize = 10;

/// Build a registry holding every built-in command and alias
pub fn builtin_registry() -> Result<CommandRegistry> {
    let mut registry = CommandRegistry::new();

    registry.register("help", Visibility::Public, help);
    registry.register("menu", Visibility::Public, menu);
    registry.register("commands", Visibility::Public, commands);
    registry.register("rooms", Visibility::Public, rooms);
    registry.register("topics", Visibility::Public, topics);
    registry.register("find", Visibility::Public, find);
    registry.register("show", Visibility::Public, show);
    registry.register("search", Visibility::Public, search);
    registry.register("wiki", Visibility::Public, wiki);
    registry.register("archive", Visibility::Public, archive);
    registry.register("welcome", Visibility::Public, welcome);
    registry.register("about", Visibility::Public, about);
    registry.register(THANKS_COMMAND, Visibility::Public, thanks);
    registry.register("version", Visibility::Public, version);
    registry.register("botstatus", Visibility::Public, botstatus);
    registry.register("botenv", Visibility::Private, botenv);
    registry.register("rejoin", Visibility::Private, rejoin);
    registry.register("rollem", Visibility::Private, rollem);
    registry.register("announce", Visibility::Private, announce);

    registry.alias("explain", "wiki")?;
    registry.alias("bot", "wiki")?;
    registry.alias("hello", "welcome")?;
    registry.alias("hi", "welcome")?;
    registry.alias("index", "topics")?;
    registry.alias("log", "archive")?;
    registry.alias("archives", "archive")?;

    Ok(registry)
}

/// Help and thanks stay silent in rooms configured as quiet
fn too_noisy(input: &ParsedInput, env: &HandlerEnv<'_>) -> bool {
    env.services.config.bot.is_quiet_room(input.room_name())
}

fn wiki_link(env: &HandlerEnv<'_>, name: &str) -> String {
    format!("[{}]({}{})", name, env.services.config.bot.wiki_url, name)
}

fn version_line(env: &HandlerEnv<'_>) -> String {
    format!("botVersion: {}", env.services.config.bot.version)
}

fn version(_input: &ParsedInput, _ctx: &mut BotContext, env: &HandlerEnv<'_>) -> Result<Reply> {
    Ok(Reply::Text(version_line(env)))
}

fn botenv(_input: &ParsedInput, _ctx: &mut BotContext, env: &HandlerEnv<'_>) -> Result<Reply> {
    Ok(Reply::Text(format!("env: {}", env.services.config.bot.env)))
}

fn botstatus(input: &ParsedInput, _ctx: &mut BotContext, env: &HandlerEnv<'_>) -> Result<Reply> {
    // "botstatus something" is usually just chat
    if input.has_params() {
        return Ok(Reply::Suppressed);
    }
    let mut msg = String::from("All bot systems are go!  \n");
    msg.push_str(&version_line(env));
    msg.push('\n');
    msg.push_str(&format!("env: {}", env.services.config.bot.env));
    Ok(Reply::Text(msg))
}

fn help(input: &ParsedInput, ctx: &mut BotContext, env: &HandlerEnv<'_>) -> Result<Reply> {
    if too_noisy(input, env) {
        return Ok(Reply::Suppressed);
    }
    if input.has_params() {
        return wiki(input, ctx, env);
    }

    let help_topic = &env.services.config.bot.help_topic;
    if let Some(topic) = env.services.knowledge.get_topic(help_topic)? {
        return Ok(Reply::Text(topic.data));
    }
    Ok(Reply::text(
        "try `help <topic>`, `find <prefix>` or `commands` for a list of things the bot can do",
    ))
}

fn menu(_input: &ParsedInput, _ctx: &mut BotContext, _env: &HandlerEnv<'_>) -> Result<Reply> {
    Ok(Reply::text("type help for a list of things the bot can do"))
}

fn commands(_input: &ParsedInput, _ctx: &mut BotContext, env: &HandlerEnv<'_>) -> Result<Reply> {
    let mut msg = String::from("## commands:\n- ");
    msg.push_str(&env.commands.list_public().join("\n- "));
    Ok(Reply::Text(msg))
}

/// Room directory listing; private rooms keep their slot as `----`
fn rooms(_input: &ParsedInput, _ctx: &mut BotContext, env: &HandlerEnv<'_>) -> Result<Reply> {
    let config = &env.services.config;
    let host = &config.gitter.host;
    let community = &config.bot.community;

    let mut msg = String::from("## rooms\n");
    if !community.is_empty() {
        msg.push_str(&format!(
            "See all the {} rooms at [{}{}]({}{})\n",
            community,
            host.trim_start_matches("https://"),
            community,
            host,
            community
        ));
    }

    let entries: Vec<String> = config
        .rooms
        .iter()
        .map(|room| {
            if room.private {
                "----".to_string()
            } else {
                let icon = room.icon.as_deref().unwrap_or("speech_balloon");
                format!("\n :{}: [{}]({}{})", icon, room.name, host, room.name)
            }
        })
        .collect();
    msg.push_str(&entries.join(" "));
    Ok(Reply::Text(msg))
}

fn topics(_input: &ParsedInput, _ctx: &mut BotContext, env: &HandlerEnv<'_>) -> Result<Reply> {
    let names = env.services.knowledge.topic_names()?;
    let list: Vec<String> = names
        .iter()
        .take(TOPIC_LIST_LIMIT)
        .map(|name| wiki_link(env, name))
        .collect();
    Ok(Reply::Text(format!("## topics\n{}", list.join("\n"))))
}

/// List topics by prefix and remember them for a follow-up `show <n>`
fn find(input: &ParsedInput, ctx: &mut BotContext, env: &HandlerEnv<'_>) -> Result<Reply> {
    if !input.has_params() {
        return Ok(Reply::text("usage: `find <prefix>`"));
    }
    let prefix = input.params_str();
    let found = env.services.knowledge.find_topics(prefix)?;

    let mut msg = format!("find **{}**\n", prefix);
    if found.is_empty() {
        msg.push_str("no matching topics");
        ctx.clear();
        return Ok(Reply::Text(msg));
    }

    for (i, key) in found.iter().enumerate() {
        msg.push_str(&format!("\n{}. `{}`", i + 1, key));
    }
    msg.push_str("\n\ntype `show <number>` to read one");

    ctx.last_interaction_state = Some(InteractionState::Finding);
    ctx.pending_command_list = Some(found);
    Ok(Reply::Text(msg))
}

fn show(input: &ParsedInput, ctx: &mut BotContext, env: &HandlerEnv<'_>) -> Result<Reply> {
    let pending = match (&ctx.last_interaction_state, &ctx.pending_command_list) {
        (Some(InteractionState::Finding), Some(list)) => list.clone(),
        _ => return Ok(Reply::text("nothing to show, try `find <prefix>` first")),
    };

    let picked = input
        .params_str()
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|i| pending.get(i));

    let Some(key) = picked else {
        return Ok(Reply::Text(format!(
            "pick a number between 1 and {}",
            pending.len()
        )));
    };

    let reply = check_wiki(env.services, key)
        .unwrap_or_else(|| format!("no wiki entry for **{}**", key));
    ctx.clear();
    Ok(Reply::Text(reply))
}

fn search(input: &ParsedInput, _ctx: &mut BotContext, env: &HandlerEnv<'_>) -> Result<Reply> {
    if !input.has_params() {
        return Ok(Reply::text("usage: `search <text>`"));
    }
    let query = input.params_str();
    let found = env.services.knowledge.search(query)?;

    let mut msg = format!("searching for **{}**\n", query);
    if found.is_empty() {
        msg.push_str("no results");
    } else {
        let links: Vec<String> = found.iter().map(|k| format!("- {}", wiki_link(env, k))).collect();
        msg.push_str(&links.join("\n"));
    }
    Ok(Reply::Text(msg))
}

fn wiki(input: &ParsedInput, _ctx: &mut BotContext, env: &HandlerEnv<'_>) -> Result<Reply> {
    if !input.has_params() {
        return Ok(Reply::text("usage: `wiki <topic>`"));
    }
    let key = clean_topic(input.params_str());
    let reply = check_wiki(env.services, &key)
        .unwrap_or_else(|| format!("no wiki entry for **{}**", input.params_str()));
    Ok(Reply::Text(reply))
}

/// Archive dates are `YYYY/MM/DD` path segments
fn archive_links(host: &str, room_name: &str, yesterday: NaiveDate) -> String {
    let short_name = room_name.rsplit('/').next().unwrap_or(room_name);
    let room_uri = format!("{}{}/archives/", host, room_name);

    let mut msg = format!("Archives for **{}**\n", short_name);
    msg.push_str(&format!("\n- [All Time]({}all)", room_uri));
    msg.push_str(&format!(
        "\n- [Yesterday]({}{})",
        room_uri,
        yesterday.format("%Y/%m/%d")
    ));
    msg
}

fn archive(input: &ParsedInput, _ctx: &mut BotContext, env: &HandlerEnv<'_>) -> Result<Reply> {
    let yesterday = (Utc::now() - Duration::days(1)).date_naive();
    Ok(Reply::Text(archive_links(
        &env.services.config.gitter.host,
        input.room_name(),
        yesterday,
    )))
}

fn welcome(input: &ParsedInput, _ctx: &mut BotContext, env: &HandlerEnv<'_>) -> Result<Reply> {
    if input.params_str().to_lowercase().contains("world") {
        let community = &env.services.config.bot.community;
        return Ok(Reply::Text(format!(
            "## welcome to {} @{}!",
            community,
            input.sender()
        )));
    }
    Ok(Reply::Suppressed)
}

fn about(input: &ParsedInput, _ctx: &mut BotContext, env: &HandlerEnv<'_>) -> Result<Reply> {
    let Some(user) = input.mentions.first() else {
        return Ok(Reply::text("usage: `about @user`"));
    };
    let host = &env.services.config.gitter.host;
    Ok(Reply::Text(format!(
        "## about @{}\n- [profile]({}{})",
        user, host, user
    )))
}

/// Acknowledge everyone mentioned except the sender and the bot itself
fn thanks(input: &ParsedInput, _ctx: &mut BotContext, env: &HandlerEnv<'_>) -> Result<Reply> {
    if too_noisy(input, env) {
        return Ok(Reply::Suppressed);
    }
    let bot_name = &env.services.config.bot.name;
    let recipients: Vec<String> = input
        .mentions
        .iter()
        .filter(|m| !m.eq_ignore_ascii_case(input.sender()) && !m.eq_ignore_ascii_case(bot_name))
        .map(|m| format!("@{}", m))
        .collect();

    if recipients.is_empty() {
        return Ok(Reply::Suppressed);
    }
    Ok(Reply::Text(format!(
        "@{} sends thanks to {} :sparkles: :thumbsup: :sparkles:",
        input.sender(),
        recipients.join(" ")
    )))
}

fn rejoin(_input: &ParsedInput, _ctx: &mut BotContext, env: &HandlerEnv<'_>) -> Result<Reply> {
    env.services.rescan.notify_one();
    Ok(Reply::text("rescanning rooms"))
}

/// `announce <room> [@who] [topic]`: queue an announcement for a configured room
fn announce(input: &ParsedInput, _ctx: &mut BotContext, env: &HandlerEnv<'_>) -> Result<Reply> {
    const USAGE: &str = "usage: `announce <room> [@who] [topic]`";

    let mut words = input.params_str().split_whitespace();
    let Some(room_name) = words.next() else {
        return Ok(Reply::text(USAGE));
    };
    let Some(room) = env
        .services
        .config
        .rooms
        .iter()
        .find(|r| r.name.eq_ignore_ascii_case(room_name))
    else {
        return Ok(Reply::Text(format!("no configured room named **{}**", room_name)));
    };

    let mut rest: Vec<&str> = words.collect();
    let who = match rest.first() {
        Some(first) if first.starts_with('@') && first.len() > 1 => {
            let who = first.trim_start_matches('@').to_string();
            rest.remove(0);
            Some(who)
        }
        _ => None,
    };
    let topic = (!rest.is_empty()).then(|| rest.join(" "));
    if who.is_none() && topic.is_none() {
        return Ok(Reply::text(USAGE));
    }

    env.services
        .announcements
        .send(Announcement {
            room: room.clone(),
            who,
            topic,
        })
        .map_err(|_| anyhow::anyhow!("announcement queue closed"))?;
    Ok(Reply::Text(format!("announcing in **{}**", room.name)))
}

fn rollem(input: &ParsedInput, _ctx: &mut BotContext, _env: &HandlerEnv<'_>) -> Result<Reply> {
    Ok(Reply::Text(format!(
        "@{} says enjoy! https://www.youtube.com/watch?v=dQw4w9WgXcQ",
        input.sender()
    )))
}
