pub mod loader;

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

use crate::config::{BotConfig, GitterConfig};

/// A wiki topic: display name plus markdown body
#[derive(Debug, Clone, PartialEq)]
pub struct Topic {
    pub topic: String,
    pub data: String,
}

impl Topic {
    /// Display name with whitespace runs joined by hyphens, safe for URLs
    pub fn slug(&self) -> String {
        self.topic.split_whitespace().collect::<Vec<_>>().join("-")
    }
}

/// Lookup and search over help topics, keyed by clean topic
/// (lowercase, hyphenated).
pub trait KnowledgeBase: Send + Sync {
    /// Canned reply that takes precedence over wiki pages
    fn static_reply(&self, key: &str) -> Option<String>;

    fn get_topic(&self, key: &str) -> Result<Option<Topic>>;

    /// Topic keys starting with `prefix`
    fn find_topics(&self, prefix: &str) -> Result<Vec<String>>;

    /// Full-text search over topic names and bodies
    fn search(&self, query: &str) -> Result<Vec<String>>;

    /// All topic keys in alphabetical order
    fn topic_names(&self) -> Result<Vec<String>>;
}

/// Wrap a topic hit in the standard reply frame: body between rules,
/// then a DM link and a wiki link.
pub fn render_topic(topic: &Topic, bot: &BotConfig, gitter: &GitterConfig) -> String {
    let slug = topic.slug();
    let mut out = String::from("----\n");
    out.push_str(&topic.data);
    out.push_str("\n----\n");
    out.push_str(&format!("\n> ![{}]({})", bot.name, bot.avatar_url));
    out.push_str(&format!(
        " [DM {}]({})",
        bot.name,
        bot.topic_dm_uri(&gitter.host, &slug)
    ));
    out.push_str(&format!(
        " | [wikilink **{}**]({}{})",
        topic.topic, bot.wiki_url, slug
    ));
    out
}

const SEARCH_LIMIT: i64 = 10;

/// SQLite-backed knowledge base with an FTS5 index for search
pub struct KnowledgeStore {
    conn: Mutex<Connection>,
    static_replies: HashMap<String, String>,
}

impl KnowledgeStore {
    /// Open or create the topic index at the given path
    pub fn open(path: &Path, static_replies: HashMap<String, String>) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open knowledge base: {}", path.display()))?;
        let store = Self::from_connection(conn, static_replies)?;
        info!("Knowledge base opened at: {}", path.display());
        Ok(store)
    }

    pub fn open_in_memory(static_replies: HashMap<String, String>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, static_replies)
    }

    fn from_connection(conn: Connection, static_replies: HashMap<String, String>) -> Result<Self> {
        Self::run_migrations(&conn)?;
        let static_replies = static_replies
            .into_iter()
            .map(|(k, v)| (crate::parser::clean_topic(&k), v))
            .collect();
        Ok(Self {
            conn: Mutex::new(conn),
            static_replies,
        })
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS topics (
                key TEXT PRIMARY KEY,
                topic TEXT NOT NULL,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE VIRTUAL TABLE IF NOT EXISTS topics_fts USING fts5(
                topic,
                data,
                content=topics,
                content_rowid=rowid
            );

            CREATE TRIGGER IF NOT EXISTS topics_fts_insert AFTER INSERT ON topics BEGIN
                INSERT INTO topics_fts(rowid, topic, data)
                    VALUES (NEW.rowid, NEW.topic, NEW.data);
            END;

            CREATE TRIGGER IF NOT EXISTS topics_fts_delete AFTER DELETE ON topics BEGIN
                INSERT INTO topics_fts(topics_fts, rowid, topic, data)
                    VALUES('delete', OLD.rowid, OLD.topic, OLD.data);
            END;

            CREATE TRIGGER IF NOT EXISTS topics_fts_update AFTER UPDATE ON topics BEGIN
                INSERT INTO topics_fts(topics_fts, rowid, topic, data)
                    VALUES('delete', OLD.rowid, OLD.topic, OLD.data);
                INSERT INTO topics_fts(rowid, topic, data)
                    VALUES (NEW.rowid, NEW.topic, NEW.data);
            END;
            ",
        )
        .context("Failed to create knowledge tables")?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("knowledge base lock poisoned"))
    }

    /// Store or replace a topic. Returns the key it was stored under.
    pub fn upsert_topic(&self, topic: &str, data: &str) -> Result<String> {
        let key = crate::parser::clean_topic(topic);
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO topics (key, topic, data) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                topic = excluded.topic,
                data = excluded.data,
                updated_at = datetime('now')",
            rusqlite::params![&key, topic, data],
        )
        .with_context(|| format!("Failed to store topic {}", topic))?;
        Ok(key)
    }

    #[cfg(test)]
    pub fn topic_count(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT count(*) FROM topics", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// Escape `%`, `_` and `\` for a LIKE pattern using `\` as escape character
fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Turn free text into a single FTS5 phrase so user input can't inject query syntax
fn fts_phrase(query: &str) -> String {
    format!("\"{}\"", query.replace('"', "\"\""))
}

impl KnowledgeBase for KnowledgeStore {
    fn static_reply(&self, key: &str) -> Option<String> {
        self.static_replies.get(key).cloned()
    }

    fn get_topic(&self, key: &str) -> Result<Option<Topic>> {
        let conn = self.conn()?;
        let topic = conn
            .query_row(
                "SELECT topic, data FROM topics WHERE key = ?1",
                rusqlite::params![key],
                |row| {
                    Ok(Topic {
                        topic: row.get(0)?,
                        data: row.get(1)?,
                    })
                },
            )
            .ok();
        Ok(topic)
    }

    fn find_topics(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("{}%", escape_like(&crate::parser::clean_topic(prefix)));
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT key FROM topics WHERE key LIKE ?1 ESCAPE '\\' ORDER BY key")?;
        let keys = stmt
            .query_map(rusqlite::params![pattern], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()
            .context("Failed to find topics")?;
        Ok(keys)
    }

    fn search(&self, query: &str) -> Result<Vec<String>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT t.key
             FROM topics t
             JOIN topics_fts fts ON t.rowid = fts.rowid
             WHERE topics_fts MATCH ?1
             ORDER BY fts.rank
             LIMIT ?2",
        )?;
        let keys = stmt
            .query_map(rusqlite::params![fts_phrase(query), SEARCH_LIMIT], |row| {
                row.get(0)
            })?
            .collect::<Result<Vec<String>, _>>()
            .context("Failed to search topics")?;
        Ok(keys)
    }

    fn topic_names(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT key FROM topics ORDER BY key")?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()
            .context("Failed to list topics")?;
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn store() -> KnowledgeStore {
        let mut replies = HashMap::new();
        replies.insert("Bonfire".to_string(), "Try the map first".to_string());
        let store = KnowledgeStore::open_in_memory(replies).unwrap();
        store
            .upsert_topic("Check for Palindromes", "Check for Palindromes explanation")
            .unwrap();
        store.upsert_topic("check-syntax", "Run a linter").unwrap();
        store.upsert_topic("loops", "for and while").unwrap();
        store
    }

    #[test]
    fn test_get_topic_by_clean_key() {
        let store = store();
        let topic = store.get_topic("check-for-palindromes").unwrap().unwrap();
        assert_eq!(topic.topic, "Check for Palindromes");
        assert_eq!(topic.data, "Check for Palindromes explanation");
        assert!(store.get_topic("missing").unwrap().is_none());
    }

    #[test]
    fn test_static_reply_keys_are_normalized() {
        let store = store();
        assert_eq!(store.static_reply("bonfire").as_deref(), Some("Try the map first"));
        assert!(store.static_reply("loops").is_none());
    }

    #[test]
    fn test_find_topics_by_prefix() {
        let store = store();
        assert_eq!(
            store.find_topics("check").unwrap(),
            vec!["check-for-palindromes", "check-syntax"]
        );
        assert!(store.find_topics("%").unwrap().is_empty());
    }

    #[test]
    fn test_search_matches_body_text() {
        let store = store();
        assert_eq!(store.search("linter").unwrap(), vec!["check-syntax"]);
        assert!(store.search("   ").unwrap().is_empty());
        // quotes in user input must not break the query
        assert!(store.search("say \"hi").unwrap().is_empty());
    }

    #[test]
    fn test_upsert_replaces_existing_topic() {
        let store = store();
        store.upsert_topic("loops", "updated").unwrap();
        assert_eq!(store.topic_count().unwrap(), 3);
        assert_eq!(store.get_topic("loops").unwrap().unwrap().data, "updated");
        assert_eq!(store.search("updated").unwrap(), vec!["loops"]);
    }

    #[test]
    fn test_render_topic_template() {
        let config = Config::parse(
            "[gitter]\ntoken = \"t\"\n[bot]\nname = \"bothelp\"\n[[rooms]]\ntitle = \"a\"\nname = \"a/b\"\n",
        )
        .unwrap();
        let topic = Topic {
            topic: "palindrome".to_string(),
            data: "Check for Palindromes explanation".to_string(),
        };
        let out = render_topic(&topic, &config.bot, &config.gitter);
        assert!(out.starts_with("----\nCheck for Palindromes explanation\n----\n"));
        assert!(out.contains("[DM bothelp](https://gitter.im/bothelp?topic=palindrome)"));
        assert!(out.contains(
            "[wikilink **palindrome**](https://github.com/bothelpers/kbase/wiki/palindrome)"
        ));
    }

    #[test]
    fn test_titled_topic_links_use_hyphenated_name() {
        let config = Config::parse(
            "[gitter]\ntoken = \"t\"\n[bot]\nname = \"bothelp\"\n[[rooms]]\ntitle = \"a\"\nname = \"a/b\"\n",
        )
        .unwrap();
        let store = store();
        store.upsert_topic("Falsey Bouncer", "Remove falsy values").unwrap();
        let topic = store.get_topic("falsey-bouncer").unwrap().unwrap();

        let out = render_topic(&topic, &config.bot, &config.gitter);
        assert!(out.contains("[DM bothelp](https://gitter.im/bothelp?topic=Falsey-Bouncer)"));
        assert!(out.contains(
            "[wikilink **Falsey Bouncer**](https://github.com/bothelpers/kbase/wiki/Falsey-Bouncer)"
        ));
    }
}
