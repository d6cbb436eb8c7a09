use anyhow::{Context, Result};
use std::path::Path;
use tracing::{info, warn};

use super::KnowledgeStore;

/// A wiki page read from disk
#[derive(Debug, Clone, PartialEq)]
pub struct WikiPage {
    /// Display name, used in wiki links
    pub topic: String,
    pub body: String,
}

/// Load all markdown wiki pages from a directory into the store.
///
/// Supports two layouts:
/// 1. `wiki/Topic-Name.md`: standalone page
/// 2. `wiki/Topic-Name/HOME.md`: directory with a HOME.md page
///
/// Pages can carry optional frontmatter overriding the topic name:
/// ```markdown
/// ---
/// title: Check-for-Palindromes
/// ---
/// Body here...
/// ```
pub async fn load_wiki_dir(dir: &Path, store: &KnowledgeStore) -> Result<usize> {
    if !dir.exists() {
        info!("Wiki directory not found: {}, skipping", dir.display());
        return Ok(0);
    }

    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read wiki directory: {}", dir.display()))?;

    let mut loaded = 0;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();

        let page_path = if path.is_dir() {
            let home = path.join("HOME.md");
            if home.exists() {
                home
            } else {
                continue;
            }
        } else if path.extension().and_then(|e| e.to_str()) == Some("md") {
            path.clone()
        } else {
            continue;
        };

        let page = match load_page(&page_path).await {
            Ok(page) => page,
            Err(e) => {
                warn!("Failed to load wiki page {}: {}", page_path.display(), e);
                continue;
            }
        };

        match store.upsert_topic(&page.topic, &page.body) {
            Ok(_) => loaded += 1,
            Err(e) => warn!("Failed to index wiki page {}: {:#}", page_path.display(), e),
        }
    }

    info!("Loaded {} wiki topics", loaded);
    Ok(loaded)
}

async fn load_page(path: &Path) -> Result<WikiPage> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read wiki page: {}", path.display()))?;
    Ok(parse_page(&content, &name_from_path(path)))
}

fn parse_page(content: &str, fallback_name: &str) -> WikiPage {
    if let Some(stripped) = content.strip_prefix("---") {
        if let Some(end) = stripped.find("---") {
            let frontmatter = stripped[..end].trim();
            let body = stripped[end + 3..].trim().to_string();
            let topic = extract_field(frontmatter, "title")
                .unwrap_or_else(|| fallback_name.to_string());
            return WikiPage { topic, body };
        }
    }

    WikiPage {
        topic: fallback_name.to_string(),
        body: content.trim().to_string(),
    }
}

/// Extract a simple `key: value` from frontmatter
fn extract_field(frontmatter: &str, key: &str) -> Option<String> {
    let prefix = format!("{}:", key);
    for line in frontmatter.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix(&prefix) {
            let value = rest.trim().trim_matches('"').trim_matches('\'');
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Topic name from the file path; `HOME.md` pages take their directory's name
fn name_from_path(path: &Path) -> String {
    if path.file_name().and_then(|f| f.to_str()) == Some("HOME.md") {
        if let Some(dir_name) = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|f| f.to_str())
        {
            return dir_name.to_string();
        }
    }
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unnamed")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::KnowledgeBase;
    use std::collections::HashMap;

    #[test]
    fn test_frontmatter_title_overrides_file_name() {
        let page = parse_page("---\ntitle: \"Falsey Bouncer\"\n---\n\nRemove falsy values.", "x");
        assert_eq!(page.topic, "Falsey Bouncer");
        assert_eq!(page.body, "Remove falsy values.");
    }

    #[test]
    fn test_page_without_frontmatter() {
        let page = parse_page("# Loops\n\nfor and while\n", "loops");
        assert_eq!(page.topic, "loops");
        assert_eq!(page.body, "# Loops\n\nfor and while");
    }

    #[test]
    fn test_home_page_named_after_directory() {
        assert_eq!(name_from_path(Path::new("wiki/Pig-Latin/HOME.md")), "Pig-Latin");
        assert_eq!(name_from_path(Path::new("wiki/Boo-who.md")), "Boo-who");
    }

    #[tokio::test]
    async fn test_load_wiki_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Boo-who.md"), "Check for booleans").unwrap();
        std::fs::create_dir(dir.path().join("Pig-Latin")).unwrap();
        std::fs::write(dir.path().join("Pig-Latin").join("HOME.md"), "Move consonants").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let store = KnowledgeStore::open_in_memory(HashMap::new()).unwrap();
        let loaded = load_wiki_dir(dir.path(), &store).await.unwrap();

        assert_eq!(loaded, 2);
        assert_eq!(store.topic_names().unwrap(), vec!["boo-who", "pig-latin"]);
        let topic = store.get_topic("pig-latin").unwrap().unwrap();
        assert_eq!(topic.topic, "Pig-Latin");
        assert_eq!(topic.data, "Move consonants");
    }

    #[tokio::test]
    async fn test_missing_directory_loads_nothing() {
        let store = KnowledgeStore::open_in_memory(HashMap::new()).unwrap();
        let loaded = load_wiki_dir(Path::new("/nonexistent/wiki"), &store).await.unwrap();
        assert_eq!(loaded, 0);
    }
}
