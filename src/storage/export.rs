use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::str::FromStr;

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::engine::task::ScrapeRecord;
use crate::error::{Result, ScrapeError};

/// Output layout of an export
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Default,
    GroupByTags,
    Articles,
    WithLinks,
    Csv,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::GroupByTags => "group_by_tags",
            Self::Articles => "articles",
            Self::WithLinks => "with_links",
            Self::Csv => "csv",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            _ => "json",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" | "json" => Ok(Self::Default),
            "group_by_tags" => Ok(Self::GroupByTags),
            "articles" => Ok(Self::Articles),
            "with_links" => Ok(Self::WithLinks),
            "csv" => Ok(Self::Csv),
            other => Err(format!("unsupported export format: {}", other)),
        }
    }
}

/// Results of one task as handed to the exporter
#[derive(Debug, Clone, Copy)]
pub struct ExportEntry<'a> {
    pub url: &'a str,
    pub selector: &'a str,
    pub records: &'a [ScrapeRecord],
}

/// Build the JSON document for `format`, one top-level key per url.
///
/// `ExportFormat::Csv` yields the default layout; use [`write_csv`] for tables.
pub fn export_json(entries: &[ExportEntry<'_>], format: ExportFormat) -> Value {
    let mut document = Map::new();
    for entry in entries {
        let value = match format {
            ExportFormat::Default | ExportFormat::Csv => json!({
                "url": entry.url,
                "results": entry.records,
            }),
            ExportFormat::GroupByTags => group_by_tags(entry),
            ExportFormat::Articles => articles(entry),
            ExportFormat::WithLinks => json!({
                "url": entry.url,
                "data": entry
                    .records
                    .iter()
                    .filter(|r| r.link.as_deref().map_or(false, |l| !l.is_empty()))
                    .collect::<Vec<_>>(),
            }),
        };
        document.insert(entry.url.to_string(), value);
    }
    document.into()
}

/// Group records under the comma separated tags of the selector.
///
/// Linked records go to `a` when it is one of the tags, other records are
/// matched by a `tag:` prefix on their title. Empty groups are dropped.
fn group_by_tags(entry: &ExportEntry<'_>) -> Value {
    let tags: Vec<&str> = entry
        .selector
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect();
    let mut groups: Vec<(&str, Vec<Value>)> = tags.iter().map(|t| (*t, Vec::new())).collect();

    for record in entry.records {
        let title = record.title.as_deref().unwrap_or_default().trim();

        if let Some(link) = record.link.as_deref().filter(|l| !l.is_empty()) {
            if let Some((_, group)) = groups.iter_mut().find(|(tag, _)| *tag == "a") {
                group.push(json!({ "link_text": title, "url": link }));
            }
            continue;
        }

        for (tag, group) in groups.iter_mut() {
            if let Some(text) = title.strip_prefix(&format!("{}:", tag)) {
                group.push(json!({ "text": text.trim() }));
                break;
            }
        }
    }

    let data: Map<String, Value> = groups
        .into_iter()
        .filter(|(_, group)| !group.is_empty())
        .map(|(tag, group)| (tag.to_string(), Value::Array(group)))
        .collect();

    json!({ "url": entry.url, "data": data })
}

/// Split titles into articles: `h1:` starts one, `h2:` adds a subtitle, anything else is a paragraph
fn articles(entry: &ExportEntry<'_>) -> Value {
    #[derive(Default)]
    struct Article {
        title: String,
        subtitles: Vec<String>,
        paragraphs: Vec<String>,
    }

    impl Article {
        fn into_json(self) -> Value {
            json!({
                "title": self.title,
                "subtitles": self.subtitles,
                "paragraphs": self.paragraphs,
            })
        }
    }

    let mut done = Vec::new();
    let mut current = Article::default();

    for line in entry.records.iter().filter_map(|r| r.title.as_deref()) {
        if let Some(title) = line.strip_prefix("h1:") {
            if !current.title.is_empty() {
                done.push(std::mem::take(&mut current).into_json());
            }
            current.title = title.trim().to_string();
        } else if let Some(subtitle) = line.strip_prefix("h2:") {
            current.subtitles.push(subtitle.trim().to_string());
        } else {
            current.paragraphs.push(line.trim().to_string());
        }
    }
    if !current.title.is_empty() {
        done.push(current.into_json());
    }

    json!({ "url": entry.url, "articles": done })
}

fn csv_field(value: Option<&str>) -> String {
    let value = value.unwrap_or_default();
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Write one `URL,Title,Link,Description` row per record
pub fn write_csv<W: Write>(mut writer: W, entries: &[ExportEntry<'_>]) -> io::Result<()> {
    writeln!(writer, "URL,Title,Link,Description")?;
    for entry in entries {
        for record in entry.records {
            writeln!(
                writer,
                "{},{},{},{}",
                csv_field(Some(entry.url)),
                csv_field(record.title.as_deref()),
                csv_field(record.link.as_deref()),
                csv_field(record.description.as_deref()),
            )?;
        }
    }
    writer.flush()
}

/// Export `entries` to `path` in `format`
pub fn export_to_file(path: &Path, entries: &[ExportEntry<'_>], format: ExportFormat) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| ScrapeError::io(parent, e))?;
    }

    match format {
        ExportFormat::Csv => {
            let file = fs::File::create(path).map_err(|e| ScrapeError::io(path, e))?;
            write_csv(io::BufWriter::new(file), entries).map_err(|e| ScrapeError::io(path, e))?;
        }
        _ => {
            let document = export_json(entries, format);
            let contents = serde_json::to_string_pretty(&document)
                .map_err(|e| ScrapeError::serialization(path, e))?;
            fs::write(path, contents).map_err(|e| ScrapeError::io(path, e))?;
        }
    }

    let records: usize = entries.iter().map(|e| e.records.len()).sum();
    debug!("Exported {} records as {} to {}", records, format, path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(title: &str, link: Option<&str>) -> ScrapeRecord {
        ScrapeRecord {
            title: Some(title.to_string()),
            link: link.map(str::to_string),
            description: None,
        }
    }

    #[test]
    fn test_format_names() {
        assert_eq!("group_by_tags".parse::<ExportFormat>(), Ok(ExportFormat::GroupByTags));
        assert_eq!("CSV".parse::<ExportFormat>(), Ok(ExportFormat::Csv));
        assert!("xlsx".parse::<ExportFormat>().is_err());
        assert_eq!(ExportFormat::WithLinks.extension(), "json");
    }

    #[test]
    fn test_default_and_with_links() {
        let records = vec![record("About", Some("https://e.com/about")), record("Plain", None)];
        let entries = [ExportEntry {
            url: "https://e.com",
            selector: "a",
            records: &records,
        }];

        let default = export_json(&entries, ExportFormat::Default);
        assert_eq!(default["https://e.com"]["results"].as_array().unwrap().len(), 2);

        let linked = export_json(&entries, ExportFormat::WithLinks);
        let data = linked["https://e.com"]["data"].as_array().unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0]["title"], "About");
    }

    #[test]
    fn test_group_by_tags() {
        let records = vec![
            record("Home", Some("/")),
            record("h1: Headline", None),
            record("p: Body text", None),
            record("stray", None),
        ];
        let entries = [ExportEntry {
            url: "u",
            selector: "h1, p, a, h2",
            records: &records,
        }];

        let grouped = export_json(&entries, ExportFormat::GroupByTags);
        let data = grouped["u"]["data"].as_object().unwrap();
        assert_eq!(data["a"][0]["link_text"], "Home");
        assert_eq!(data["h1"][0]["text"], "Headline");
        assert_eq!(data["p"][0]["text"], "Body text");
        assert!(!data.contains_key("h2"));
    }

    #[test]
    fn test_articles() {
        let records = vec![
            record("intro without article", None),
            record("h1: First", None),
            record("h2: Sub", None),
            record("Para", None),
            record("h1: Second", None),
        ];
        let entries = [ExportEntry {
            url: "u",
            selector: "h1, h2, p",
            records: &records,
        }];

        let doc = export_json(&entries, ExportFormat::Articles);
        let articles = doc["u"]["articles"].as_array().unwrap();
        assert_eq!(articles.len(), 2);
        assert_eq!(articles[0]["title"], "First");
        assert_eq!(articles[0]["subtitles"][0], "Sub");
        assert_eq!(articles[0]["paragraphs"].as_array().unwrap().len(), 2);
        assert_eq!(articles[1]["title"], "Second");
    }

    #[test]
    fn test_csv_quoting() {
        let records = vec![
            ScrapeRecord {
                title: Some("Hello, \"world\"".to_string()),
                link: Some("https://e.com/x".to_string()),
                description: None,
            },
        ];
        let entries = [ExportEntry {
            url: "https://e.com",
            selector: "a",
            records: &records,
        }];

        let mut out = Vec::new();
        write_csv(&mut out, &entries).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "URL,Title,Link,Description\nhttps://e.com,\"Hello, \"\"world\"\"\",https://e.com/x,\n"
        );
    }

    #[test]
    fn test_export_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let records = vec![record("About", Some("/about"))];
        let entries = [ExportEntry {
            url: "https://e.com",
            selector: "a",
            records: &records,
        }];

        let json_path = dir.path().join("out").join("export.json");
        export_to_file(&json_path, &entries, ExportFormat::Default).unwrap();
        let parsed: Value = serde_json::from_str(&fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(parsed["https://e.com"]["url"], "https://e.com");

        let csv_path = dir.path().join("export.csv");
        export_to_file(&csv_path, &entries, ExportFormat::Csv).unwrap();
        assert_eq!(fs::read_to_string(&csv_path).unwrap().lines().count(), 2);
    }
}
