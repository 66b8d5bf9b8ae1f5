//! Export unit discovery and raw loading.
//!
//! Layout: `<providers>/<provider>/<label>/`. One unit per dated bundle.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde_json::Value;
use thiserror::Error;

use crate::model::Provider;

pub const PRIMARY_FILE: &str = "conversations.json";

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path} is missing")]
    MissingPrimary { path: PathBuf },
    #[error("cannot parse {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> LoadError + '_ {
    move |source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// One provider's dated export bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportUnit {
    pub provider: Provider,
    pub label: String,
    pub root: PathBuf,
}

impl ExportUnit {
    pub fn new(provider: Provider, label: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            provider,
            label: label.into(),
            root: root.into(),
        }
    }

    /// Ledger identity, `"<provider>/<label>"`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.provider, self.label)
    }
}

/// List every `<provider>/<label>` directory under `providers_dir`, sorted by
/// provider then label. Unknown provider directories are skipped.
pub fn discover_units(providers_dir: &Path) -> Result<Vec<ExportUnit>, LoadError> {
    let mut units = Vec::new();
    for provider_dir in sorted_dirs(providers_dir)? {
        let name = file_name(&provider_dir);
        let provider = match name.parse::<Provider>() {
            Ok(p) => p,
            Err(e) => {
                debug!("skipping {}: {e}", provider_dir.display());
                continue;
            }
        };
        for unit_dir in sorted_dirs(&provider_dir)? {
            let label = file_name(&unit_dir);
            units.push(ExportUnit::new(provider, label, unit_dir));
        }
    }
    units.sort_by(|a, b| (a.provider, &a.label).cmp(&(b.provider, &b.label)));
    Ok(units)
}

fn sorted_dirs(dir: &Path) -> Result<Vec<PathBuf>, LoadError> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(io_error(dir))?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir() && !file_name(p).starts_with('.'))
        .collect();
    dirs.sort();
    Ok(dirs)
}

fn sorted_files(dir: &Path) -> Result<Vec<PathBuf>, LoadError> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(io_error(dir))?
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file() && !file_name(p).starts_with('.'))
        .collect();
    files.sort();
    Ok(files)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn has_extension(path: &Path, exts: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| exts.iter().any(|x| e.eq_ignore_ascii_case(x)))
}

// ---------------------------------------------------------------------------
// Raw export
// ---------------------------------------------------------------------------

/// A saved chat page, already decoded to HTML text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkupDocument {
    /// File name inside the unit directory.
    pub name: String,
    pub html: String,
}

/// The loaded, still untyped contents of an export unit.
#[derive(Debug, Clone, Default)]
pub struct RawExport {
    pub provider: Option<Provider>,
    /// File name → parsed JSON, for JSON providers.
    pub json: BTreeMap<String, Value>,
    /// Secondary files that could not be read or parsed.
    pub unreadable: Vec<String>,
    pub documents: Vec<MarkupDocument>,
}

impl RawExport {
    pub fn load(unit: &ExportUnit) -> Result<Self, LoadError> {
        let mut raw = RawExport {
            provider: Some(unit.provider),
            ..Default::default()
        };
        let files = sorted_files(&unit.root)?;

        match unit.provider {
            Provider::ChatGpt | Provider::Claude => {
                for path in files.iter().filter(|p| has_extension(p, &["json"])) {
                    let name = file_name(path);
                    match read_json(path) {
                        Ok(value) => {
                            raw.json.insert(name, value);
                        }
                        Err(e) if name == PRIMARY_FILE => return Err(e),
                        Err(e) => {
                            warn!("{}: {e}", unit.key());
                            raw.unreadable.push(name);
                        }
                    }
                }
                if !raw.json.contains_key(PRIMARY_FILE) {
                    return Err(LoadError::MissingPrimary {
                        path: unit.root.join(PRIMARY_FILE),
                    });
                }
            }
            Provider::Gemini => {
                for path in files
                    .iter()
                    .filter(|p| has_extension(p, &["webarchive", "html", "htm"]))
                {
                    let name = file_name(path);
                    let bytes = fs::read(path).map_err(io_error(path))?;
                    let decoded = if has_extension(path, &["webarchive"]) {
                        decode_webarchive(&bytes)
                    } else {
                        Ok(String::from_utf8_lossy(&bytes).into_owned())
                    };
                    match decoded {
                        Ok(html) => raw.documents.push(MarkupDocument { name, html }),
                        Err(reason) => {
                            warn!("{}: cannot decode {name}: {reason}", unit.key());
                            raw.unreadable.push(name);
                        }
                    }
                }
            }
        }
        Ok(raw)
    }

    /// Split into individual records for the normalizer, in file order.
    pub fn into_records(self) -> Vec<RawRecord> {
        let Some(provider) = self.provider else {
            return Vec::new();
        };
        let mut json = self.json;
        let mut take = |name: &str| -> Vec<Value> {
            match json.remove(name) {
                Some(Value::Array(items)) => items,
                Some(Value::Null) | None => Vec::new(),
                Some(other) => vec![other],
            }
        };

        match provider {
            Provider::ChatGpt => take(PRIMARY_FILE)
                .into_iter()
                .map(RawRecord::ChatGpt)
                .collect(),
            Provider::Claude => {
                let mut records: Vec<RawRecord> = take(PRIMARY_FILE)
                    .into_iter()
                    .map(RawRecord::ClaudeConversation)
                    .collect();
                records.extend(take("memories.json").into_iter().map(RawRecord::ClaudeMemory));
                records.extend(take("projects.json").into_iter().map(RawRecord::ClaudeProject));
                records
            }
            Provider::Gemini => self.documents.into_iter().map(RawRecord::Gemini).collect(),
        }
    }
}

fn read_json(path: &Path) -> Result<Value, LoadError> {
    let bytes = fs::read(path).map_err(io_error(path))?;
    serde_json::from_slice(&bytes).map_err(|source| LoadError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Extract the main HTML resource from a Safari web archive (binary or XML plist).
pub fn decode_webarchive(bytes: &[u8]) -> Result<String, String> {
    let value = plist::Value::from_reader(Cursor::new(bytes)).map_err(|e| e.to_string())?;
    let data = value
        .as_dictionary()
        .and_then(|d| d.get("WebMainResource"))
        .and_then(plist::Value::as_dictionary)
        .and_then(|d| d.get("WebResourceData"))
        .and_then(plist::Value::as_data)
        .ok_or_else(|| "no WebMainResource.WebResourceData".to_string())?;
    Ok(String::from_utf8_lossy(data).into_owned())
}

/// One conversation-sized piece of a raw export.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    ChatGpt(Value),
    ClaudeConversation(Value),
    ClaudeMemory(Value),
    ClaudeProject(Value),
    Gemini(MarkupDocument),
}

impl RawRecord {
    /// Short identification for log lines and issue lists.
    pub fn label(&self) -> String {
        let id_of = |v: &Value, keys: &[&str]| {
            keys.iter()
                .find_map(|k| v.get(*k).and_then(Value::as_str))
                .map(str::to_owned)
        };
        match self {
            RawRecord::ChatGpt(v) => id_of(v, &["conversation_id", "id", "title"])
                .unwrap_or_else(|| "chatgpt conversation".into()),
            RawRecord::ClaudeConversation(v) => id_of(v, &["uuid", "name"])
                .unwrap_or_else(|| "claude conversation".into()),
            RawRecord::ClaudeMemory(_) => "memories".into(),
            RawRecord::ClaudeProject(v) => {
                id_of(v, &["uuid", "name"]).unwrap_or_else(|| "project".into())
            }
            RawRecord::Gemini(doc) => doc.name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn discovers_units_and_skips_unknown_providers() {
        let dir = tempfile::tempdir().unwrap();
        for p in ["claude/2025-02-01", "chatgpt/2025-01-01", "copilot/x", "claude/.hidden"] {
            fs::create_dir_all(dir.path().join(p)).unwrap();
        }
        let units = discover_units(dir.path()).unwrap();
        let keys: Vec<_> = units.iter().map(ExportUnit::key).collect();
        assert_eq!(keys, vec!["chatgpt/2025-01-01", "claude/2025-02-01"]);
    }

    #[test]
    fn unparseable_primary_file_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("conversations.json"), "[{").unwrap();
        let unit = ExportUnit::new(Provider::ChatGpt, "x", dir.path());
        assert!(matches!(RawExport::load(&unit), Err(LoadError::Json { .. })));
    }

    #[test]
    fn missing_primary_file_fails_load() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("users.json"), "[]").unwrap();
        let unit = ExportUnit::new(Provider::Claude, "x", dir.path());
        assert!(matches!(
            RawExport::load(&unit),
            Err(LoadError::MissingPrimary { .. })
        ));
    }

    #[test]
    fn unparseable_secondary_file_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("conversations.json"), "[]").unwrap();
        fs::write(dir.path().join("projects.json"), "nope").unwrap();
        let unit = ExportUnit::new(Provider::Claude, "x", dir.path());
        let raw = RawExport::load(&unit).unwrap();
        assert_eq!(raw.unreadable, vec!["projects.json".to_string()]);
    }

    #[test]
    fn claude_records_cover_memories_and_projects() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("conversations.json"), r#"[{"uuid":"a"},{"uuid":"b"}]"#).unwrap();
        fs::write(dir.path().join("memories.json"), r#"{"conversations_memory":"m"}"#).unwrap();
        fs::write(dir.path().join("projects.json"), r#"[{"uuid":"p"}]"#).unwrap();
        let unit = ExportUnit::new(Provider::Claude, "x", dir.path());

        let labels: Vec<_> = RawExport::load(&unit)
            .unwrap()
            .into_records()
            .iter()
            .map(RawRecord::label)
            .collect();
        assert_eq!(labels, vec!["a", "b", "memories", "p"]);
    }

    #[test]
    fn webarchive_main_resource_is_decoded() {
        let mut resource = plist::Dictionary::new();
        resource.insert(
            "WebResourceData".into(),
            plist::Value::Data(b"<html><body>hi</body></html>".to_vec()),
        );
        let mut root = plist::Dictionary::new();
        root.insert("WebMainResource".into(), plist::Value::Dictionary(resource));
        let mut bytes = Vec::new();
        plist::Value::Dictionary(root)
            .to_writer_binary(&mut bytes)
            .unwrap();

        assert_eq!(
            decode_webarchive(&bytes).unwrap(),
            "<html><body>hi</body></html>"
        );
        assert!(decode_webarchive(b"not a plist").is_err());
    }
}
