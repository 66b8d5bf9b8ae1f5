use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::assets::EmbedStyle;
use crate::fetch::FetchSettings;

/// Configuration required to convert export units.
/// This decouples the logic from how the arguments were parsed (CLI/Config file).
#[derive(Debug, Clone)]
pub struct ConvertConfig {
    pub output_dir: PathBuf,
    pub tags: Option<Vec<String>>,
    pub embed_style: EmbedStyle,
    pub quote_user: bool,
    /// Skip structurally corrupt conversations instead of failing the unit.
    pub skip_corrupt: bool,
    pub strip_emoji: bool,
    /// Rewrite Unicode math symbols as inline LaTeX.
    pub latex_symbols: bool,
    /// Remove `---` horizontal rules from message text.
    pub drop_rules: bool,
    pub fetch: FetchSettings,
    pub fetch_workers: usize,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("obsidian_export"),
            tags: None,
            embed_style: EmbedStyle::default(),
            quote_user: false,
            skip_corrupt: false,
            strip_emoji: false,
            latex_symbols: false,
            drop_rules: false,
            fetch: FetchSettings::default(),
            fetch_workers: 4,
        }
    }
}

/// Pick a filename stem for a conversation: shortest id prefix (8, 12, full)
/// not yet claimed by another id in `registry`, joined with the title slug.
pub fn allocate_filename(id: &str, title: &str, registry: &mut HashMap<String, String>) -> String {
    let raw_slug = slug::slugify(title);
    // Truncate slug to 60 chars (slug output is ASCII-only, so byte == char)
    let slug = raw_slug[..raw_slug.len().min(60)]
        .trim_end_matches('-')
        .to_string();
    let safe_id: String = id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    let safe_id = if safe_id.is_empty() {
        short_hash(id.as_bytes())
    } else {
        safe_id
    };

    let stem_for = |prefix: &str| {
        if slug.is_empty() {
            prefix.to_string()
        } else {
            format!("{}_{}", prefix, slug)
        }
    };

    for &len in &[8usize, 12usize, safe_id.len()] {
        let candidate = &safe_id[..len.min(safe_id.len())];
        match registry.get(candidate) {
            None => {
                registry.insert(candidate.to_string(), id.to_string());
                return stem_for(candidate);
            }
            Some(existing) if existing == id => return stem_for(candidate),
            Some(_) => continue,
        }
    }
    // Two ids that sanitize to the same string; disambiguate by hash.
    stem_for(&format!("{}-{}", safe_id, short_hash(id.as_bytes())))
}

/// Fence language for a document, guessed from its extension.
pub fn language_for_filename(name: &str) -> Option<&'static str> {
    let ext = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
    Some(match ext.as_str() {
        "py" => "python",
        "swift" => "swift",
        "js" | "mjs" | "cjs" => "javascript",
        "ts" | "tsx" => "typescript",
        "css" => "css",
        "html" | "htm" => "html",
        "json" => "json",
        "md" => "markdown",
        "sh" | "bash" => "bash",
        "yml" | "yaml" => "yaml",
        "rs" => "rust",
        "toml" => "toml",
        "sql" => "sql",
        _ => return None,
    })
}

/// Fractional Unix seconds as used by ChatGPT exports.
pub fn timestamp_from_secs(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    let whole = secs.trunc() as i64;
    let nanos = ((secs - secs.trunc()) * 1e9).round().min(999_999_999.0) as u32;
    DateTime::from_timestamp(whole, nanos)
}

pub fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// First 12 hex characters of the SHA-256 digest.
pub fn short_hash(input: &[u8]) -> String {
    let digest = Sha256::digest(input);
    let mut hex = String::with_capacity(12);
    for byte in digest.iter().take(6) {
        use std::fmt::Write;
        let _ = write!(&mut hex, "{byte:02x}");
    }
    hex
}

/// Write `content` to `target` through a temp file in the same directory.
pub fn write_atomic(target: &Path, content: &[u8]) -> io::Result<()> {
    let dir = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.flush()?;
    tmp.persist(target).map_err(|e| e.error)?;
    Ok(())
}

/// Stamp `path` with `when` as its modification time.
pub fn set_modified(path: &Path, when: DateTime<Utc>) -> io::Result<()> {
    let file = fs::OpenOptions::new().write(true).open(path)?;
    file.set_modified(SystemTime::from(when))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_filename_extends_prefix_on_collision() {
        let mut registry = HashMap::new();
        let a = allocate_filename("abcdef01-1111", "Hello World", &mut registry);
        let b = allocate_filename("abcdef01-2222", "Hello World", &mut registry);
        let a_again = allocate_filename("abcdef01-1111", "Hello World", &mut registry);

        assert_eq!(a, "abcdef01_hello-world");
        assert_eq!(b, "abcdef01-222_hello-world");
        assert_eq!(a, a_again);
    }

    #[test]
    fn allocate_filename_without_title_uses_prefix() {
        let mut registry = HashMap::new();
        assert_eq!(allocate_filename("0123456789", "", &mut registry), "01234567");
    }

    #[test]
    fn language_guess_covers_project_docs() {
        assert_eq!(language_for_filename("main.PY"), Some("python"));
        assert_eq!(language_for_filename("notes.yml"), Some("yaml"));
        assert_eq!(language_for_filename("README"), None);
    }

    #[test]
    fn fractional_seconds_convert() {
        let ts = timestamp_from_secs(1_700_000_000.5).unwrap();
        assert_eq!(ts.timestamp(), 1_700_000_000);
        assert_eq!(ts.timestamp_subsec_millis(), 500);
        assert!(timestamp_from_secs(f64::NAN).is_none());
    }

    #[test]
    fn atomic_write_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("out.md");
        write_atomic(&target, b"one").unwrap();
        write_atomic(&target, b"two").unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "two");
    }

    #[test]
    fn modification_time_follows_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.md");
        write_atomic(&target, b"body").unwrap();
        let when = timestamp_from_secs(1_600_000_000.0).unwrap();
        set_modified(&target, when).unwrap();

        let modified = fs::metadata(&target).unwrap().modified().unwrap();
        let secs = modified
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        assert_eq!(secs, 1_600_000_000);
        assert_eq!(fs::read_to_string(&target).unwrap(), "body");
    }
}
