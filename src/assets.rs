//! Asset resolution: turns an asset reference found in a conversation into a
//! file under the unit's `attachments/` directory and an embed token.
//!
//! Output names are `<conversation stem>_img<NN>.<ext>`, so the same
//! conversation always produces the same files. Every failure is captured as
//! [`AssetState::Unresolved`] and never aborts the conversation.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use clap::ValueEnum;
use crossbeam_channel::bounded;
use log::{debug, warn};
use serde::Deserialize;

use crate::fetch::Fetcher;
use crate::model::{AssetSource, AssetState, NormalizedConversation, ResolvedAsset};
use crate::utils::write_atomic;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "svg"];

/// How resolved images are referenced from Markdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedStyle {
    /// `![[file]]`
    #[default]
    Wiki,
    /// `![alt](../attachments/file)`
    Markdown,
}

impl EmbedStyle {
    pub fn token(self, filename: &str, alt: Option<&str>) -> String {
        match self {
            EmbedStyle::Wiki => format!("![[{filename}]]"),
            EmbedStyle::Markdown => {
                format!("![{}](../attachments/{filename})", alt.unwrap_or_default())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Manifest of files shipped inside the export
// ---------------------------------------------------------------------------

/// Index of the image files shipped inside an export directory, keyed by
/// every reference form that can point at them.
#[derive(Debug, Clone, Default)]
pub struct AssetManifest {
    entries: HashMap<String, PathBuf>,
}

impl AssetManifest {
    /// Scan the root, its sub-directories and one nested level below them.
    pub fn scan(root: &Path) -> Self {
        let mut manifest = Self::default();
        manifest.scan_dir(root);
        for sub in child_dirs(root) {
            manifest.scan_dir(&sub);
            for nested in child_dirs(&sub) {
                manifest.scan_dir(&nested);
            }
        }
        debug!("{} asset file(s) indexed under {}", manifest.len(), root.display());
        manifest
    }

    fn scan_dir(&mut self, dir: &Path) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file() && is_image_path(p))
            .collect();
        files.sort();
        for path in files {
            self.register(path);
        }
    }

    /// Index `path` under its bare file name and, when the name encodes one,
    /// its `sediment://` or `file-service://` pointer. First registration wins.
    pub fn register(&mut self, path: PathBuf) {
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_owned) else {
            return;
        };
        if let Some(rest) = name.strip_prefix("file_") {
            let hex: String = rest.chars().take_while(|c| c.is_ascii_hexdigit()).collect();
            if !hex.is_empty() {
                self.entries
                    .entry(format!("sediment://file_{hex}"))
                    .or_insert_with(|| path.clone());
            }
        } else if let Some(rest) = name.strip_prefix("file-") {
            let id: String = rest
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric())
                .collect();
            if !id.is_empty() {
                self.entries
                    .entry(format!("file-service://file-{id}"))
                    .or_insert_with(|| path.clone());
            }
        }
        self.entries.entry(name).or_insert(path);
    }

    pub fn lookup(&self, reference: &str) -> Option<&Path> {
        self.entries.get(reference).map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn child_dirs(dir: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(dir)
        .map(|d| d.flatten().map(|e| e.path()).filter(|p| p.is_dir()).collect())
        .unwrap_or_default();
    dirs.sort();
    dirs
}

fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

// ---------------------------------------------------------------------------
// Reference helpers
// ---------------------------------------------------------------------------

/// Whether `url` points at Google's user-content image CDN.
pub fn is_cdn_image(url: &str) -> bool {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        .is_some_and(|host| host == "googleusercontent.com" || host.ends_with(".googleusercontent.com"))
}

/// CDN URLs carry their size/format options after the last `=` of the final
/// path segment; `=s0-rp` asks for the original size as PNG. Query and
/// fragment are left alone.
pub fn high_resolution_url(url: &str) -> String {
    let Ok(mut parsed) = url::Url::parse(url) else {
        return format!("{url}=s0-rp");
    };
    let path = parsed.path().to_string();
    let segment_start = path.rfind('/').map_or(0, |i| i + 1);
    let rewritten = match path[segment_start..].rfind('=') {
        Some(eq) => format!("{}=s0-rp", &path[..segment_start + eq]),
        None => format!("{path}=s0-rp"),
    };
    parsed.set_path(&rewritten);
    parsed.into()
}

/// Split a `data:` URI into its MIME type and decoded bytes.
pub fn parse_data_uri(uri: &str) -> Result<(Option<String>, Vec<u8>), String> {
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| "not a data URI".to_string())?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| "data URI without payload".to_string())?;

    let mut params = header.split(';');
    let mime = params
        .next()
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_ascii_lowercase);
    let is_base64 = params.any(|p| p.trim().eq_ignore_ascii_case("base64"));

    let bytes = if is_base64 {
        let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
        STANDARD
            .decode(compact)
            .map_err(|e| format!("malformed base64: {e}"))?
    } else {
        payload.as_bytes().to_vec()
    };
    if bytes.is_empty() {
        return Err("empty data URI".into());
    }
    Ok((mime, bytes))
}

fn extension_for_mime(mime: &str) -> Option<&'static str> {
    Some(match mime {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/svg+xml" => "svg",
        _ => return None,
    })
}

fn sniff_extension(bytes: &[u8]) -> Option<&'static str> {
    infer::get(bytes).map(|kind| match kind.extension() {
        "jpeg" => "jpg",
        other => other,
    })
}

fn url_extension(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let ext = Path::new(parsed.path()).extension()?.to_str()?.to_ascii_lowercase();
    IMAGE_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Per-reference context: which conversation, which ordinal.
#[derive(Debug, Clone, Copy)]
pub struct AssetContext<'a> {
    pub stem: &'a str,
    pub ordinal: usize,
    pub alt: Option<&'a str>,
}

impl AssetContext<'_> {
    pub fn filename(&self, ext: &str) -> String {
        format!("{}_img{:02}.{}", self.stem, self.ordinal, ext)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolutionSummary {
    pub resolved: usize,
    pub unresolved: usize,
}

pub struct AssetResolver<'a> {
    attachments_dir: PathBuf,
    manifest: &'a AssetManifest,
    fetcher: &'a dyn Fetcher,
    embed_style: EmbedStyle,
    workers: usize,
}

impl<'a> AssetResolver<'a> {
    pub fn new(
        attachments_dir: PathBuf,
        manifest: &'a AssetManifest,
        fetcher: &'a dyn Fetcher,
        embed_style: EmbedStyle,
    ) -> Self {
        Self {
            attachments_dir,
            manifest,
            fetcher,
            embed_style,
            workers: 1,
        }
    }

    /// Resolve up to `workers` references concurrently within a conversation.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn resolve(&self, source: &AssetSource, ctx: &AssetContext<'_>) -> AssetState {
        match self.materialize(source, ctx) {
            Ok((filename, path)) => {
                debug!("{} -> {}", source.kind(), filename);
                AssetState::Resolved(ResolvedAsset {
                    token: self.embed_style.token(&filename, ctx.alt),
                    filename,
                    path,
                })
            }
            Err(reason) => AssetState::Unresolved { reason },
        }
    }

    fn materialize(
        &self,
        source: &AssetSource,
        ctx: &AssetContext<'_>,
    ) -> Result<(String, PathBuf), String> {
        let (bytes, ext) = match source {
            AssetSource::Internal(reference) => {
                let path = self
                    .manifest
                    .lookup(reference)
                    .ok_or_else(|| format!("{reference} not found in export"))?;
                let bytes = fs::read(path).map_err(|e| format!("cannot read {}: {e}", path.display()))?;
                let ext = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(str::to_ascii_lowercase)
                    .or_else(|| sniff_extension(&bytes).map(str::to_owned))
                    .unwrap_or_else(|| "bin".into());
                (bytes, ext)
            }
            AssetSource::Inline(uri) => {
                let (mime, bytes) = parse_data_uri(uri)?;
                let ext = mime
                    .as_deref()
                    .and_then(extension_for_mime)
                    .or_else(|| sniff_extension(&bytes))
                    .ok_or_else(|| "unrecognised inline image data".to_string())?;
                (bytes, ext.to_string())
            }
            AssetSource::Remote(url) => {
                let target = if is_cdn_image(url) {
                    high_resolution_url(url)
                } else {
                    url.clone()
                };
                let bytes = self.fetcher.fetch(&target).map_err(|e| e.to_string())?;
                let ext = sniff_extension(&bytes)
                    .map(str::to_owned)
                    .or_else(|| url_extension(url))
                    .unwrap_or_else(|| "png".into());
                (bytes, ext)
            }
        };

        let filename = ctx.filename(&ext);
        let path = self.attachments_dir.join(&filename);
        write_atomic(&path, &bytes).map_err(|e| format!("cannot write {filename}: {e}"))?;
        Ok((filename, path))
    }

    /// Resolve every distinct reference of `conv` once and write the outcome
    /// back into its asset blocks and asset map.
    pub fn resolve_conversation(
        &self,
        conv: &mut NormalizedConversation,
        stem: &str,
    ) -> ResolutionSummary {
        let mut jobs: BTreeMap<usize, (AssetSource, Option<String>)> = BTreeMap::new();
        for asset in conv.asset_refs() {
            jobs.entry(asset.ordinal)
                .or_insert_with(|| (asset.source.clone(), asset.alt.clone()));
        }
        if jobs.is_empty() {
            return ResolutionSummary::default();
        }

        let run = |ordinal: usize, source: &AssetSource, alt: Option<&str>| {
            let ctx = AssetContext { stem, ordinal, alt };
            (ordinal, self.resolve(source, &ctx))
        };

        let states: BTreeMap<usize, AssetState> = if self.workers <= 1 || jobs.len() == 1 {
            jobs.iter()
                .map(|(&ordinal, (source, alt))| run(ordinal, source, alt.as_deref()))
                .collect()
        } else {
            let (job_tx, job_rx) = bounded::<(usize, &AssetSource, Option<&str>)>(jobs.len());
            let (result_tx, result_rx) = bounded::<(usize, AssetState)>(jobs.len());
            let n_workers = self.workers.min(jobs.len());

            std::thread::scope(|s| {
                for _ in 0..n_workers {
                    let job_rx = job_rx.clone();
                    let result_tx = result_tx.clone();
                    let run = &run;
                    s.spawn(move || {
                        while let Ok((ordinal, source, alt)) = job_rx.recv() {
                            if result_tx.send(run(ordinal, source, alt)).is_err() {
                                break;
                            }
                        }
                    });
                }
                drop(job_rx);
                drop(result_tx);

                for (&ordinal, (source, alt)) in &jobs {
                    if job_tx.send((ordinal, source, alt.as_deref())).is_err() {
                        break;
                    }
                }
                drop(job_tx);
                result_rx.iter().collect()
            })
        };

        let mut summary = ResolutionSummary::default();
        for (ordinal, state) in &states {
            match state {
                AssetState::Resolved(_) => summary.resolved += 1,
                AssetState::Unresolved { reason } => {
                    summary.unresolved += 1;
                    warn!("{} image {ordinal}: {reason}", conv.id);
                }
                AssetState::Pending => {}
            }
        }

        for asset in conv.asset_refs_mut() {
            if let Some(state) = states.get(&asset.ordinal) {
                asset.state = state.clone();
            }
        }
        let placeholders: Vec<(String, usize)> = conv
            .asset_refs()
            .map(|a| (a.placeholder.clone(), a.ordinal))
            .collect();
        for (placeholder, ordinal) in placeholders {
            if let Some(state) = states.get(&ordinal) {
                conv.assets.insert(placeholder, state.clone());
            }
        }
        summary
    }
}
