//! Per-unit conversion: fingerprint, normalize, resolve assets, render, write.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

use log::{debug, info, warn};
use thiserror::Error;

use crate::assets::{AssetManifest, AssetResolver};
use crate::fetch::Fetcher;
use crate::fingerprint::{FingerprintRegistry, MismatchReport};
use crate::ledger::Ledger;
use crate::model::{AssetState, NormalizationFlag};
use crate::normalize::{Normalizer, StructuralError};
use crate::renderer::{
    CodeArrows, DropRules, LatexSymbols, RenderOptions, Scripts, StripEmoji, TextTransform,
    TransformChain, render_to_string,
};
use crate::source::{ExportUnit, LoadError, RawExport};
use crate::utils::{ConvertConfig, allocate_filename, set_modified, write_atomic};

#[derive(Debug, Error)]
pub enum ConversionFailure {
    #[error("{record}: {source}")]
    Structural {
        record: String,
        #[source]
        source: StructuralError,
    },
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("cannot write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Something worth telling the user about that did not stop the unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitIssue {
    /// Conversation id or record label.
    pub conversation: String,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct ConversionStats {
    /// `"<provider>/<label>"`.
    pub unit: String,
    pub conversations: usize,
    pub converted: usize,
    /// Conversations with nothing to render.
    pub skipped: usize,
    /// Corrupt conversations dropped under `skip_corrupt`.
    pub failed: usize,
    pub messages: usize,
    pub assets_resolved: usize,
    pub assets_unresolved: usize,
    pub flagged_roles: usize,
    pub flagged_content: usize,
    pub report: MismatchReport,
    pub issues: Vec<UnitIssue>,
    pub written: Vec<PathBuf>,
}

impl ConversionStats {
    pub fn has_warnings(&self) -> bool {
        !self.report.is_empty() || !self.issues.is_empty()
    }
}

/// Drives export units through the conversion stages.
pub struct Orchestrator {
    config: ConvertConfig,
    registry: FingerprintRegistry,
    fetcher: Box<dyn Fetcher>,
    transform: TransformChain,
}

impl Orchestrator {
    pub fn new(
        config: ConvertConfig,
        registry: FingerprintRegistry,
        fetcher: Box<dyn Fetcher>,
    ) -> Self {
        let mut transforms: Vec<Box<dyn TextTransform>> = Vec::new();
        if config.strip_emoji {
            transforms.push(Box::new(StripEmoji));
        }
        if config.latex_symbols {
            transforms.push(Box::new(Scripts));
            transforms.push(Box::new(LatexSymbols));
            transforms.push(Box::new(CodeArrows));
        }
        if config.drop_rules {
            transforms.push(Box::new(DropRules));
        }
        Self {
            config,
            registry,
            fetcher,
            transform: TransformChain(transforms),
        }
    }

    pub fn config(&self) -> &ConvertConfig {
        &self.config
    }

    /// Fingerprint check only.
    pub fn check_unit(&self, unit: &ExportUnit) -> Result<MismatchReport, ConversionFailure> {
        let raw = RawExport::load(unit)?;
        Ok(self.check_export(unit, &raw))
    }

    fn check_export(&self, unit: &ExportUnit, raw: &RawExport) -> MismatchReport {
        let report = self.registry.check(unit.provider, raw);
        for line in report.warnings() {
            warn!("{}: schema drift: {line}", unit.key());
        }
        report
    }

    pub fn convert_unit(&self, unit: &ExportUnit) -> Result<ConversionStats, ConversionFailure> {
        info!("Converting {}", unit.key());
        let raw = RawExport::load(unit)?;
        let report = self.check_export(unit, &raw);
        let normalizer = Normalizer::for_export(unit.provider, &raw);

        let mut stats = ConversionStats {
            unit: unit.key(),
            report,
            ..Default::default()
        };

        // Normalize everything before writing anything.
        let mut conversations = Vec::new();
        for record in raw.into_records() {
            stats.conversations += 1;
            let label = record.label();
            match normalizer.normalize(record) {
                Ok(conv) => conversations.push(conv),
                Err(source) if self.config.skip_corrupt => {
                    warn!("{}: skipping {label}: {source}", unit.key());
                    stats.failed += 1;
                    stats.issues.push(UnitIssue {
                        conversation: label,
                        message: source.to_string(),
                    });
                }
                Err(source) => {
                    return Err(ConversionFailure::Structural {
                        record: label,
                        source,
                    });
                }
            }
        }

        let out_dir = self
            .config
            .output_dir
            .join(unit.provider.tag())
            .join(&unit.label);
        let markdown_dir = out_dir.join("markdown");
        let manifest = AssetManifest::scan(&unit.root);
        debug!("{}: {} asset file(s) in export", unit.key(), manifest.len());
        let resolver = AssetResolver::new(
            out_dir.join("attachments"),
            &manifest,
            self.fetcher.as_ref(),
            self.config.embed_style,
        )
        .with_workers(self.config.fetch_workers);
        let options = RenderOptions {
            tags: self.config.tags.clone().unwrap_or_default(),
            quote_user: self.config.quote_user,
        };

        let mut registry: HashMap<String, String> = HashMap::new();
        for mut conv in conversations {
            if conv.messages.is_empty() {
                debug!("{}: {} has no messages, skipped", unit.key(), conv.id);
                stats.skipped += 1;
                continue;
            }

            let stem = allocate_filename(&conv.id, &conv.title, &mut registry);
            let resolution = resolver.resolve_conversation(&mut conv, &stem);
            stats.assets_resolved += resolution.resolved;
            stats.assets_unresolved += resolution.unresolved;
            stats.messages += conv.messages.len();
            stats.flagged_roles += conv.flagged_roles();
            stats.flagged_content += conv.flagged_content();

            for (placeholder, state) in &conv.assets {
                if let AssetState::Unresolved { reason } = state {
                    stats.issues.push(UnitIssue {
                        conversation: conv.id.clone(),
                        message: format!("{placeholder} unresolved: {reason}"),
                    });
                }
            }
            for flag in &conv.flags {
                let message = match flag {
                    NormalizationFlag::UnknownRole { raw, mapped } => {
                        format!("unknown role {raw:?} rendered as {}", mapped.label())
                    }
                    NormalizationFlag::UnknownContent { kind } => {
                        format!("unknown content type {kind:?}")
                    }
                };
                stats.issues.push(UnitIssue {
                    conversation: conv.id.clone(),
                    message,
                });
            }

            let path = markdown_dir.join(format!("{stem}.md"));
            let markdown = render_to_string(&conv, &options, &self.transform).map_err(|source| {
                ConversionFailure::Io {
                    path: path.clone(),
                    source,
                }
            })?;
            write_atomic(&path, markdown.as_bytes()).map_err(|source| ConversionFailure::Io {
                path: path.clone(),
                source,
            })?;
            if let Some(created) = conv.created_at
                && let Err(err) = set_modified(&path, created)
            {
                warn!("{}: cannot set modification time: {err}", path.display());
            }
            debug!("Wrote {}", path.display());
            stats.converted += 1;
            stats.written.push(path);
        }

        info!(
            "{}: {} converted, {} skipped, {} failed, {} asset(s) resolved, {} unresolved",
            stats.unit,
            stats.converted,
            stats.skipped,
            stats.failed,
            stats.assets_resolved,
            stats.assets_unresolved
        );
        Ok(stats)
    }

    /// Convert every unit not yet in the ledger (all of them with `force`).
    /// A failing unit is recorded and the batch moves on.
    pub fn run_batch(
        &self,
        units: &[ExportUnit],
        ledger: &mut dyn Ledger,
        force: bool,
    ) -> BatchSummary {
        let mut summary = BatchSummary::default();
        for unit in units {
            let key = unit.key();
            if !force {
                match ledger.is_processed(&key) {
                    Ok(true) => {
                        debug!("{key}: already processed");
                        summary.units.push((key, UnitOutcome::AlreadyProcessed));
                        continue;
                    }
                    Ok(false) => {}
                    Err(e) => warn!("{key}: ledger lookup failed: {e}"),
                }
            }

            match self.convert_unit(unit) {
                Ok(stats) => {
                    if let Err(e) = ledger.mark_processed(&key) {
                        warn!("{key}: cannot record in ledger: {e}");
                    }
                    summary.units.push((key, UnitOutcome::Converted(stats)));
                }
                Err(failure) => {
                    log::error!("{key}: {failure}");
                    summary.units.push((key, UnitOutcome::Failed(failure)));
                }
            }
        }
        summary
    }
}

#[derive(Debug)]
pub enum UnitOutcome {
    Converted(ConversionStats),
    AlreadyProcessed,
    Failed(ConversionFailure),
}

#[derive(Debug, Default)]
pub struct BatchSummary {
    /// Unit key and outcome, in processing order.
    pub units: Vec<(String, UnitOutcome)>,
}

impl BatchSummary {
    pub fn converted(&self) -> impl Iterator<Item = &ConversionStats> {
        self.units.iter().filter_map(|(_, o)| match o {
            UnitOutcome::Converted(stats) => Some(stats),
            _ => None,
        })
    }

    pub fn failed(&self) -> impl Iterator<Item = (&str, &ConversionFailure)> {
        self.units.iter().filter_map(|(key, o)| match o {
            UnitOutcome::Failed(failure) => Some((key.as_str(), failure)),
            _ => None,
        })
    }

    pub fn already_processed(&self) -> usize {
        self.units
            .iter()
            .filter(|(_, o)| matches!(o, UnitOutcome::AlreadyProcessed))
            .count()
    }

    pub fn outcome(&self, key: &str) -> Option<&UnitOutcome> {
        self.units.iter().find(|(k, _)| k == key).map(|(_, o)| o)
    }

    /// One-line run summary.
    pub fn line(&self) -> String {
        let stats: Vec<_> = self.converted().collect();
        let files: usize = stats.iter().map(|s| s.converted).sum();
        let unresolved: usize = stats.iter().map(|s| s.assets_unresolved).sum();
        let warnings = stats.iter().filter(|s| s.has_warnings()).count();
        let failed = self.failed().count();

        let mut line = format!(
            "Done. {} unit(s) converted ({} file(s)), {} already processed.",
            stats.len(),
            files,
            self.already_processed()
        );
        if warnings > 0 {
            line.push_str(&format!(
                " {warnings} unit(s) with warnings, {unresolved} unresolved asset(s)."
            ));
        }
        if failed > 0 {
            line.push_str(&format!(" {failed} unit(s) failed."));
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::OfflineFetcher;
    use crate::ledger::MemoryLedger;
    use crate::model::Provider;
    use std::fs;
    use std::path::Path;

    fn orchestrator(output: &Path, skip_corrupt: bool) -> Orchestrator {
        let config = ConvertConfig {
            output_dir: output.to_path_buf(),
            skip_corrupt,
            ..Default::default()
        };
        Orchestrator::new(config, FingerprintRegistry::builtin(), Box::new(OfflineFetcher))
    }

    fn claude_unit(root: &Path, label: &str, conversations: &str) -> ExportUnit {
        let dir = root.join("claude").join(label);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("conversations.json"), conversations).unwrap();
        ExportUnit::new(Provider::Claude, label, dir)
    }

    const ONE_CHAT: &str = r#"[{
        "uuid": "c0ffee00-1111-2222-3333-444455556666",
        "name": "Greeting",
        "created_at": "2025-03-01T10:00:00Z",
        "chat_messages": [
            {"sender": "human", "text": "hi", "content": []},
            {"sender": "assistant", "text": "hello", "content": []}
        ]
    }]"#;

    #[test]
    fn writes_one_file_per_conversation() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let unit = claude_unit(input.path(), "2025-03", ONE_CHAT);

        let stats = orchestrator(output.path(), false).convert_unit(&unit).unwrap();
        assert_eq!(stats.conversations, 1);
        assert_eq!(stats.converted, 1);
        assert_eq!(stats.messages, 2);

        let expected = output
            .path()
            .join("claude/2025-03/markdown/c0ffee00_greeting.md");
        assert_eq!(stats.written, vec![expected.clone()]);
        let text = fs::read_to_string(expected).unwrap();
        assert!(text.contains("## User\n\nhi\n"));
        assert!(text.contains("## Assistant\n\nhello\n"));
    }

    #[test]
    fn empty_conversations_are_skipped() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let unit = claude_unit(
            input.path(),
            "empty",
            r#"[{"uuid": "e1", "name": "Nothing", "chat_messages": []}]"#,
        );

        let stats = orchestrator(output.path(), false).convert_unit(&unit).unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.converted, 0);
        assert!(!output.path().join("claude/empty/markdown").exists());
    }

    #[test]
    fn missing_primary_file_is_a_load_failure() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let dir = input.path().join("claude/broken");
        fs::create_dir_all(&dir).unwrap();
        let unit = ExportUnit::new(Provider::Claude, "broken", dir);

        let err = orchestrator(output.path(), false)
            .convert_unit(&unit)
            .unwrap_err();
        assert!(matches!(err, ConversionFailure::Load(LoadError::MissingPrimary { .. })));
    }

    #[test]
    fn ledger_skips_processed_units_unless_forced() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        let unit = claude_unit(input.path(), "2025-03", ONE_CHAT);
        let orch = orchestrator(output.path(), false);
        let mut ledger = MemoryLedger::default();

        let first = orch.run_batch(std::slice::from_ref(&unit), &mut ledger, false);
        assert_eq!(first.converted().count(), 1);

        let second = orch.run_batch(std::slice::from_ref(&unit), &mut ledger, false);
        assert_eq!(second.already_processed(), 1);
        assert_eq!(second.converted().count(), 0);

        let forced = orch.run_batch(std::slice::from_ref(&unit), &mut ledger, true);
        assert_eq!(forced.converted().count(), 1);
    }
}
