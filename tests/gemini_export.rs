use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex};

use chat_export_md::assets::EmbedStyle;
use chat_export_md::fetch::{FailureKind, FetchError, Fetcher};
use chat_export_md::fingerprint::FingerprintRegistry;
use chat_export_md::model::Provider;
use chat_export_md::pipeline::Orchestrator;
use chat_export_md::source::ExportUnit;
use chat_export_md::utils::{ConvertConfig, allocate_filename, short_hash};

const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\0\x02\0\0\0\x02";

const PAGE: &str = r#"<!DOCTYPE html><html><body>
<div class="conversation-container">
  <div class="user-query-container">
    <div class="query-text"><p class="query-text-line">Show me three photos</p></div>
  </div>
  <message-content>
    <div class="markdown markdown-main-panel">
      <p>Here they are:</p>
      <img src="https://lh3.googleusercontent.com/gg/one=w200" alt="one">
      <img src="https://lh3.googleusercontent.com/gg/two=w200" alt="two">
      <img src="https://lh3.googleusercontent.com/gg/three=w200" alt="three">
    </div>
  </message-content>
</div>
</body></html>"#;

/// Serves a PNG for every URL except those containing `failing`.
struct FlakyCdn {
    failing: &'static str,
    requested: Arc<Mutex<Vec<String>>>,
}

impl Fetcher for FlakyCdn {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.requested.lock().unwrap().push(url.to_string());
        if url.contains(self.failing) {
            return Err(FetchError::new(FailureKind::Network, "connection reset"));
        }
        Ok(PNG.to_vec())
    }
}

#[test]
fn one_failed_image_leaves_the_others_resolved() {
    let providers = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let dir = providers.path().join("gemini/2025-07");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("Three photos.html"), PAGE).unwrap();
    let unit = ExportUnit::new(Provider::Gemini, "2025-07", &dir);

    let config = ConvertConfig {
        output_dir: output.path().to_path_buf(),
        embed_style: EmbedStyle::Markdown,
        fetch_workers: 3,
        ..Default::default()
    };
    let fetcher = FlakyCdn {
        failing: "/two=",
        requested: Arc::default(),
    };
    let orchestrator =
        Orchestrator::new(config, FingerprintRegistry::builtin(), Box::new(fetcher));

    let stats = orchestrator.convert_unit(&unit).unwrap();
    assert!(stats.report.is_empty(), "{:?}", stats.report);
    assert_eq!(stats.converted, 1);
    assert_eq!(stats.assets_resolved, 2);
    assert_eq!(stats.assets_unresolved, 1);
    assert!(stats.has_warnings());

    let stem = allocate_filename(
        &short_hash(b"Three photos.html"),
        "Three photos",
        &mut HashMap::new(),
    );
    let unit_out = output.path().join("gemini/2025-07");
    let attachments = unit_out.join("attachments");
    assert!(attachments.join(format!("{stem}_img01.png")).is_file());
    assert!(!attachments.join(format!("{stem}_img02.png")).exists());
    assert!(attachments.join(format!("{stem}_img03.png")).is_file());

    let markdown = fs::read_to_string(unit_out.join(format!("markdown/{stem}.md"))).unwrap();
    assert!(markdown.contains("title: Three photos\n"));
    assert!(markdown.contains("## User\n\nShow me three photos\n"));
    assert!(markdown.contains(&format!("![one](../attachments/{stem}_img01.png)")));
    assert!(markdown.contains(
        "*[unresolved image asset-002: network error: connection reset]*"
    ));
    assert!(markdown.contains(&format!("![three](../attachments/{stem}_img03.png)")));

    let one = markdown.find("![one]").unwrap();
    let two = markdown.find("asset-002").unwrap();
    let three = markdown.find("![three]").unwrap();
    assert!(one < two && two < three);
}

#[test]
fn cdn_images_are_requested_at_full_resolution() {
    let providers = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let dir = providers.path().join("gemini/2025-07");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("Three photos.html"), PAGE).unwrap();
    let unit = ExportUnit::new(Provider::Gemini, "2025-07", &dir);

    let requested = Arc::new(Mutex::new(Vec::new()));
    let fetcher = Box::new(FlakyCdn {
        failing: "never",
        requested: Arc::clone(&requested),
    });
    let config = ConvertConfig {
        output_dir: output.path().to_path_buf(),
        ..Default::default()
    };
    let orchestrator = Orchestrator::new(config, FingerprintRegistry::builtin(), fetcher);
    orchestrator.convert_unit(&unit).unwrap();

    let mut urls = requested.lock().unwrap().clone();
    urls.sort();
    assert_eq!(
        urls,
        vec![
            "https://lh3.googleusercontent.com/gg/one=s0-rp",
            "https://lh3.googleusercontent.com/gg/three=s0-rp",
            "https://lh3.googleusercontent.com/gg/two=s0-rp",
        ]
    );
}
