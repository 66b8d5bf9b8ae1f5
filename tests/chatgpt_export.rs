use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chat_export_md::fetch::OfflineFetcher;
use chat_export_md::fingerprint::FingerprintRegistry;
use chat_export_md::model::Provider;
use chat_export_md::pipeline::Orchestrator;
use chat_export_md::source::{ExportUnit, discover_units};
use chat_export_md::utils::ConvertConfig;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\0\x01\0\0\0\x01";

fn message(id: &str, role: &str, time: f64, content: Value) -> Value {
    json!({
        "id": id,
        "author": {"role": role, "name": null},
        "create_time": time,
        "content": content,
        "recipient": "all",
        "metadata": {}
    })
}

fn text(parts: &[&str]) -> Value {
    json!({"content_type": "text", "parts": parts})
}

fn trip_conversation() -> Value {
    let photo = json!({
        "content_type": "multimodal_text",
        "parts": [
            {"content_type": "image_asset_pointer", "asset_pointer": "sediment://file_0a1b2c", "width": 1, "height": 1},
            "Where was this taken?"
        ]
    });
    json!({
        "title": "Trip planning",
        "create_time": 1_717_000_000.5,
        "update_time": 1_717_000_900.0,
        "conversation_id": "conv-e2e-0001",
        "current_node": "a-new",
        "mapping": {
            "root": {"id": "root", "parent": null, "children": ["sys"], "message": null},
            "sys": {
                "id": "sys",
                "parent": "root",
                "children": ["q"],
                "message": {
                    "id": "sys",
                    "author": {"role": "system"},
                    "content": {"content_type": "text", "parts": [""]},
                    "metadata": {"is_visually_hidden_from_conversation": true}
                }
            },
            "q": {"id": "q", "parent": "sys", "children": ["a-old", "a-new"],
                  "message": message("q", "user", 1_717_000_001.0, photo)},
            "a-old": {"id": "a-old", "parent": "q", "children": [],
                      "message": message("a-old", "assistant", 1_717_000_002.0, text(&["Looks like Lisbon."]))},
            "a-new": {"id": "a-new", "parent": "q", "children": [],
                      "message": message("a-new", "assistant", 1_717_000_003.0, text(&["That is Porto, by the river."]))}
        }
    })
}

fn write_unit(providers: &Path, conversations: &Value) -> ExportUnit {
    let dir = providers.join("chatgpt").join("2025-06");
    fs::create_dir_all(dir.join("images")).unwrap();
    fs::write(
        dir.join("conversations.json"),
        serde_json::to_vec_pretty(conversations).unwrap(),
    )
    .unwrap();
    fs::write(dir.join("images").join("file_0a1b2c-photo.png"), PNG).unwrap();
    ExportUnit::new(Provider::ChatGpt, "2025-06", dir)
}

fn orchestrator(output: &Path) -> Orchestrator {
    let config = ConvertConfig {
        output_dir: output.to_path_buf(),
        tags: Some(vec!["ai".into()]),
        ..Default::default()
    };
    Orchestrator::new(config, FingerprintRegistry::builtin(), Box::new(OfflineFetcher))
}

fn snapshot(dir: &Path) -> Vec<(PathBuf, Vec<u8>)> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in fs::read_dir(&current).unwrap().flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                let bytes = fs::read(&path).unwrap();
                files.push((path.strip_prefix(dir).unwrap().to_path_buf(), bytes));
            }
        }
    }
    files.sort();
    files
}

#[test]
fn converts_active_branch_with_local_image() {
    let providers = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let unit = write_unit(providers.path(), &json!([trip_conversation()]));

    let discovered = discover_units(providers.path()).unwrap();
    assert_eq!(discovered, vec![unit.clone()]);

    let stats = orchestrator(output.path()).convert_unit(&unit).unwrap();
    assert_eq!(stats.converted, 1);
    assert_eq!(stats.messages, 2);
    assert_eq!(stats.assets_resolved, 1);
    assert_eq!(stats.assets_unresolved, 0);
    assert!(stats.report.is_empty(), "{:?}", stats.report);

    let unit_out = output.path().join("chatgpt/2025-06");
    let markdown =
        fs::read_to_string(unit_out.join("markdown/conv-e2e_trip-planning.md")).unwrap();
    let attachment = unit_out.join("attachments/conv-e2e_trip-planning_img01.png");
    assert_eq!(fs::read(attachment).unwrap(), PNG);

    assert!(markdown.starts_with("---\ntitle: Trip planning\nid: conv-e2e-0001\nprovider: chatgpt\n"));
    assert!(markdown.contains("tags:\n- chatgpt\n- ai\n---\n"));
    let body = markdown.split_once("---\n\n").unwrap().1;
    assert_eq!(
        body,
        "## User\n\n![[conv-e2e_trip-planning_img01.png]]\n\nWhere was this taken?\n\n\
         ## Assistant\n\nThat is Porto, by the river.\n"
    );
    assert!(!markdown.contains("Lisbon"));
}

#[test]
fn markdown_carries_the_conversation_creation_time() {
    let providers = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let unit = write_unit(providers.path(), &json!([trip_conversation()]));
    let orch = orchestrator(output.path());

    let path = output
        .path()
        .join("chatgpt/2025-06/markdown/conv-e2e_trip-planning.md");
    for _ in 0..2 {
        orch.convert_unit(&unit).unwrap();
        let modified = fs::metadata(&path).unwrap().modified().unwrap();
        let since_epoch = modified.duration_since(SystemTime::UNIX_EPOCH).unwrap();
        assert_eq!(since_epoch.as_secs(), 1_717_000_000);
        assert!(since_epoch < Duration::from_secs(1_717_000_001));
    }
}

#[test]
fn converting_twice_is_byte_identical() {
    let providers = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let unit = write_unit(providers.path(), &json!([trip_conversation()]));
    let orch = orchestrator(output.path());

    orch.convert_unit(&unit).unwrap();
    let first = snapshot(output.path());
    orch.convert_unit(&unit).unwrap();
    let second = snapshot(output.path());

    assert_eq!(first.len(), 2);
    assert_eq!(first, second);
}

#[test]
fn missing_field_is_reported_but_not_fatal() {
    let providers = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let mut conversation = trip_conversation();
    conversation
        .as_object_mut()
        .unwrap()
        .remove("update_time");
    conversation["brand_new_field"] = json!(true);
    let unit = write_unit(providers.path(), &json!([conversation]));

    let stats = orchestrator(output.path()).convert_unit(&unit).unwrap();
    assert_eq!(stats.converted, 1);
    assert!(stats.messages > 0);
    assert!(stats.has_warnings());
    assert!(
        stats
            .report
            .missing_fields
            .iter()
            .any(|d| d.field == "update_time" && d.occurrences == 1)
    );
    assert!(
        stats
            .report
            .unexpected_fields
            .iter()
            .any(|d| d.field == "brand_new_field")
    );
}

#[test]
fn missing_local_image_is_explicitly_unresolved() {
    let providers = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let unit = write_unit(providers.path(), &json!([trip_conversation()]));
    fs::remove_file(unit.root.join("images/file_0a1b2c-photo.png")).unwrap();

    let stats = orchestrator(output.path()).convert_unit(&unit).unwrap();
    assert_eq!(stats.assets_unresolved, 1);
    assert_eq!(stats.issues.len(), 1);

    let markdown = fs::read_to_string(
        output
            .path()
            .join("chatgpt/2025-06/markdown/conv-e2e_trip-planning.md"),
    )
    .unwrap();
    assert!(markdown.contains("unresolved_assets: 1\n"));
    assert!(markdown.contains(
        "*[unresolved image asset-001: sediment://file_0a1b2c not found in export]*"
    ));
}
