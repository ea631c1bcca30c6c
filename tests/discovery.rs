//! Discovery and marker maintenance over a JSON file store.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use sheetrelay::claim::format_marker;
use sheetrelay::{
    ClaimManager, DiscoveryEngine, GroupProgress, JsonFileStore, ManualClock, RunConfig,
    SharedStore, TaskGroup, TaskLedger,
};

const CONFIG: &str = r#"
[[group]]
number = 4
sheet = "Prompts"
source_columns = ["A", "B"]
answer_columns = ["D"]
worker_types = ["w"]
first_row = 2
last_row = 6
"#;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 4, 8, 0, 0).unwrap()
}

fn group() -> TaskGroup {
    let config = RunConfig::from_toml(CONFIG).unwrap();
    TaskGroup::from_config(&config.groups[0]).unwrap()
}

async fn seeded_store(dir: &tempfile::TempDir) -> Arc<JsonFileStore> {
    let path = dir.path().join("cells.json");
    let cells = serde_json::json!({
        "Prompts!A2": "Summarize",
        "Prompts!B2": "chapter one",
        "Prompts!A3": "",
        "Prompts!B3": "only second",
        "Prompts!A4": "Translate",
        "Prompts!D4": "done already",
        "Prompts!A5": "Stale",
        "Prompts!D5": format_marker("__CLAIMED__", now() - chrono::Duration::hours(2)),
        "Prompts!A6": "Busy",
        "Prompts!D6": format_marker("__CLAIMED__", now() - chrono::Duration::minutes(1)),
        "Other!D2": "unrelated sheet",
    });
    std::fs::write(&path, serde_json::to_string(&cells).unwrap()).unwrap();
    Arc::new(JsonFileStore::open(&path).await.unwrap())
}

fn claims(store: Arc<JsonFileStore>) -> ClaimManager {
    ClaimManager::new(store, "__CLAIMED__").with_clock(Arc::new(ManualClock::new(now())))
}

#[tokio::test]
async fn batch_joins_sources_and_includes_expired_markers() {
    let dir = tempfile::tempdir().unwrap();
    let engine = DiscoveryEngine::new(claims(seeded_store(&dir).await));

    let batch = engine.find_batch(&group(), &TaskLedger::new(), 10).await.unwrap();
    let found: Vec<(&str, &str)> = batch
        .iter()
        .map(|t| (t.id.as_str(), t.prompt.as_str()))
        .collect();
    assert_eq!(
        found,
        vec![
            ("g4:Prompts!D2", "Summarize\n\nchapter one"),
            ("g4:Prompts!D3", "only second"),
            ("g4:Prompts!D5", "Stale"),
        ]
    );
    assert_eq!(batch[0].source_addresses.len(), 2);
}

#[tokio::test]
async fn progress_reflects_every_row() {
    let dir = tempfile::tempdir().unwrap();
    let engine = DiscoveryEngine::new(claims(seeded_store(&dir).await));

    let progress = engine.group_progress(&group()).await.unwrap();
    assert_eq!(
        progress,
        GroupProgress {
            claimable: 3,
            claimed: 1,
            terminal: 1,
            blank_rows: 0,
        }
    );
    assert!(!engine.is_group_complete(&group()).await.unwrap());
}

#[tokio::test]
async fn unlock_clears_only_expired_markers_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store(&dir).await;
    let cleared = claims(store.clone()).unlock_expired(&group()).await.unwrap();
    let cleared: Vec<String> = cleared.iter().map(ToString::to_string).collect();
    assert_eq!(cleared, vec!["Prompts!D5"]);

    let reopened = JsonFileStore::open(store.path()).await.unwrap();
    assert_eq!(reopened.read_cell(&"Prompts!D5".parse().unwrap()).await.unwrap(), "");
    assert!(reopened
        .read_cell(&"Prompts!D6".parse().unwrap())
        .await
        .unwrap()
        .starts_with("__CLAIMED__"));
    assert_eq!(
        reopened.read_cell(&"Prompts!D4".parse().unwrap()).await.unwrap(),
        "done already"
    );
}

#[tokio::test]
async fn outstanding_lists_claimed_and_claimable_cells() {
    let dir = tempfile::tempdir().unwrap();
    let engine = DiscoveryEngine::new(claims(seeded_store(&dir).await));

    let outstanding = engine.outstanding(&group()).await.unwrap();
    let ids: Vec<&str> = outstanding.iter().map(|id| id.as_str()).collect();
    assert_eq!(
        ids,
        vec!["g4:Prompts!D2", "g4:Prompts!D3", "g4:Prompts!D5", "g4:Prompts!D6"]
    );
}
