// tests/store.rs

use anyhow::Result;
use calibflow::*;
use std::path::PathBuf;
use tempfile::tempdir;

fn filled_task() -> Result<EfficiencyTask> {
    let mut task = EfficiencyTask::new(
        Binning::one_d(vec![0.0, 1.0, 2.0, 3.0])?,
        Selection::threshold("pid", 0.5),
        Projection::parse(&["x"])?,
    )?;
    let events = |offset: f64| -> Vec<Event> {
        (0..30)
            .map(|i| {
                let i = f64::from(i);
                Event::new().with("x", (i * 0.1) % 3.0).with("pid", ((i + offset) * 0.37) % 1.0)
            })
            .collect()
    };
    let items = vec![
        WorkItem::sample("pp/2016/v5r1/MagUp/DSt_K", events(0.0)),
        WorkItem::sample("pp/2016/v5r1/MagDown/DSt_K", events(3.0)),
    ];
    WorkManager::new(ManagerConfig::parallel(2))?.process(&mut task, items)?;
    Ok(task)
}

#[test]
fn saved_runs_reopen_identically() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("nested/eff_K.db");
    let task = filled_task()?;
    let files = vec![PathBuf::from("a.jsonl"), PathBuf::from("b.jsonl")];

    let mut store = ResultStore::open(&path)?;
    assert!(store.is_empty());
    let written = store.save_run("K", task.results(), "{\"cut\":\"pid > 0.5\"}", &files);
    // four entries per key, six for the totals
    assert_eq!(written, 2 * 4 + 6);
    store.save()?;

    let reopened = ResultStore::open(&path)?;
    assert_eq!(reopened.len(), store.len());
    for key in ["pp/2016/v5r1/MagUp/DSt_K", "pp/2016/v5r1/MagDown/DSt_K"] {
        let pair = reopened.get_pair(key).expect("pair stored");
        let before = efficiency(task.results().get(key).and_then(Accumulator::as_pair).expect("merged"));
        assert!(efficiency(pair).approx_eq(&before, 0.0));
        let stored = reopened.get_efficiency(&format!("{key}:efficiency")).expect("efficiency stored");
        assert_eq!(stored, &before);
        assert!(matches!(reopened.get(&format!("{key}:created")), Some(StoredValue::Timestamp(t)) if *t > 0));
    }

    assert!(reopened.get_pair("TOTAL_K").is_some());
    assert_eq!(
        reopened.get("TOTAL_K:files"),
        Some(&StoredValue::List(vec!["a.jsonl".into(), "b.jsonl".into()]))
    );
    assert_eq!(
        reopened.get("TOTAL_K:conf"),
        Some(&StoredValue::Text("{\"cut\":\"pid > 0.5\"}".into()))
    );
    assert!(matches!(reopened.get("TOTAL_K:keys"), Some(StoredValue::List(k)) if k.len() == 2));
    Ok(())
}

#[test]
fn corrupted_store_fails_its_checksum() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("eff.db");
    let mut store = ResultStore::new(&path);
    store.insert("note", StoredValue::Text("x".repeat(64)));
    store.save()?;

    let mut bytes = std::fs::read(&path)?;
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    std::fs::write(&path, &bytes)?;

    let err = ResultStore::open(&path).unwrap_err();
    assert!(format!("{err:#}").contains("checksum mismatch"));
    Ok(())
}

#[test]
fn entries_can_be_replaced_and_exported() -> Result<()> {
    let dir = tempdir()?;
    let mut store = ResultStore::new(dir.path().join("eff.db"));
    store.insert("k", StoredValue::Timestamp(1));
    store.insert("k", StoredValue::Timestamp(2));
    assert_eq!(store.get("k"), Some(&StoredValue::Timestamp(2)));
    assert_eq!(store.remove("k"), Some(StoredValue::Timestamp(2)));
    assert!(store.is_empty());

    store.insert("list", StoredValue::List(vec!["a".into()]));
    let json = dir.path().join("eff.json");
    store.export_json(&json)?;
    let text = std::fs::read_to_string(&json)?;
    assert!(text.contains("\"list\""));
    Ok(())
}
