// tests/catalog.rs

use anyhow::Result;
use calibflow::catalog::list_files;
use calibflow::source::{count_entries, write_events};
use calibflow::*;
use std::path::Path;
use tempfile::tempdir;

fn kaon(tree: &str, pid: f64) -> Event {
    Event::new()
        .with_tree(format!("{tree}Tuple/DecayTree"))
        .with("P", 5_000.0)
        .with("ProbNNk", pid)
}

/// `n` files, each holding one DSt_K and one Phi_K event.
fn write_period(dir: &Path, n: usize) -> Result<()> {
    for i in 0..n {
        write_events(
            dir.join(format!("calib_{i}.jsonl")),
            &[kaon("DSt_K", 0.9), kaon("Phi_K", 0.2)],
        )?;
    }
    Ok(())
}

fn catalog(up: &Path) -> SampleCatalog {
    SampleCatalog::default()
        .with_period("pp", "2016", "v5r1", "MagUp", up.display().to_string())
        .with_group("K", ["DSt_K", "Phi_K"])
}

#[test]
fn resolves_groups_into_keyed_chains() -> Result<()> {
    let dir = tempdir()?;
    write_period(dir.path(), 3)?;
    std::fs::create_dir(dir.path().join("not_a_file.jsonl"))?;

    let resolved = catalog(dir.path()).resolve(&RunRequest::new("k", "2016", "v5r1"))?;
    let keys: Vec<&str> = resolved.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, vec!["pp/2016/v5r1/MagUp/DSt_K", "pp/2016/v5r1/MagUp/Phi_K"]);

    let Source::Chain { tree, files } = &resolved[0].1 else {
        panic!("expected a chain");
    };
    assert_eq!(tree, "DSt_KTuple/DecayTree");
    assert_eq!(files.len(), 3);
    assert!(files.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(count_entries(tree, files)?, 3);
    Ok(())
}

#[test]
fn max_files_and_chunking() -> Result<()> {
    let dir = tempdir()?;
    write_period(dir.path(), 5)?;
    let c = catalog(dir.path());

    let req = RunRequest::new("K", "2016", "v5r1").with_max_files(4);
    let items = c.work_items(&req, 3)?;
    // two samples, four files each, chunks of three
    assert_eq!(items.len(), 4);
    let per_item: Vec<usize> = items
        .iter()
        .map(|i| match &i.source {
            Source::Chain { files, .. } => files.len(),
            Source::Sample { .. } => 0,
        })
        .collect();
    assert_eq!(per_item, vec![3, 1, 3, 1]);

    let pattern = format!("{}/*.jsonl", dir.path().display());
    assert_eq!(list_files(&pattern, Some(2))?.len(), 2);
    assert!(list_files("[unclosed", None).is_err());
    Ok(())
}

#[test]
fn unknown_period_is_a_config_error() -> Result<()> {
    let dir = tempdir()?;
    let err = catalog(dir.path())
        .resolve(&RunRequest::new("K", "2012", "v5r1"))
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ConfigError>(),
        Some(ConfigError::UnknownPeriod(_))
    ));
    Ok(())
}

#[test]
fn periods_without_files_are_skipped() -> Result<()> {
    let up = tempdir()?;
    let down = tempdir()?;
    write_period(up.path(), 1)?;
    let c = catalog(up.path()).with_period("pp", "2016", "v5r1", "MagDown", down.path().display().to_string());

    let resolved = c.resolve(&RunRequest::new("K", "2016", "v5r1").with_polarity(Polarity::Both))?;
    assert!(resolved.iter().all(|(k, _)| k.contains("/MagUp/")));

    let only_down = RunRequest::new("K", "2016", "v5r1").with_polarity(Polarity::MagDown);
    let err = c.resolve(&only_down).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ConfigError>(),
        Some(ConfigError::EmptyRequest(_))
    ));
    Ok(())
}

#[test]
fn exclusions_can_empty_a_request() -> Result<()> {
    let dir = tempdir()?;
    write_period(dir.path(), 1)?;
    let c = catalog(dir.path()).with_exclusions("v5r1", "2016", ["DSt_K", "Phi_K"]);
    let err = c.resolve(&RunRequest::new("K", "2016", "v5r1")).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ConfigError>(),
        Some(ConfigError::EmptyRequest(_))
    ));
    Ok(())
}

#[test]
fn catalog_and_run_config_load_from_disk() -> Result<()> {
    let dir = tempdir()?;
    write_period(&dir.path().join("up"), 2)?;

    let catalog_path = dir.path().join("catalog.json");
    std::fs::write(
        &catalog_path,
        serde_json::json!({
            "periods": { "pp/2016/v5r1/MagUp": dir.path().join("up").display().to_string() },
            "groups":  { "K": ["DSt_K", "Phi_K"] }
        })
        .to_string(),
    )?;
    let config_path = dir.path().join("run.json");
    std::fs::write(
        &config_path,
        r#"{
            "request":  { "particle": "K", "years": ["2016"], "version": "v5r1", "polarity": "MagUp" },
            "binning":  [[0, 10, 100]],
            "axes":     ["P/1000"],
            "accepted": "ProbNNk > 0.5",
            "rejected": "ProbNNk <= 0.5",
            "manager":  { "mode": "Sequential", "chunk_size": 1 }
        }"#,
    )?;

    let catalog = SampleCatalog::load(&catalog_path)?;
    let config = RunConfig::load(&config_path)?;
    let items = config.work_items(&catalog)?;
    assert_eq!(items.len(), 4);

    let mut task = config.efficiency_task()?;
    let report = WorkManager::new(config.manager.clone())?.process(&mut task, items)?;
    assert!(report.is_clean());

    let dst = task
        .results()
        .get("pp/2016/v5r1/MagUp/DSt_K")
        .and_then(Accumulator::as_pair)
        .map(|p| (p.accepted.contents().to_vec(), p.rejected.contents().to_vec()));
    assert_eq!(dst, Some((vec![2.0, 0.0], vec![0.0, 0.0])));
    let phi = task.results().get("pp/2016/v5r1/MagUp/Phi_K").and_then(Accumulator::as_pair);
    assert!(phi.is_some_and(|p| integrated(p).value == 0.0));

    assert!(SampleCatalog::load(dir.path().join("absent.json")).is_err());
    Ok(())
}
