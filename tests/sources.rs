// tests/sources.rs

use anyhow::Result;
use calibflow::report::stats_table;
use calibflow::source::{count_entries, read_events, write_events};
use calibflow::*;
use std::path::PathBuf;
use tempfile::tempdir;

fn chain_files(dir: &std::path::Path, ext: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for f in 0..3 {
        let events: Vec<Event> = (0..10)
            .map(|i| {
                Event::new()
                    .with_tree(if i % 2 == 0 { "even" } else { "odd" })
                    .with("P", f64::from(f * 10 + i) / 30.0)
                    .with("pid", if i < 4 { 0.9 } else { 0.1 })
                    .with("sw", 1.0)
            })
            .collect();
        let path = dir.join(format!("part_{f}.{ext}"));
        write_events(&path, &events)?;
        files.push(path);
    }
    Ok(files)
}

fn task() -> Result<EfficiencyTask> {
    Ok(EfficiencyTask::new(
        Binning::one_d(vec![0.0, 0.5, 1.0])?,
        Selection::threshold("pid", 0.5),
        Projection::parse(&["P"])?,
    )?)
}

#[test]
fn entry_ranges_tile_a_chain() -> Result<()> {
    let dir = tempdir()?;
    let files = chain_files(dir.path(), "jsonl")?;
    let total = count_entries("even", &files)?;
    assert_eq!(total, 15);

    let whole = WorkItem::chain("K", "even", files);
    let mut reference = task()?;
    WorkManager::sequential().process(&mut reference, vec![whole.clone()])?;

    let pieces = split_entries(&whole, total, 4);
    assert_eq!(pieces.len(), 4);
    assert_eq!(pieces.last().and_then(|p| p.range), Some(EntryRange::new(12, 15)));

    let mut split = task()?;
    let report = WorkManager::new(ManagerConfig::parallel(3))?.process(&mut split, pieces)?;
    assert!(report.is_clean());
    assert!(split.results().approx_eq(reference.results(), 1e-12));

    let pair = split.results().get("K").and_then(Accumulator::as_pair).expect("merged");
    let (accepted, _) = pair.accepted.integral();
    let (rejected, _) = pair.rejected.integral();
    // per file: even entries 0, 2 pass the pid cut, 4, 6, 8 fail
    assert_eq!((accepted, rejected), (6.0, 9.0));
    Ok(())
}

#[cfg(feature = "compression-gzip")]
#[test]
fn gzip_and_plain_chains_agree() -> Result<()> {
    let dir = tempdir()?;
    let plain = chain_files(dir.path(), "jsonl")?;
    let gz = chain_files(dir.path(), "jsonl.gz")?;
    assert_eq!(read_events(&plain[1])?, read_events(&gz[1])?);

    let mut a = task()?;
    WorkManager::sequential().process(&mut a, vec![WorkItem::chain("K", "odd", plain)])?;
    let mut b = task()?;
    WorkManager::sequential().process(&mut b, vec![WorkItem::chain("K", "odd", gz)])?;
    assert!(a.results().approx_eq(b.results(), 0.0));
    Ok(())
}

#[test]
fn malformed_lines_fail_with_their_line_number() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("bad.jsonl");
    std::fs::write(&path, "{\"P\": 1.0}\n\n{\"P\": oops}\n")?;
    let err = read_events(&path).unwrap_err();
    assert!(format!("{err:#}").contains("line 3"));

    let good = dir.path().join("good.jsonl");
    std::fs::write(&good, "{\"P\": 1.0, \"hasRich\": true, \"name\": \"skipped\"}\n")?;
    let events = read_events(&good)?;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].get("hasRich"), Some(1.0));
    assert_eq!(events[0].get("name"), None);
    Ok(())
}

#[test]
fn stats_task_flags_trivial_weights() -> Result<()> {
    let dir = tempdir()?;
    let files = chain_files(dir.path(), "jsonl")?;
    let items = vec![
        WorkItem::chain("even", "even", files.clone()),
        WorkItem::chain("odd", "odd", files),
    ];

    let mut stats = StatsTask::new(["P"])?
        .with_cut(Cut::parse("pid > 0.5")?)
        .with_weights(["sw"]);
    let report = WorkManager::new(ManagerConfig::parallel(2))?.process(&mut stats, items)?;
    assert!(report.is_clean());

    let even = stats.results().get("even").and_then(Accumulator::as_stats).expect("merged");
    assert_eq!(even.get("P").map(RunningStats::count), Some(6));
    assert_eq!(
        stats.trivial_weights(),
        vec![("even".to_string(), "sw".to_string()), ("odd".to_string(), "sw".to_string())]
    );
    assert!(stats_table(stats.results()).to_string().contains("sw (trivial)"));
    Ok(())
}
