//! Example: a complete kaon efficiency scan over a synthetic calibration sample.
//!
//! Writes a few gzip-compressed JSONL files with two kaon samples, resolves
//! them through a catalog, fills accepted/rejected histograms in parallel,
//! prints the summary table and records everything in a result store.
//!
//! Run with `RUST_LOG=debug` to see per-item and per-worker records.

use calibflow::catalog::SampleCatalog;
use calibflow::report::stats_table;
use calibflow::source::write_events;
use calibflow::*;
use tempfile::TempDir;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Deterministic pseudo-random stream in `[0, 1)`.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> f64 {
        self.0 = self.0.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
        (self.0 >> 11) as f64 / (1u64 << 53) as f64
    }
}

fn synthetic_events(rng: &mut Lcg, n: usize) -> Vec<Event> {
    let mut out = Vec::with_capacity(2 * n);
    for sample in ["DSt_K", "Phi_K"] {
        for _ in 0..n {
            let p = 2_000.0 + 98_000.0 * rng.next();
            let eta = 1.5 + 3.5 * rng.next();
            // harder momentum, better separation
            let pid = (rng.next() + p / 200_000.0).min(1.0);
            out.push(
                Event::new()
                    .with_tree(format!("{sample}Tuple/DecayTree"))
                    .with("P", p)
                    .with("ETA", eta)
                    .with("ProbNNk", pid)
                    .with("hasRich", f64::from(u8::from(rng.next() > 0.05)))
                    .with("sw", 0.5 + rng.next()),
            );
        }
    }
    out
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let temp = TempDir::new()?;
    let data_dir = temp.path().join("pp/2016/up");
    let mut rng = Lcg(2016);
    for i in 0..6 {
        write_events(data_dir.join(format!("calib_{i:02}.jsonl.gz")), &synthetic_events(&mut rng, 500))?;
    }

    let catalog = SampleCatalog::default()
        .with_period("pp", "2016", "v5r1", "MagUp", data_dir.display().to_string())
        .with_group("K", ["DSt_K", "Phi_K"]);

    let config: RunConfig = serde_json::from_value(serde_json::json!({
        "request":  { "particle": "K", "years": ["2016"], "version": "v5r1", "polarity": "Both" },
        "binning":  [[0, 10, 20, 50, 100], [1.5, 3.0, 5.0]],
        "axes":     ["P/1000", "ETA"],
        "accepted": "ProbNNk > 0.5",
        "rejected": "ProbNNk <= 0.5",
        "cuts":     "hasRich",
        "weight":   "sw",
        "output":   "eff_K.db",
        "manager":  { "mode": { "Parallel": { "workers": 4 } }, "chunk_size": 2, "progress": 2 }
    }))?;

    // MagDown has no data in this catalog: it is skipped with a warning
    let items = config.work_items(&catalog)?;
    info!(items = items.len(), "work planned");

    let manager = WorkManager::new(config.manager.clone())?;
    let mut task = config.efficiency_task()?;
    let run = manager.process(&mut task, items.clone())?;

    let report = Report::from_aggregate("Kaon efficiency, ProbNNk > 0.5", task.results())
        .with_run(&run);
    println!("{report}");

    let mut stats = StatsTask::new(["P", "ETA"])?.with_weights(["sw"]);
    manager.process(&mut stats, items)?;
    println!("{}", stats_table(stats.results()));

    let files = calibflow::catalog::list_files(&format!("{}/*.jsonl.gz", data_dir.display()), None)?;
    let mut store = ResultStore::new(config.output_path(temp.path()));
    let written = store.save_run("K", task.results(), &config.snapshot()?, &files);
    store.save()?;

    let reloaded = ResultStore::open(store.path())?;
    let total = reloaded
        .get_pair("TOTAL_K")
        .ok_or_else(|| anyhow::anyhow!("TOTAL_K missing from the store"))?;
    let eff = integrated(total);
    println!(
        "{written} keys stored; integrated efficiency {:.2} +- {:.2} %",
        100.0 * eff.value,
        100.0 * eff.error
    );
    Ok(())
}
