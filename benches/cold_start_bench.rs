// Cold-start benchmark for the container entrypoint
// Measures end-to-end latency from entrypoint invocation to workload exit
// Target: supervision overhead p50 < 20ms, p95 < 50ms over a bare `true`

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Benchmark configuration
const ITERATIONS: usize = 100;
const WARMUP_ITERATIONS: usize = 10;

/// Latency percentiles
struct LatencyStats {
    p50: Duration,
    p95: Duration,
    p99: Duration,
    min: Duration,
    max: Duration,
    mean: Duration,
}

impl LatencyStats {
    fn from_samples(mut samples: Vec<Duration>) -> Self {
        samples.sort();
        let len = samples.len();

        let p50_idx = (len as f64 * 0.50) as usize;
        let p95_idx = (len as f64 * 0.95) as usize;
        let p99_idx = (len as f64 * 0.99) as usize;

        let sum: Duration = samples.iter().sum();
        let mean = sum / len as u32;

        Self {
            p50: samples[p50_idx],
            p95: samples[p95_idx],
            p99: samples[p99_idx],
            min: samples[0],
            max: samples[len - 1],
            mean,
        }
    }

    fn print(&self, label: &str) {
        println!("\n{}", label);
        println!("  p50: {:?}", self.p50);
        println!("  p95: {:?}", self.p95);
        println!("  p99: {:?}", self.p99);
        println!("  min: {:?}", self.min);
        println!("  max: {:?}", self.max);
        println!("  mean: {:?}", self.mean);
    }
}

/// Benchmark result
struct BenchmarkResult {
    scenario: String,
    stats: LatencyStats,
    passed: bool,
    reason: Option<String>,
}

impl BenchmarkResult {
    fn print(&self) {
        println!("\n=== {} ===", self.scenario);
        self.stats.print("Latency");

        match &self.reason {
            None => println!("PASS"),
            Some(reason) => println!("FAIL: {}", reason),
        }
    }
}

fn sample<F: FnMut() -> Command>(mut build: F) -> Vec<Duration> {
    for _ in 0..WARMUP_ITERATIONS {
        let _ = build().status();
    }

    (0..ITERATIONS)
        .map(|_| {
            let start = Instant::now();
            let _ = build().status();
            start.elapsed()
        })
        .collect()
}

fn quiet(program: &str) -> Command {
    let mut cmd = Command::new(program);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .env_remove("ENCLAVE_INIT_CONFIG");
    cmd
}

fn write_bench_config(dir: &Path, with_hook: bool) -> PathBuf {
    let hooks = if with_hook {
        r#"[{"name": "noop", "command": ["true"]}]"#
    } else {
        "[]"
    };
    let path = dir.join(format!("bench-{}.json", with_hook));
    let content = format!(
        r#"{{"identity": {{"ensure_passwd_entry": false}}, "hooks": {}}}"#,
        hooks
    );
    std::fs::write(&path, content).expect("write bench config");
    path
}

/// Entrypoint overhead over exec'ing `true` directly
fn benchmark_supervised_true(entrypoint: &str, config: &Path) -> BenchmarkResult {
    let baseline = LatencyStats::from_samples(sample(|| quiet("true")));
    let supervised = LatencyStats::from_samples(sample(|| {
        let mut cmd = quiet(entrypoint);
        cmd.arg("run").arg("--config").arg(config).args(["--", "true"]);
        cmd
    }));

    let overhead_p50 = supervised.p50.saturating_sub(baseline.p50);
    let overhead_p95 = supervised.p95.saturating_sub(baseline.p95);
    let passed =
        overhead_p50 < Duration::from_millis(20) && overhead_p95 < Duration::from_millis(50);
    let reason = (!passed).then(|| {
        format!(
            "overhead p50={:?} (target <20ms), p95={:?} (target <50ms)",
            overhead_p50, overhead_p95
        )
    });

    baseline.print("Baseline (true)");
    BenchmarkResult {
        scenario: "Supervised true".to_string(),
        stats: supervised,
        passed,
        reason,
    }
}

/// Full preparation with one hook before the workload
fn benchmark_prepared_with_hook(entrypoint: &str, config: &Path) -> BenchmarkResult {
    let stats = LatencyStats::from_samples(sample(|| {
        let mut cmd = quiet(entrypoint);
        cmd.arg("run").arg("--config").arg(config).args(["--", "true"]);
        cmd
    }));

    let passed = stats.p50 < Duration::from_millis(100) && stats.p95 < Duration::from_millis(200);
    let reason = (!passed).then(|| {
        format!(
            "p50={:?} (target <100ms), p95={:?} (target <200ms)",
            stats.p50, stats.p95
        )
    });

    BenchmarkResult {
        scenario: "Prepare + hook + true".to_string(),
        stats,
        passed,
        reason,
    }
}

fn main() {
    let entrypoint = env!("CARGO_BIN_EXE_entrypoint");
    let dir = std::env::temp_dir().join(format!("enclave-init-bench-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("create bench dir");

    println!("=== enclave-init Cold-Start Benchmark ===");
    println!("Iterations: {} (after {} warmup)", ITERATIONS, WARMUP_ITERATIONS);

    let results = vec![
        benchmark_supervised_true(entrypoint, &write_bench_config(&dir, false)),
        benchmark_prepared_with_hook(entrypoint, &write_bench_config(&dir, true)),
    ];
    let _ = std::fs::remove_dir_all(&dir);

    for result in &results {
        result.print();
    }

    let passed_count = results.iter().filter(|r| r.passed).count();
    let total_count = results.len();

    println!("\n=== Summary ===");
    println!("{}/{} scenarios passed", passed_count, total_count);

    if passed_count == total_count {
        println!("All cold-start budgets met");
        std::process::exit(0);
    } else {
        println!("Some cold-start budgets exceeded");
        std::process::exit(1);
    }
}
