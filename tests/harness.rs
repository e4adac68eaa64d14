#![cfg(unix)]

use std::{fs, path::Path, sync::Once};

use hpc_grader::prelude::*;
use tempfile::TempDir;
use tracing::{Level, Metadata};
use tracing_subscriber::{
    fmt,
    layer::{Context, Filter, SubscriberExt},
    Layer, Registry,
};

/// Lets through events of the grader at DEBUG and above.
struct GraderEvents;
impl<S> Filter<S> for GraderEvents {
    fn enabled(&self, meta: &Metadata<'_>, _cx: &Context<'_, S>) -> bool {
        meta.target().starts_with("hpc_grader") && meta.level() <= &Level::DEBUG
    }
}

/// Test output only shows up for failing tests, so the events are always captured.
fn init_test_logger() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let format = fmt::format()
            .without_time()
            .with_ansi(false)
            .with_level(true)
            .with_target(false);
        let reg = Registry::default().with(
            fmt::layer()
                .event_format(format)
                .with_test_writer()
                .with_filter(GraderEvents),
        );
        let _ = tracing::subscriber::set_global_default(reg);
    });
}

/// Records every write instead of touching the disk.
#[derive(Default)]
struct CountingSink {
    writes: Vec<AggregateResult>,
}

impl ResultSink for CountingSink {
    fn persist(&mut self, result: &AggregateResult) -> anyhow::Result<()> {
        self.writes.push(result.clone());
        Ok(())
    }
}

fn workspace(files: &[(&str, &str)]) -> TempDir {
    init_test_logger();
    let dir = tempfile::tempdir().unwrap();
    for (name, content) in files {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }
    dir
}

fn quiet() -> Configuration {
    Configuration::new().with_verbose(false)
}

fn run(dir: &Path, suite: &str, sink: &mut CountingSink) -> HarnessReport {
    let suite = Suite::from_yaml(suite, dir).unwrap();
    Harness::new(suite, quiet())
        .with_prober(FixedProber::new(0..4))
        .with_sink(sink)
        .with_seed(7)
        .with_key(1 << 30)
        .run()
        .unwrap()
}

#[test]
fn bitmatrix_end_to_end() {
    let dir = workspace(&[
        (
            "user.sh",
            "echo \"$@\" > args.txt\nprintf 'Checksum: 0xABCD\\tMean: 50.0 us\\n'\n",
        ),
        ("ref.sh", "echo 'Checksum: 0xABCD'\n"),
    ]);
    let suite = r#"
name: bitmatrix
compile:
  - { command: sh, args: ["-c", "test -f user.sh"] }
cores: { count: 0 }
cases:
  - id: "1"
    weight: 20
    program: { command: sh, args: [user.sh, "512", "10000", "{seed}", "{key}"], timeout_secs: 10 }
    reference: { command: sh, args: [ref.sh, "512", "1", "{seed}", "{key}"], timeout_secs: 5 }
    metric: { kind: mean_line }
    validation: { kind: checksum_match }
    curve: { family: power_law, tmin: 9.5, tmax: 237.5 }
"#;
    let suite = Suite::from_yaml(suite, dir.path()).unwrap();
    let result_path = dir.path().join("result.yaml");
    let report = Harness::new(suite, quiet())
        .with_seed(7)
        .with_key(1073741825)
        .run()
        .unwrap();

    assert!(report.fatal.is_none());
    let expected = 20.0 * (9.5f64 / 50.0).powf(0.5) * (187.5 / 228.0);
    let case = report.results.get("1").unwrap();
    assert!((case.score() - expected).abs() < 1e-9, "{case:?}");
    assert_eq!(case.performance(), 50.0);
    assert_eq!(case.info(), "Success");
    assert!(!case.zero_flag());

    let args = fs::read_to_string(dir.path().join("args.txt")).unwrap();
    assert_eq!(args.trim(), "512 10000 7 1073741825");

    let written = YamlResultFile::new(&result_path).load().unwrap();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].0, "1");
    assert_eq!(&written[0].1, case);
}

#[test]
fn checksum_mismatch_is_a_wrong_answer() {
    let dir = workspace(&[
        ("user.sh", "printf 'Checksum: 0xABCD\\tMean: 5.0 us\\n'\n"),
        ("ref.sh", "echo 'Checksum: 0x1234'\n"),
    ]);
    let suite = r#"
name: bitmatrix
cores: { count: 0 }
cases:
  - id: "1"
    weight: 20
    program: { command: sh, args: [user.sh] }
    reference: { command: sh, args: [ref.sh] }
    metric: { kind: mean_line }
    validation: { kind: checksum_match }
    curve: { family: power_law, tmin: 9.5, tmax: 237.5 }
"#;
    let mut sink = CountingSink::default();
    let report = run(dir.path(), suite, &mut sink);
    let case = report.results.get("1").unwrap();
    assert_eq!(case.info(), "Wrong Answer");
    assert!(case.zero_flag());
    assert_eq!(case.score(), 0.0);
}

#[test]
fn compile_failure_zeroes_every_case_and_writes_once() {
    let dir = workspace(&[]);
    let suite = r#"
name: oceansim
compile:
  - { command: sh, args: ["-c", "echo 'error: expected ;' >&2; exit 1"] }
cases:
  - { id: "1", weight: 10, program: { command: ./a.out } }
  - { id: "2", weight: 10, program: { command: ./a.out } }
  - { id: "3", weight: 10, program: { command: ./a.out } }
"#;
    let mut sink = CountingSink::default();
    let report = run(dir.path(), suite, &mut sink);

    assert_eq!(report.fatal.as_deref(), Some("Compile Error"));
    assert_eq!(sink.writes.len(), 1);
    let written = &sink.writes[0];
    let ids = written.iter().map(|(id, _)| id).collect::<Vec<_>>();
    assert_eq!(ids, ["1", "2", "3"]);
    for (_, result) in written.iter() {
        assert_eq!(result.info(), "Compile Error");
        assert!(result.zero_flag());
        assert_eq!(result.score(), 0.0);
    }
    assert_eq!(report.total(), 0.0);
}

#[test]
fn missing_source_file_is_a_compile_error() {
    let dir = workspace(&[]);
    let suite = r#"
name: oceansim
required_files: [source_code/OceanSim.cpp]
cases:
  - { id: "1", weight: 10, program: { command: ./a.out } }
"#;
    let mut sink = CountingSink::default();
    let report = run(dir.path(), suite, &mut sink);
    assert_eq!(
        report.results.get("1").unwrap().info(),
        "Compile Error: Source file not found"
    );
    assert_eq!(sink.writes.len(), 1);
}

#[test]
fn not_enough_contiguous_cores() {
    let dir = workspace(&[]);
    let suite = r#"
name: m4c
cores: { count: 2, contiguous: true, probe_limit: 8 }
cases:
  - { id: "1", weight: 10, program: { command: "true" } }
"#;
    let suite = Suite::from_yaml(suite, dir.path()).unwrap();
    let mut sink = CountingSink::default();
    let report = Harness::new(suite, quiet())
        .with_prober(FixedProber::new([0, 2, 4]))
        .with_sink(&mut sink)
        .run()
        .unwrap();

    let reason = "Not enough cores: need 2 but now is 1";
    assert_eq!(report.fatal.as_deref(), Some(reason));
    assert_eq!(report.results.get("1").unwrap().info(), reason);
    assert_eq!(sink.writes.len(), 1);
}

#[test]
fn uncontained_fallback_runs_unpinned() {
    let dir = workspace(&[]);
    let suite = r#"
name: hello
cases:
  - { id: "1", weight: 10, program: { command: "true" }, metric: { kind: constant, value: 1.0 } }
"#;
    let suite = Suite::from_yaml(suite, dir.path()).unwrap();
    let mut sink = CountingSink::default();
    let report = Harness::new(suite, quiet().with_allow_uncontained(true))
        .with_prober(FixedProber::new([]))
        .with_sink(&mut sink)
        .run()
        .unwrap();
    assert!(report.fatal.is_none());
    let case = report.results.get("1").unwrap();
    assert_eq!(case.info(), "Accepted");
    assert_eq!(case.score(), 10.0);
}

#[test]
fn two_line_format() {
    let dir = workspace(&[("good.sh", "echo 12.34; echo PASS\n"), ("bad.sh", "echo not-a-number; echo PASS\n")]);
    let suite = r#"
name: calculation
cores: { count: 0 }
cases:
  - id: good
    weight: 25
    program: { command: sh, args: [good.sh] }
    metric: { kind: first_line }
    validation: { kind: pass_token }
    curve: { family: log_interp, full: 1.0, base: 100.0 }
  - id: bad
    weight: 25
    program: { command: sh, args: [bad.sh] }
    metric: { kind: first_line }
    validation: { kind: pass_token }
    curve: { family: log_interp, full: 1.0, base: 100.0 }
"#;
    let mut sink = CountingSink::default();
    let report = run(dir.path(), suite, &mut sink);

    let good = report.results.get("good").unwrap();
    let expected = 25.0 * (100f64.ln() - 12.34f64.ln()) / (100f64.ln() - 1f64.ln());
    assert_eq!(good.performance(), 12.34);
    assert!((good.score() - expected).abs() < 1e-9);

    let bad = report.results.get("bad").unwrap();
    assert_eq!(bad.info(), "Wrong Answer");
    assert!(bad.zero_flag());
}

#[test]
fn slow_program_times_out() {
    let dir = workspace(&[]);
    let suite = r#"
name: wrf
cores: { count: 0 }
cases:
  - { id: "1", weight: 50, program: { command: sleep, args: ["10"], timeout_secs: 0.5 } }
"#;
    let mut sink = CountingSink::default();
    let start = std::time::Instant::now();
    let report = run(dir.path(), suite, &mut sink);
    assert!(start.elapsed() < std::time::Duration::from_secs(5));
    let case = report.results.get("1").unwrap();
    assert_eq!(case.info(), "Time Limit Exceeded");
    assert!(case.zero_flag());
}

#[test]
fn crashes_and_exit_codes() {
    let dir = workspace(&[]);
    let suite = r#"
name: crashes
cores: { count: 0 }
cases:
  - { id: segv, weight: 1, program: { command: sh, args: ["-c", "kill -SEGV $$"] } }
  - { id: exit, weight: 1, program: { command: sh, args: ["-c", "exit 3"] } }
  - { id: missing, weight: 1, program: { command: ./no-such-binary } }
"#;
    let mut sink = CountingSink::default();
    let report = run(dir.path(), suite, &mut sink);
    assert_eq!(
        report.results.get("segv").unwrap().info(),
        "Runtime Error: Segmentation fault"
    );
    assert_eq!(report.results.get("exit").unwrap().info(), "Runtime Error");
    let missing = report.results.get("missing").unwrap();
    assert!(missing.info().starts_with("Runtime Error: "), "{missing:?}");
    assert!(missing.zero_flag());
}

#[test]
fn reused_run_feeds_several_cases() {
    let dir = workspace(&[(
        "graph500.sh",
        "n=$(cat count 2>/dev/null || echo 0); echo $((n + 1)) > count\n\
         echo 'bfs  harmonic_mean_TEPS:     !  8.5e+08'\n\
         echo 'sssp harmonic_mean_TEPS:     !  2.0e+08'\n",
    )]);
    let suite = r#"
name: graph500
cores: { count: 0 }
cases:
  - id: bfs
    weight: 50
    program: { command: sh, args: [graph500.sh] }
    metric: { kind: teps, kernel: bfs }
    curve: { family: quadratic_ratio, full: 1.4e9, base: 3.0e8 }
  - id: sssp
    weight: 50
    reuse: bfs
    metric: { kind: teps, kernel: sssp }
    curve: { family: quadratic_ratio, full: 1.0e8, base: 1.0e7 }
"#;
    let mut sink = CountingSink::default();
    let report = run(dir.path(), suite, &mut sink);

    assert_eq!(fs::read_to_string(dir.path().join("count")).unwrap().trim(), "1");
    let bfs = report.results.get("bfs").unwrap();
    let expected = 50.0 * ((8.5e8 - 3.0e8) / (1.4e9 - 3.0e8f64)).powi(2);
    assert!((bfs.score() - expected).abs() < 1e-9);
    assert_eq!(bfs.info(), "Success");

    let sssp = report.results.get("sssp").unwrap();
    assert_eq!(sssp.performance(), 2.0e8);
    assert_eq!(sssp.score(), 50.0);
    assert_eq!(sssp.info(), "Accepted");
}

const WARM_UP_SCRIPT: &str = "n=$(cat count 2>/dev/null || echo 0); n=$((n + 1)); echo $n > count\n\
    if [ $n -eq 1 ]; then echo \"dequant cost $COLD s\"; else echo 'dequant cost 2.0 s'; fi\n";

fn warm_up_suite(cold: &str) -> String {
    format!(
        r#"
name: amazing_llm
cores: {{ count: 0 }}
cases:
  - id: "2"
    weight: 60
    program: {{ command: sh, args: [llm.sh], env: {{ COLD: "{cold}" }} }}
    metric: {{ kind: single_occurrence, pattern: 'dequant cost (\d+\.\d+) s' }}
    repeat: {{ runs: 3 }}
    curve: {{ family: log_interp, full: 1.0, base: 4.0 }}
"#
    )
}

#[test]
fn cold_start_within_bound_is_scored() {
    let dir = workspace(&[("llm.sh", WARM_UP_SCRIPT)]);
    let mut sink = CountingSink::default();
    let report = run(dir.path(), &warm_up_suite("3.4"), &mut sink);

    assert_eq!(fs::read_to_string(dir.path().join("count")).unwrap().trim(), "4");
    let case = report.results.get("2").unwrap();
    assert_eq!(case.performance(), 2.0);
    let expected = 60.0 * (4f64.ln() - 2f64.ln()) / (4f64.ln() - 1f64.ln());
    assert!((case.score() - expected).abs() < 1e-9);
}

#[test]
fn cold_start_too_long() {
    let dir = workspace(&[("llm.sh", WARM_UP_SCRIPT)]);
    let mut sink = CountingSink::default();
    let report = run(dir.path(), &warm_up_suite("9.0"), &mut sink);

    let case = report.results.get("2").unwrap();
    assert_eq!(case.info(), "Cold Start too Long");
    assert!(case.zero_flag());
    assert_eq!(case.performance(), 2.0);
}

#[test]
fn inputs_are_staged_per_case() {
    let dir = workspace(&[("inputs/case1.txt", "1 2 3\n"), ("sum.sh", "cat input.txt\n")]);
    let suite = r#"
name: rope_net
cores: { count: 0 }
cases:
  - id: "1"
    weight: 10
    program: { command: sh, args: [sum.sh] }
    inputs: [{ from: "inputs/case{case}.txt", to: input.txt }]
    validation: { kind: last_line_equals, expected: "1 2 3" }
  - id: "2"
    weight: 10
    program: { command: sh, args: [sum.sh] }
    inputs: [{ from: "inputs/case{case}.txt", to: input.txt }]
"#;
    let mut sink = CountingSink::default();
    let report = run(dir.path(), suite, &mut sink);

    assert_eq!(report.results.get("1").unwrap().info(), "Accepted");
    assert_eq!(report.results.get("1").unwrap().score(), 10.0);
    let missing = report.results.get("2").unwrap();
    assert_eq!(missing.info(), "Missing input file: inputs/case2.txt");
    assert!(missing.zero_flag());
}

#[test]
fn case_build_failure_only_zeroes_its_case() {
    let dir = workspace(&[
        ("ans.txt", "42\n"),
        ("quant/install.sh", "echo built >> ../builds.txt\n"),
        ("serve.sh", "echo 'dequant cost 2.0 s'\n"),
    ]);
    let suite = r#"
name: amazing_llm
cores: { count: 0 }
cases:
  - id: install
    weight: 30
    program: { command: cat, args: [ans.txt] }
    validation: { kind: last_line_equals, expected: "42" }
  - id: optimize
    weight: 70
    build:
      - { command: sh, args: [-c, "cd quant && sh install.sh && exit 1"] }
    program: { command: sh, args: [serve.sh] }
    metric: { kind: single_occurrence, pattern: 'dequant cost (\d+\.\d+) s' }
    repeat: { runs: 3 }
    curve: { family: log_interp, full: 0.9, base: 6.2 }
"#;
    let mut sink = CountingSink::default();
    let report = run(dir.path(), suite, &mut sink);

    assert!(report.fatal.is_none());
    let install = report.results.get("install").unwrap();
    assert_eq!(install.info(), "Accepted");
    assert_eq!(install.score(), 30.0);
    let optimize = report.results.get("optimize").unwrap();
    assert_eq!(optimize.info(), "Compile Error");
    assert!(optimize.zero_flag());

    let builds = fs::read_to_string(dir.path().join("builds.txt")).unwrap();
    assert_eq!(builds.lines().count(), 1);
}

#[test]
fn case_filter_limits_the_result_file() {
    let dir = workspace(&[]);
    let suite = r#"
name: hello
cores: { count: 0 }
cases:
  - { id: a, weight: 1, program: { command: "true" } }
  - { id: b, weight: 1, program: { command: "true" } }
"#;
    let suite = Suite::from_yaml(suite, dir.path()).unwrap();
    let mut sink = CountingSink::default();
    let report = Harness::new(suite, quiet())
        .with_sink(&mut sink)
        .with_cases(["b"])
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(report.results.len(), 1);
    assert!(report.results.contains("b"));
    assert!(!sink.writes[0].contains("a"));
}
