use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};

use rain_core::{Benchmark, Config, LoadProfile, LoadProfileConfig, ProfileStatus, TrackConfig};
use rain_test::workload::Workload;

fn profile(name: &str, duration_ms: u64, users: usize) -> LoadProfileConfig {
    LoadProfileConfig {
        name: Some(name.to_owned()),
        duration: Duration::from_millis(duration_ms),
        users,
        mix: "alternate".to_owned(),
        transition: Duration::ZERO,
        open_loop_max_ops_per_sec: 0,
    }
}

fn config(schedule: Vec<LoadProfileConfig>) -> Config {
    Config {
        time_to_start: Duration::ZERO,
        ramp_up: Duration::from_millis(100),
        duration: Duration::from_secs(1),
        ramp_down: Duration::from_millis(100),
        tracks: vec![TrackConfig {
            name: "web".to_owned(),
            generator: "scripted".to_owned(),
            mixes: BTreeMap::from([
                ("alternate".to_owned(), vec![vec![0.0, 1.0], vec![1.0, 0.0]]),
                ("uniform".to_owned(), vec![vec![1.0, 1.0], vec![1.0, 1.0]]),
            ]),
            load_schedule: schedule,
            ..Default::default()
        }],
        ..Default::default()
    }
}

#[test]
fn workers_follow_the_mix_matrix() {
    rain_test::tracing::init();

    let workload = Workload::new(["A", "B"]);
    let config = config(vec![profile("first", 300, 2), profile("second", 300, 2)]);
    let benchmark = Benchmark::new(config, workload.registry("scripted"));

    let report = benchmark.run(&mut Vec::new()).unwrap();

    let sequences = workload.recorder().sequences();
    assert_eq!(sequences.keys().copied().collect::<Vec<_>>(), [1, 2]);
    for (worker, sequence) in &sequences {
        assert!(sequence.len() > 2, "worker {worker} ran {sequence:?}");
        // Row 0 only allows B, so every user starts with B and then alternates.
        assert_eq!(sequence[0], "B");
        for pair in sequence.windows(2) {
            assert_ne!(pair[0], pair[1], "worker {worker} ran {sequence:?}");
        }
    }

    let track = report.track("web").unwrap();
    let card = track.final_scorecard.as_ref().unwrap();
    assert!(card.total_ops_successful > 0);
    assert_eq!(card.total_ops_failed, 0);
    assert_eq!(card.total_ops_async, 0);
    assert!(card.operations.contains_key("A"));
    assert!(card.operations.contains_key("B"));

    let intervals: Vec<_> = track.intervals.iter().map(|card| card.name.as_str()).collect();
    assert_eq!(intervals, ["first", "second"]);
}

#[test]
fn surplus_users_stay_idle() {
    let workload = Workload::new(["A", "B"]);
    let mut config = config(vec![profile("small", 5_000, 1)]);
    config.tracks[0].max_users = 3;
    let benchmark = Benchmark::new(config, workload.registry("scripted"));

    let report = benchmark.run(&mut Vec::new()).unwrap();

    let sequences = workload.recorder().sequences();
    assert_eq!(sequences.keys().copied().collect::<Vec<_>>(), [1]);

    let track = report.track("web").unwrap();
    assert_eq!(track.workers.len(), 3);
    assert!(track.workers[1..].iter().all(|w| w.sync_operations == 0));
}

#[test]
fn dynamic_profiles_take_over_at_next_advance() {
    rain_test::tracing::init();

    let workload = Workload::new(["A", "B"]);
    let mut config = config(vec![profile("base", 300, 1)]);
    config.tracks[0].max_users = 2;
    let benchmark = Benchmark::new(config, workload.registry("scripted"));

    let report = thread::scope(|scope| {
        let run = scope.spawn(|| benchmark.run(&mut Vec::new()));

        let deadline = Instant::now() + Duration::from_secs(1);
        let status = loop {
            let burst = LoadProfile::new(Duration::from_millis(300), 2, "alternate").named("burst");
            let status = benchmark.submit_dynamic_load_profile("web", burst);
            if status != ProfileStatus::TrackNotFound || Instant::now() > deadline {
                break status;
            }
            thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(status, ProfileStatus::Valid);

        let rejected = benchmark.submit_dynamic_load_profile(
            "web",
            LoadProfile::new(Duration::from_millis(300), 0, "alternate"),
        );
        assert_eq!(rejected, ProfileStatus::BadUserCount);
        assert_eq!(rejected.code(), 777);

        let unknown = benchmark.submit_dynamic_load_profile(
            "web",
            LoadProfile::new(Duration::from_millis(300), 1, "random"),
        );
        assert_eq!(unknown, ProfileStatus::UnknownMix);

        run.join().unwrap()
    })
    .unwrap();

    let track = report.track("web").unwrap();
    let intervals: Vec<_> = track.intervals.iter().map(|card| card.name.as_str()).collect();
    assert_eq!(intervals, ["base", "burst"]);

    // The second user only runs while the burst is active.
    let sequences = workload.recorder().sequences();
    assert!(sequences.contains_key(&2));
}

#[test]
fn writes_per_worker_logs() {
    let dir = tempfile::tempdir().unwrap();
    let workload = Workload::new(["A", "B"]).failing("A");
    let mut config = config(vec![profile("only", 5_000, 1)]);
    config.log_dir = Some(dir.path().to_owned());
    config.tracks[0].metric_snapshots = true;
    config.tracks[0].metric_snapshot_interval = Duration::from_millis(100);
    let benchmark = Benchmark::new(config, workload.registry("scripted"));

    let report = benchmark.run(&mut Vec::new()).unwrap();

    let snapshots = std::fs::read_to_string(dir.path().join("metrics-snapshots-web.log")).unwrap();
    let lines: Vec<_> = snapshots.lines().collect();
    assert!(!lines.is_empty());
    assert!(lines.iter().all(|line| line.starts_with("[only] ") && line.contains(" B ")));

    let trace = std::fs::read_to_string(dir.path().join("thread-web.Generator-1.log")).unwrap();
    assert!(trace.lines().any(|line| line.ends_with("B 1 worker 1 ran B")));

    let errors =
        std::fs::read_to_string(dir.path().join("error-thread-web.Generator-1.log")).unwrap();
    assert!(errors.lines().all(|line| line == "[web.Generator-1] A failed"));
    assert!(!errors.is_empty());

    let track = report.track("web").unwrap();
    assert!(track.errors["A failed (error)"] > 0);
    let card = track.final_scorecard.as_ref().unwrap();
    assert!(card.total_ops_failed > 0);
    assert!(card.total_ops_successful > 0);
    assert_eq!(lines.len() as u64, card.total_ops_successful);
}

#[test]
fn open_loop_coin_is_independent_of_the_mix() {
    let workload = Workload::new(["A", "B"])
        .think_time(Duration::from_millis(2))
        .cycle_time(Duration::from_millis(2));
    let mut schedule = profile("mixed", 5_000, 2);
    schedule.mix = "uniform".to_owned();
    let mut config = config(vec![schedule]);
    config.duration = Duration::from_millis(800);
    config.tracks[0].open_loop_probability = 0.5;
    let benchmark = Benchmark::new(config, workload.registry("scripted"));

    let report = benchmark.run(&mut Vec::new()).unwrap();

    let track = report.track("web").unwrap();
    assert!(track.workers.iter().all(|w| w.async_operations > 0));
    assert!(track.workers.iter().all(|w| w.sync_operations > 0));

    let card = track.final_scorecard.as_ref().unwrap();
    assert!(card.total_ops_async > 0);
    assert!(card.total_ops_sync > 0);
    for name in ["A", "B"] {
        let summary = &card.operations[name];
        assert!(summary.async_invocations > 0, "{name} never ran async: {summary:?}");
        assert!(summary.sync_invocations > 0, "{name} never ran sync: {summary:?}");
    }
}

#[test]
fn open_loop_rate_limit_caps_submissions() {
    let workload = Workload::new(["A", "B"]).cycle_time(Duration::from_millis(1));
    let mut schedule = profile("limited", 5_000, 2);
    schedule.open_loop_max_ops_per_sec = 20;
    let mut config = config(vec![schedule]);
    config.tracks[0].open_loop_probability = 1.0;
    let benchmark = Benchmark::new(config, workload.registry("scripted"));

    let report = benchmark.run(&mut Vec::new()).unwrap();

    // Each of the two users gets a slot every 2 * 1000 / (20 / 2) = 200ms and submits once when
    // the held-back slot opens and once more right after it, so the track stays near 20 ops/s
    // over the 1.2s run.
    let total = workload.recorder().total();
    assert!(total >= 8, "only {total} operations ran");
    assert!(total <= 32, "{total} operations ran despite the rate limit");

    let track = report.track("web").unwrap();
    assert!(track.workers.iter().all(|w| w.sync_operations == 0));
    let card = track.final_scorecard.as_ref().unwrap();
    assert_eq!(card.total_ops_sync, 0);
    assert!(card.total_ops_async > 0);
    assert!(card.effective_load() <= 25.0, "effective load {}", card.effective_load());
}
