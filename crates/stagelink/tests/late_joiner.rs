// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stagelink developers

#![allow(clippy::uninlined_format_args)] // Test/bench code readability over pedantic
#![allow(clippy::cast_possible_truncation)] // Test parameters
#![allow(clippy::missing_panics_doc)] // Tests panic on failure
#![allow(clippy::too_many_lines)] // Test code
#![allow(clippy::needless_pass_by_value)] // Test functions

/// Mid-stream join, step skipping and multi-cohort reference counting.
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use stagelink::{
    Cohort, Context, LocalCohort, StepMode, StepStatus, StreamParams, VarType,
};

fn stream_params(dir: &std::path::Path, readers: usize) -> StreamParams {
    StreamParams {
        rendezvous_reader_count: readers,
        registration_dir: dir.to_path_buf(),
        open_timeout: Duration::from_secs(30),
        ..StreamParams::default()
    }
}

/// A reader joining mid-stream is replayed every queued timestep from the
/// oldest one still held, and receives format history for layouts announced
/// before it arrived (variable `b` first appears at timestep 2).
#[test]
fn late_joiner_replays_queued_steps_and_format_history() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = Arc::new(Context::in_process());
    let (ready_tx, ready_rx) = mpsc::channel();

    let writer = {
        let ctx = Arc::clone(&ctx);
        let dir = dir.path().to_path_buf();
        thread::spawn(move || {
            let cohort: Arc<dyn Cohort> = Arc::new(LocalCohort::group(1).remove(0));
            let mut w = ctx
                .open_writer(cohort, "replay", stream_params(&dir, 0))
                .expect("writer open");
            for step in 0..6u64 {
                if step == 3 {
                    // Three steps are queued with no reader attached; let
                    // one join now.
                    ready_tx.send(()).expect("signal reader");
                }
                if step >= 3 {
                    // Joins are serviced at step boundaries; give the
                    // registration time to land before each one.
                    thread::sleep(Duration::from_millis(100));
                }
                w.put_scalar("a", VarType::U64, &step.to_le_bytes())
                    .expect("put a");
                if step >= 2 {
                    w.put_scalar("b", VarType::U64, &(step * 7).to_le_bytes())
                        .expect("put b");
                }
                w.close_timestep().expect("close_timestep");
            }
            let stats = w.close().expect("writer close");
            assert_eq!(stats.timesteps, 6);
        })
    };

    let reader = {
        let ctx = Arc::clone(&ctx);
        let dir = dir.path().to_path_buf();
        thread::spawn(move || {
            ready_rx.recv().expect("writer signal");
            let cohort: Arc<dyn Cohort> = Arc::new(LocalCohort::group(1).remove(0));
            let mut r = ctx
                .open_reader(cohort, "replay", stream_params(&dir, 0))
                .expect("reader open");
            let mut seen = 0u64;
            loop {
                match r
                    .advance_step(StepMode::NextAvailable, Some(Duration::from_secs(10)))
                    .expect("advance")
                {
                    StepStatus::Success => {
                        let ts = r.current_step().expect("installed");
                        // Nothing was ever released, so replay starts at 0.
                        assert_eq!(ts, seen);
                        assert_eq!(r.get_scalar("a").expect("a"), ts.to_le_bytes());
                        let names = r.var_names().expect("names");
                        if ts >= 2 {
                            assert!(names.contains(&"b".to_string()));
                            assert_eq!(r.get_scalar("b").expect("b"), (ts * 7).to_le_bytes());
                        } else {
                            assert!(!names.contains(&"b".to_string()));
                        }
                        r.release_step().expect("release");
                        seen += 1;
                    }
                    StepStatus::EndOfStream => break,
                    other => panic!("unexpected step status {:?}", other),
                }
            }
            assert_eq!(seen, 6);
            r.close().expect("reader close");
        })
    };

    writer.join().expect("writer thread panicked");
    reader.join().expect("reader thread panicked");
}

/// `LatestAvailable` jumps over queued steps, releasing the skipped ones
/// unseen so the writer's reference counts still settle to zero.
#[test]
fn latest_mode_skips_to_newest_and_releases_skipped() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = Arc::new(Context::in_process());
    let (done_tx, done_rx) = mpsc::channel();

    let writer = {
        let ctx = Arc::clone(&ctx);
        let dir = dir.path().to_path_buf();
        thread::spawn(move || {
            let cohort: Arc<dyn Cohort> = Arc::new(LocalCohort::group(1).remove(0));
            let mut w = ctx
                .open_writer(cohort, "latest", stream_params(&dir, 1))
                .expect("writer open");
            for step in 0..4u64 {
                w.put_scalar("t", VarType::U64, &step.to_le_bytes())
                    .expect("put");
                w.close_timestep().expect("close_timestep");
            }
            done_tx.send(()).expect("signal reader");
            // Close drains: every queued step, skipped or consumed, must
            // come back released.
            w.close().expect("writer close");
        })
    };

    let reader = {
        let ctx = Arc::clone(&ctx);
        let dir = dir.path().to_path_buf();
        thread::spawn(move || {
            let cohort: Arc<dyn Cohort> = Arc::new(LocalCohort::group(1).remove(0));
            let mut r = ctx
                .open_reader(cohort, "latest", stream_params(&dir, 0))
                .expect("reader open");
            done_rx.recv().expect("writer signal");
            // Let the last announcement land before asking for the newest.
            thread::sleep(Duration::from_millis(200));

            assert!(matches!(
                r.advance_step(StepMode::LatestAvailable, Some(Duration::from_secs(10))),
                Ok(StepStatus::Success)
            ));
            assert_eq!(r.current_step(), Some(3));
            assert_eq!(r.get_scalar("t").expect("scalar"), 3u64.to_le_bytes());
            r.release_step().expect("release");

            assert!(matches!(
                r.advance_step(StepMode::NextAvailable, Some(Duration::from_secs(10))),
                Ok(StepStatus::EndOfStream)
            ));
            let stats = r.close().expect("reader close");
            assert_eq!(stats.timesteps, 1, "skipped steps are never installed");
        })
    };

    writer.join().expect("writer thread panicked");
    reader.join().expect("reader thread panicked");
}

/// Two independent reader cohorts each hold their own reference to every
/// timestep; the writer's close drain completes only after both released.
#[test]
fn two_reader_cohorts_each_consume_every_step() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = Arc::new(Context::in_process());

    let mut handles = Vec::new();
    {
        let ctx = Arc::clone(&ctx);
        let dir = dir.path().to_path_buf();
        handles.push(thread::spawn(move || {
            let cohort: Arc<dyn Cohort> = Arc::new(LocalCohort::group(1).remove(0));
            let mut w = ctx
                .open_writer(cohort, "fanout", stream_params(&dir, 2))
                .expect("writer open");
            for step in 0..3u64 {
                w.put_scalar("t", VarType::U64, &step.to_le_bytes())
                    .expect("put");
                w.close_timestep().expect("close_timestep");
            }
            let stats = w.close().expect("writer close");
            assert_eq!(stats.timesteps, 3);
        }));
    }

    for _ in 0..2 {
        let ctx = Arc::clone(&ctx);
        let dir = dir.path().to_path_buf();
        handles.push(thread::spawn(move || {
            let cohort: Arc<dyn Cohort> = Arc::new(LocalCohort::group(1).remove(0));
            let mut r = ctx
                .open_reader(cohort, "fanout", stream_params(&dir, 0))
                .expect("reader open");
            let mut seen = 0u64;
            loop {
                match r
                    .advance_step(StepMode::NextAvailable, Some(Duration::from_secs(10)))
                    .expect("advance")
                {
                    StepStatus::Success => {
                        let ts = r.current_step().expect("installed");
                        assert_eq!(ts, seen);
                        assert_eq!(r.get_scalar("t").expect("scalar"), ts.to_le_bytes());
                        r.release_step().expect("release");
                        seen += 1;
                    }
                    StepStatus::EndOfStream => break,
                    other => panic!("unexpected step status {:?}", other),
                }
            }
            assert_eq!(seen, 3);
            r.close().expect("reader close");
        }));
    }

    for h in handles {
        h.join().expect("rank thread panicked");
    }
}
