// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 stagelink developers

#![allow(clippy::uninlined_format_args)] // Test/bench code readability over pedantic
#![allow(clippy::cast_precision_loss)] // Test data conversions
#![allow(clippy::cast_possible_truncation)] // Test parameters
#![allow(clippy::float_cmp)] // Test assertions with constants
#![allow(clippy::missing_panics_doc)] // Tests panic on failure
#![allow(clippy::too_many_lines)] // Test code
#![allow(clippy::needless_pass_by_value)] // Test functions

/// End-to-end writer/reader cohort scenarios over the in-process net.
///
/// Each test spawns one thread per rank; collective calls (open, close,
/// close_timestep, release_step) must be issued concurrently by every rank
/// of a cohort, exactly as an MPI program would.
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use stagelink::{
    Cohort, Context, LocalCohort, QueueFullPolicy, Selection, StepMode, StepStatus, StreamParams,
    VarType,
};

fn stream_params(dir: &std::path::Path, readers: usize) -> StreamParams {
    StreamParams {
        rendezvous_reader_count: readers,
        registration_dir: dir.to_path_buf(),
        open_timeout: Duration::from_secs(30),
        ..StreamParams::default()
    }
}

fn f64_block(vals: &[f64]) -> Vec<u8> {
    vals.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn f64s(bytes: &[u8]) -> Vec<f64> {
    bytes
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

/// Two writer ranks stream five timesteps of a 1-D array to a single-rank
/// reader cohort; the reader reassembles the full array every step.
#[test]
fn two_writer_ranks_stream_to_one_reader() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = Arc::new(Context::in_process());

    let mut handles = Vec::new();
    for cohort in LocalCohort::group(2) {
        let ctx = Arc::clone(&ctx);
        let dir = dir.path().to_path_buf();
        handles.push(thread::spawn(move || {
            let rank = cohort.rank() as u64;
            let cohort: Arc<dyn Cohort> = Arc::new(cohort);
            let mut w = ctx
                .open_writer(cohort, "e2e", stream_params(&dir, 1))
                .expect("writer open");
            for step in 0..5u64 {
                let vals: Vec<f64> = (0..5).map(|i| (step * 100 + rank * 5 + i) as f64).collect();
                w.put_array(
                    "u",
                    VarType::F64,
                    &[10],
                    &[rank * 5],
                    &[5],
                    &f64_block(&vals),
                )
                .expect("put u");
                w.put_scalar("step", VarType::U64, &step.to_le_bytes())
                    .expect("put step");
                assert_eq!(w.close_timestep().expect("close_timestep"), step);
            }
            let stats = w.close().expect("writer close");
            assert_eq!(stats.timesteps, 5);
            assert_eq!(stats.timesteps_discarded, 0);
        }));
    }

    {
        let ctx = Arc::clone(&ctx);
        let dir = dir.path().to_path_buf();
        handles.push(thread::spawn(move || {
            let cohort: Arc<dyn Cohort> = Arc::new(LocalCohort::group(1).remove(0));
            let mut r = ctx
                .open_reader(cohort, "e2e", stream_params(&dir, 0))
                .expect("reader open");
            let mut seen = 0u64;
            loop {
                match r
                    .advance_step(StepMode::NextAvailable, Some(Duration::from_secs(10)))
                    .expect("advance")
                {
                    StepStatus::Success => {
                        let ts = r.current_step().expect("installed");
                        assert_eq!(ts, seen, "steps must arrive in order");

                        let (vtype, shape) = r.var_geometry("u").expect("geometry");
                        assert_eq!(vtype, VarType::F64);
                        assert_eq!(shape, vec![10]);
                        assert_eq!(r.get_scalar("step").expect("scalar"), ts.to_le_bytes());

                        let tok = r
                            .get_deferred("u", Selection::new(vec![0], vec![10]))
                            .expect("defer");
                        let results = r.perform_gets().expect("perform");
                        assert_eq!(results.len(), 1);
                        assert_eq!(results[0].token, tok);
                        let expected: Vec<f64> = (0..10).map(|g| (ts * 100 + g) as f64).collect();
                        assert_eq!(f64s(&results[0].data), expected);

                        let sub = r
                            .get_sync("u", Selection::new(vec![3], vec![4]))
                            .expect("sync get");
                        assert_eq!(f64s(&sub), &expected[3..7]);

                        r.release_step().expect("release");
                        seen += 1;
                    }
                    StepStatus::EndOfStream => break,
                    other => panic!("unexpected step status {:?}", other),
                }
            }
            assert_eq!(seen, 5);
            let stats = r.close().expect("reader close");
            assert_eq!(stats.timesteps, 5);
        }));
    }

    for h in handles {
        h.join().expect("rank thread panicked");
    }
}

/// Two writer ranks, two reader ranks: announcements, releases and close
/// notices each flow through the rank partition exactly once, and a
/// selection spanning both writer blocks assembles correctly on each rank.
#[test]
fn two_by_two_cohorts_partition_cleanly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = Arc::new(Context::in_process());

    let mut handles = Vec::new();
    for cohort in LocalCohort::group(2) {
        let ctx = Arc::clone(&ctx);
        let dir = dir.path().to_path_buf();
        handles.push(thread::spawn(move || {
            let rank = cohort.rank() as u64;
            let cohort: Arc<dyn Cohort> = Arc::new(cohort);
            let mut w = ctx
                .open_writer(cohort, "grid", stream_params(&dir, 1))
                .expect("writer open");
            for step in 0..3u64 {
                let vals: Vec<f64> = (0..4).map(|i| (step * 10 + rank * 4 + i) as f64).collect();
                w.put_array(
                    "v",
                    VarType::F64,
                    &[8],
                    &[rank * 4],
                    &[4],
                    &f64_block(&vals),
                )
                .expect("put v");
                w.close_timestep().expect("close_timestep");
            }
            let stats = w.close().expect("writer close");
            assert_eq!(stats.timesteps, 3);
        }));
    }

    for cohort in LocalCohort::group(2) {
        let ctx = Arc::clone(&ctx);
        let dir = dir.path().to_path_buf();
        handles.push(thread::spawn(move || {
            let cohort: Arc<dyn Cohort> = Arc::new(cohort);
            let mut r = ctx
                .open_reader(cohort, "grid", stream_params(&dir, 0))
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

                        // Crosses the block boundary at index 4.
                        r.get_deferred("v", Selection::new(vec![2], vec![4]))
                            .expect("defer");
                        let results = r.perform_gets().expect("perform");
                        let expected: Vec<f64> = (2..6).map(|g| (ts * 10 + g) as f64).collect();
                        assert_eq!(f64s(&results[0].data), expected);

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

/// With a bounded queue and the blocking policy, the writer throttles to
/// the reader's release rate instead of discarding anything.
#[test]
fn block_policy_throttles_writer_until_reader_releases() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = Arc::new(Context::in_process());

    let writer = {
        let ctx = Arc::clone(&ctx);
        let dir = dir.path().to_path_buf();
        thread::spawn(move || {
            let cohort: Arc<dyn Cohort> = Arc::new(LocalCohort::group(1).remove(0));
            let params = StreamParams {
                queue_limit: 2,
                queue_full_policy: QueueFullPolicy::Block,
                ..stream_params(&dir, 1)
            };
            let mut w = ctx.open_writer(cohort, "throttle", params).expect("writer open");
            for step in 0..5u64 {
                w.put_scalar("t", VarType::U64, &step.to_le_bytes())
                    .expect("put");
                w.close_timestep().expect("close_timestep");
            }
            let stats = w.close().expect("writer close");
            assert_eq!(stats.timesteps, 5);
            assert_eq!(stats.timesteps_discarded, 0);
        })
    };

    let reader = {
        let ctx = Arc::clone(&ctx);
        let dir = dir.path().to_path_buf();
        thread::spawn(move || {
            let cohort: Arc<dyn Cohort> = Arc::new(LocalCohort::group(1).remove(0));
            let mut r = ctx
                .open_reader(cohort, "throttle", stream_params(&dir, 0))
                .expect("reader open");
            let mut seen = 0u64;
            loop {
                match r
                    .advance_step(StepMode::NextAvailable, Some(Duration::from_secs(10)))
                    .expect("advance")
                {
                    StepStatus::Success => {
                        let ts = r.current_step().expect("installed");
                        assert_eq!(r.get_scalar("t").expect("scalar"), ts.to_le_bytes());
                        // A slow consumer forces the writer into its
                        // queue-full wait.
                        thread::sleep(Duration::from_millis(50));
                        r.release_step().expect("release");
                        seen += 1;
                    }
                    StepStatus::EndOfStream => break,
                    other => panic!("unexpected step status {:?}", other),
                }
            }
            assert_eq!(seen, 5);
            r.close().expect("reader close");
        })
    };

    writer.join().expect("writer thread panicked");
    reader.join().expect("reader thread panicked");
}

/// A timestep discarded before announcement must not push the end-of-stream
/// marker past what the reader can ever receive: after the writer closes,
/// the reader still reaches `EndOfStream` instead of timing out forever.
#[test]
fn discard_of_incoming_step_still_ends_the_stream() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = Arc::new(Context::in_process());
    let (held_tx, held_rx) = mpsc::channel();
    let (discarded_tx, discarded_rx) = mpsc::channel();

    let writer = {
        let ctx = Arc::clone(&ctx);
        let dir = dir.path().to_path_buf();
        thread::spawn(move || {
            let cohort: Arc<dyn Cohort> = Arc::new(LocalCohort::group(1).remove(0));
            let params = StreamParams {
                queue_limit: 1,
                queue_full_policy: QueueFullPolicy::Discard,
                ..stream_params(&dir, 1)
            };
            let mut w = ctx.open_writer(cohort, "discard", params).expect("writer open");
            w.put_scalar("t", VarType::U64, &0u64.to_le_bytes()).expect("put");
            w.close_timestep().expect("close_timestep");

            // Step 0 is installed on the reader and held; the queue is full
            // with nothing evictable, so step 1 is dropped on the floor.
            held_rx.recv().expect("reader signal");
            w.put_scalar("t", VarType::U64, &1u64.to_le_bytes()).expect("put");
            w.close_timestep().expect("close_timestep");
            discarded_tx.send(()).expect("signal reader");

            let stats = w.close().expect("writer close");
            assert_eq!(stats.timesteps, 1);
            assert_eq!(stats.timesteps_discarded, 1);
        })
    };

    let reader = {
        let ctx = Arc::clone(&ctx);
        let dir = dir.path().to_path_buf();
        thread::spawn(move || {
            let cohort: Arc<dyn Cohort> = Arc::new(LocalCohort::group(1).remove(0));
            let mut r = ctx
                .open_reader(cohort, "discard", stream_params(&dir, 0))
                .expect("reader open");
            assert!(matches!(
                r.advance_step(StepMode::NextAvailable, Some(Duration::from_secs(10))),
                Ok(StepStatus::Success)
            ));
            assert_eq!(r.current_step(), Some(0));
            held_tx.send(()).expect("signal writer");

            discarded_rx.recv().expect("writer signal");
            r.release_step().expect("release");
            assert!(matches!(
                r.advance_step(StepMode::NextAvailable, Some(Duration::from_secs(10))),
                Ok(StepStatus::EndOfStream)
            ));
            let stats = r.close().expect("reader close");
            assert_eq!(stats.timesteps, 1);
        })
    };

    writer.join().expect("writer thread panicked");
    reader.join().expect("reader thread panicked");
}

/// A writer blocked on a full queue with no readers attached must still
/// admit a cohort that registers during the wait; the newcomer's releases
/// are what let the writer proceed.
#[test]
fn block_policy_admits_reader_while_queue_is_full() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = Arc::new(Context::in_process());

    let writer = {
        let ctx = Arc::clone(&ctx);
        let dir = dir.path().to_path_buf();
        thread::spawn(move || {
            let cohort: Arc<dyn Cohort> = Arc::new(LocalCohort::group(1).remove(0));
            let params = StreamParams {
                queue_limit: 1,
                queue_full_policy: QueueFullPolicy::Block,
                ..stream_params(&dir, 0)
            };
            let mut w = ctx.open_writer(cohort, "fullwait", params).expect("writer open");
            w.put_scalar("t", VarType::U64, &0u64.to_le_bytes()).expect("put");
            w.close_timestep().expect("close_timestep");
            // The queue is now full; this call waits inside the queue-full
            // loop until the late reader has been admitted and released 0.
            w.put_scalar("t", VarType::U64, &1u64.to_le_bytes()).expect("put");
            w.close_timestep().expect("close_timestep");
            let stats = w.close().expect("writer close");
            assert_eq!(stats.timesteps, 2);
            assert_eq!(stats.timesteps_discarded, 0);
        })
    };

    let reader = {
        let ctx = Arc::clone(&ctx);
        let dir = dir.path().to_path_buf();
        thread::spawn(move || {
            // Register only after the writer is parked on its full queue.
            thread::sleep(Duration::from_millis(300));
            let cohort: Arc<dyn Cohort> = Arc::new(LocalCohort::group(1).remove(0));
            let mut r = ctx
                .open_reader(cohort, "fullwait", stream_params(&dir, 0))
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
            assert_eq!(seen, 2);
            r.close().expect("reader close");
        })
    };

    writer.join().expect("writer thread panicked");
    reader.join().expect("reader thread panicked");
}

/// In `LatestAvailable` mode a timeout is a cohort-wide verdict: ranks with
/// different deadlines (one expiring before the first announcement) must
/// all report `Timeout` together, and the next advance must agree on the
/// same step everywhere.
#[test]
fn latest_mode_agrees_on_timeout_across_ranks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = Arc::new(Context::in_process());

    let writer = {
        let ctx = Arc::clone(&ctx);
        let dir = dir.path().to_path_buf();
        thread::spawn(move || {
            let cohort: Arc<dyn Cohort> = Arc::new(LocalCohort::group(1).remove(0));
            let mut w = ctx
                .open_writer(cohort, "lagged", stream_params(&dir, 1))
                .expect("writer open");
            // First announcement lands well after rank 1's short deadline.
            thread::sleep(Duration::from_millis(500));
            w.put_scalar("t", VarType::U64, &0u64.to_le_bytes()).expect("put");
            w.close_timestep().expect("close_timestep");
            w.close().expect("writer close");
        })
    };

    let mut handles = vec![writer];
    for cohort in LocalCohort::group(2) {
        let ctx = Arc::clone(&ctx);
        let dir = dir.path().to_path_buf();
        handles.push(thread::spawn(move || {
            let timeout = if cohort.rank() == 0 {
                Duration::from_secs(2)
            } else {
                Duration::from_millis(50)
            };
            let cohort: Arc<dyn Cohort> = Arc::new(cohort);
            let mut r = ctx
                .open_reader(cohort, "lagged", stream_params(&dir, 0))
                .expect("reader open");
            assert!(matches!(
                r.advance_step(StepMode::LatestAvailable, Some(timeout)),
                Ok(StepStatus::Timeout)
            ));
            assert!(matches!(
                r.advance_step(StepMode::LatestAvailable, Some(Duration::from_secs(10))),
                Ok(StepStatus::Success)
            ));
            assert_eq!(r.current_step(), Some(0));
            r.release_step().expect("release");
            assert!(matches!(
                r.advance_step(StepMode::NextAvailable, Some(Duration::from_secs(10))),
                Ok(StepStatus::EndOfStream)
            ));
            r.close().expect("reader close");
        }));
    }

    for h in handles {
        h.join().expect("rank thread panicked");
    }
}

/// `advance_step` with a timeout reports `Timeout` while the writer is
/// idle, then succeeds once a step is announced.
#[test]
fn advance_times_out_when_no_step_is_available() {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctx = Arc::new(Context::in_process());

    let writer = {
        let ctx = Arc::clone(&ctx);
        let dir = dir.path().to_path_buf();
        thread::spawn(move || {
            let cohort: Arc<dyn Cohort> = Arc::new(LocalCohort::group(1).remove(0));
            let mut w = ctx
                .open_writer(cohort, "idle", stream_params(&dir, 1))
                .expect("writer open");
            // Stay idle long enough for the reader's first advance to expire.
            thread::sleep(Duration::from_millis(400));
            w.put_scalar("t", VarType::U64, &0u64.to_le_bytes())
                .expect("put");
            w.close_timestep().expect("close_timestep");
            w.close().expect("writer close");
        })
    };

    let reader = {
        let ctx = Arc::clone(&ctx);
        let dir = dir.path().to_path_buf();
        thread::spawn(move || {
            let cohort: Arc<dyn Cohort> = Arc::new(LocalCohort::group(1).remove(0));
            let mut r = ctx
                .open_reader(cohort, "idle", stream_params(&dir, 0))
                .expect("reader open");
            assert!(matches!(
                r.advance_step(StepMode::NextAvailable, Some(Duration::from_millis(100))),
                Ok(StepStatus::Timeout)
            ));
            assert!(matches!(
                r.advance_step(StepMode::NextAvailable, Some(Duration::from_secs(10))),
                Ok(StepStatus::Success)
            ));
            r.release_step().expect("release");
            assert!(matches!(
                r.advance_step(StepMode::NextAvailable, Some(Duration::from_secs(10))),
                Ok(StepStatus::EndOfStream)
            ));
            r.close().expect("reader close");
        })
    };

    writer.join().expect("writer thread panicked");
    reader.join().expect("reader thread panicked");
}
