// ABOUTME: The polling state machine: open the store, then sleep, sample, and write on every tick.
// ABOUTME: Probe and storage failures share one consecutive-failure budget before the loop gives up.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use beacon_core::{ProbeError, ProbeSet, ProbeValue, Schema};
use beacon_store::{StatusStore, StoreError, StoreOpener};
use serde::Serialize;
use tracing::{debug, info, warn};

/// How a polling loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopOutcome {
    /// Stopped on request; the terminal marker was written.
    Finished,
    /// Exhausted the failure budget; the store was left without a marker.
    GaveUp,
    /// The store could not be opened, so nothing was ever sampled.
    OpenFailed,
}

enum TickFailure {
    Probe(ProbeError),
    Store(StoreError),
}

/// Samples a frozen probe set into a store until stopped or out of budget.
pub struct PollingLoop<O: StoreOpener> {
    opener: O,
    probes: ProbeSet,
    schema: Schema,
    statics: Vec<ProbeValue>,
    interval: Duration,
    max_errors: u32,
    started_at: Instant,
    stop: Arc<AtomicBool>,
}

impl<O: StoreOpener> PollingLoop<O> {
    /// Synthesize the schema for `probes` and prepare a loop over it.
    /// `started_at` is the logical start the `elapsed` probe counts from.
    pub fn new(
        opener: O,
        probes: ProbeSet,
        interval: Duration,
        max_errors: u32,
        started_at: Instant,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let schema = Schema::synthesize(&probes);
        let statics = probes.static_values();
        Self {
            opener,
            probes,
            schema,
            statics,
            interval,
            max_errors: max_errors.max(1),
            started_at,
            stop,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Run the loop to completion on the current thread.
    pub fn run(mut self) -> LoopOutcome {
        let path = self.opener.target().display().to_string();

        let mut store = match self.open() {
            Ok(store) => store,
            Err(e) => {
                warn!(path = %path, error = %e, "unable to open status file");
                return LoopOutcome::OpenFailed;
            }
        };
        info!(
            path = %path,
            interval_ms = self.interval.as_millis() as u64,
            max_errors = self.max_errors,
            "status polling started"
        );

        let mut errors = 0;
        loop {
            let last = self.sleep_until_next_tick();

            match self.tick(&mut store) {
                Ok(()) => errors = 0,
                Err(failure) => {
                    errors += 1;
                    match self.recover(store, failure, errors) {
                        Some(recovered) => store = recovered,
                        None => {
                            warn!(
                                path = %path,
                                max_errors = self.max_errors,
                                "unable to record status, giving up after {} errors",
                                self.max_errors
                            );
                            return LoopOutcome::GaveUp;
                        }
                    }
                }
            }

            if last {
                break;
            }
        }

        if let Err(e) = store.finalize() {
            warn!(path = %path, error = %e, "unable to mark status file as finished");
        }
        store.close();
        info!(path = %path, "status polling finished");
        LoopOutcome::Finished
    }

    fn open(&mut self) -> Result<O::Store, StoreError> {
        self.opener.open(&self.schema, &self.statics)
    }

    fn elapsed_secs(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    /// Park until the next tick is due or a stop is requested. Returns
    /// whether a stop was requested, which makes the coming tick the last.
    fn sleep_until_next_tick(&self) -> bool {
        let deadline = Instant::now() + self.interval;
        loop {
            let stopping = self.stop.load(Ordering::SeqCst);
            let now = Instant::now();
            if stopping || now >= deadline {
                return stopping;
            }
            thread::park_timeout(deadline - now);
        }
    }

    fn tick(&mut self, store: &mut O::Store) -> Result<(), TickFailure> {
        let values = self
            .probes
            .sample(self.elapsed_secs())
            .map_err(TickFailure::Probe)?;
        store.write_update(&values).map_err(TickFailure::Store)
    }

    /// Handle the `errors`-th consecutive failure. Returns the store to keep
    /// polling with, or `None` once the loop must give up (store closed).
    fn recover(
        &mut self,
        mut store: O::Store,
        failure: TickFailure,
        errors: u32,
    ) -> Option<O::Store> {
        let exhausted = errors >= self.max_errors;

        let storage_error = match failure {
            TickFailure::Probe(e) if exhausted => {
                warn!(error = %e, errors, "probe failed");
                store.close();
                return None;
            }
            TickFailure::Probe(e) => {
                warn!(error = %e, errors, "probe failed, recording error snapshot");
                match store.write_error(self.elapsed_secs(), e.message()) {
                    Ok(()) => return Some(store),
                    Err(write_error) => write_error,
                }
            }
            TickFailure::Store(e) if exhausted => {
                warn!(error = %e, errors, "status write failed");
                store.close();
                return None;
            }
            TickFailure::Store(e) => e,
        };

        warn!(error = %storage_error, errors, "status write failed, reopening status file");
        store.close();
        match self.open() {
            Ok(reopened) => {
                debug!("status file reopened");
                Some(reopened)
            }
            Err(e) => {
                warn!(error = %e, "unable to reopen status file");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::convert::Infallible;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use beacon_core::{ProbeRegistry, SqlType};
    use chrono::Utc;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Open,
        Update(Vec<ProbeValue>),
        Error(String),
        Finalize,
        Close,
    }

    /// Scripted store: each queued `false` makes the next open/write fail.
    #[derive(Default)]
    struct Script {
        calls: Vec<Call>,
        opens: VecDeque<bool>,
        writes: VecDeque<bool>,
    }

    #[derive(Clone, Default)]
    struct FakeOpener {
        script: Arc<Mutex<Script>>,
        path: PathBuf,
    }

    impl FakeOpener {
        fn scripted_opens(self, outcomes: &[bool]) -> Self {
            self.script.lock().unwrap().opens.extend(outcomes);
            self
        }

        fn scripted_writes(self, outcomes: &[bool]) -> Self {
            self.script.lock().unwrap().writes.extend(outcomes);
            self
        }

        fn calls(&self) -> Vec<Call> {
            self.script.lock().unwrap().calls.clone()
        }
    }

    struct FakeStore {
        script: Arc<Mutex<Script>>,
    }

    fn injected_failure() -> StoreError {
        StoreError::Write(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_IOERR),
            Some("injected failure".to_string()),
        ))
    }

    impl StoreOpener for FakeOpener {
        type Store = FakeStore;

        fn target(&self) -> &Path {
            &self.path
        }

        fn open(&mut self, _: &Schema, _: &[ProbeValue]) -> Result<FakeStore, StoreError> {
            let mut script = self.script.lock().unwrap();
            script.calls.push(Call::Open);
            if script.opens.pop_front() == Some(false) {
                return Err(injected_failure());
            }
            Ok(FakeStore {
                script: Arc::clone(&self.script),
            })
        }
    }

    impl FakeStore {
        fn record(&self, call: Call) -> Result<(), StoreError> {
            let mut script = self.script.lock().unwrap();
            script.calls.push(call);
            if script.writes.pop_front() == Some(false) {
                return Err(injected_failure());
            }
            Ok(())
        }
    }

    impl StatusStore for FakeStore {
        fn write_update(&mut self, values: &[ProbeValue]) -> Result<(), StoreError> {
            self.record(Call::Update(values.to_vec()))
        }

        fn write_error(&mut self, _: f64, error: &str) -> Result<(), StoreError> {
            self.record(Call::Error(error.to_string()))
        }

        fn finalize(&mut self) -> Result<(), StoreError> {
            self.script.lock().unwrap().calls.push(Call::Finalize);
            Ok(())
        }

        fn close(self) {
            self.script.lock().unwrap().calls.push(Call::Close);
        }
    }

    fn poller(
        opener: FakeOpener,
        probes: ProbeSet,
        max_errors: u32,
        stop: Arc<AtomicBool>,
    ) -> PollingLoop<FakeOpener> {
        PollingLoop::new(opener, probes, Duration::ZERO, max_errors, Instant::now(), stop)
    }

    /// A probe set whose single caller probe follows `pattern` (true = ok),
    /// then raises the stop signal once the pattern is exhausted.
    fn scripted_probes(pattern: Vec<bool>, stop: Arc<AtomicBool>) -> ProbeSet {
        let mut reg = ProbeRegistry::with_builtins(Utc::now(), 1);
        let mut step = 0usize;
        reg.add_updatable_typed("step", SqlType::Integer, move || {
            step += 1;
            if step >= pattern.len() {
                stop.store(true, Ordering::SeqCst);
            }
            match pattern.get(step - 1) {
                Some(false) => Err(format!("step {step} failed")),
                _ => Ok(step as i64),
            }
        })
        .unwrap();
        reg.freeze()
    }

    fn failing_probes() -> ProbeSet {
        let mut reg = ProbeRegistry::with_builtins(Utc::now(), 1);
        reg.add_updatable_typed("always", SqlType::Integer, || Err::<i64, _>("boom"))
            .unwrap();
        reg.freeze()
    }

    fn count(calls: &[Call], pred: impl Fn(&Call) -> bool) -> usize {
        calls.iter().filter(|c| pred(c)).count()
    }

    fn kinds(calls: &[Call]) -> Vec<&'static str> {
        calls
            .iter()
            .map(|c| match c {
                Call::Open => "open",
                Call::Update(_) => "update",
                Call::Error(_) => "error",
                Call::Finalize => "finalize",
                Call::Close => "close",
            })
            .collect()
    }

    #[test]
    fn open_failure_never_samples() {
        let opener = FakeOpener::default().scripted_opens(&[false]);
        let sampled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&sampled);
        let mut reg = ProbeRegistry::with_builtins(Utc::now(), 1);
        reg.add_updatable_typed("n", SqlType::Integer, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, Infallible>(1)
        })
        .unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let outcome = poller(opener.clone(), reg.freeze(), 3, stop).run();

        assert_eq!(outcome, LoopOutcome::OpenFailed);
        assert_eq!(opener.calls(), vec![Call::Open]);
        assert_eq!(sampled.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn stop_before_first_tick_performs_one_final_tick() {
        let opener = FakeOpener::default();
        let stop = Arc::new(AtomicBool::new(true));
        let mut reg = ProbeRegistry::with_builtins(Utc::now(), 1);
        reg.add_updatable_typed("n", SqlType::Integer, || Ok::<_, Infallible>(7))
            .unwrap();

        let outcome = poller(opener.clone(), reg.freeze(), 3, stop).run();

        assert_eq!(outcome, LoopOutcome::Finished);
        let calls = opener.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[0], Call::Open);
        match &calls[1] {
            Call::Update(values) => {
                assert!(matches!(values[0], ProbeValue::Float(s) if s >= 0.0));
                assert_eq!(values[1], ProbeValue::Null);
                assert_eq!(values[2], ProbeValue::Integer(7));
            }
            other => panic!("expected update, got {other:?}"),
        }
        assert_eq!(&calls[2..], &[Call::Finalize, Call::Close]);
    }

    #[test]
    fn failing_probe_gives_up_after_budget() {
        let opener = FakeOpener::default();
        let stop = Arc::new(AtomicBool::new(false));

        let outcome = poller(opener.clone(), failing_probes(), 3, stop).run();

        assert_eq!(outcome, LoopOutcome::GaveUp);
        assert_eq!(
            opener.calls(),
            vec![
                Call::Open,
                Call::Error("boom".to_string()),
                Call::Error("boom".to_string()),
                Call::Close,
            ]
        );
    }

    #[test]
    fn budget_of_one_gives_up_on_first_failure() {
        let opener = FakeOpener::default();
        let stop = Arc::new(AtomicBool::new(false));

        let outcome = poller(opener.clone(), failing_probes(), 1, stop).run();

        assert_eq!(outcome, LoopOutcome::GaveUp);
        assert_eq!(opener.calls(), vec![Call::Open, Call::Close]);
    }

    #[test]
    fn success_resets_the_failure_counter() {
        let opener = FakeOpener::default();
        let stop = Arc::new(AtomicBool::new(false));
        // Two failures, one success, repeated: never three in a row.
        let pattern = [false, false, true].repeat(4);
        let probes = scripted_probes(pattern, Arc::clone(&stop));

        let outcome = poller(opener.clone(), probes, 3, stop).run();

        assert_eq!(outcome, LoopOutcome::Finished);
        let calls = opener.calls();
        assert_eq!(count(&calls, |c| matches!(c, Call::Error(_))), 8);
        // Twelve scripted ticks plus the final one after the stop request.
        assert_eq!(count(&calls, |c| matches!(c, Call::Update(_))), 5);
        assert_eq!(count(&calls, |c| *c == Call::Open), 1);
        assert_eq!(calls.last(), Some(&Call::Close));
        assert!(calls.contains(&Call::Finalize));
        assert_eq!(calls[1], Call::Error("step 1 failed".to_string()));
    }

    #[test]
    fn storage_failure_reopens_and_continues() {
        let opener = FakeOpener::default().scripted_writes(&[false, false, true]);
        let stop = Arc::new(AtomicBool::new(false));
        let probes = scripted_probes(vec![true; 4], Arc::clone(&stop));

        let outcome = poller(opener.clone(), probes, 3, stop).run();

        assert_eq!(outcome, LoopOutcome::Finished);
        let calls = opener.calls();
        assert_eq!(
            kinds(&calls),
            vec![
                "open", "update", "close", "open", "update", "close", "open", "update", "update",
                "update", "finalize", "close",
            ]
        );
    }

    #[test]
    fn storage_failures_exhaust_the_budget() {
        let opener = FakeOpener::default().scripted_writes(&[false, false]);
        let stop = Arc::new(AtomicBool::new(false));
        let probes = scripted_probes(vec![true; 10], Arc::clone(&stop));

        let outcome = poller(opener.clone(), probes, 2, stop).run();

        assert_eq!(outcome, LoopOutcome::GaveUp);
        assert_eq!(
            kinds(&opener.calls()),
            vec!["open", "update", "close", "open", "update", "close"]
        );
    }

    #[test]
    fn failed_reopen_gives_up() {
        let opener = FakeOpener::default()
            .scripted_opens(&[true, false])
            .scripted_writes(&[false]);
        let stop = Arc::new(AtomicBool::new(false));
        let probes = scripted_probes(vec![true; 10], Arc::clone(&stop));

        let outcome = poller(opener.clone(), probes, 5, stop).run();

        assert_eq!(outcome, LoopOutcome::GaveUp);
        let calls = opener.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[2], Call::Close);
        assert_eq!(calls[3], Call::Open);
    }

    #[test]
    fn probe_and_storage_failures_share_one_budget() {
        // probe failure, storage failure, probe failure: three in a row.
        let opener = FakeOpener::default().scripted_writes(&[true, false]);
        let stop = Arc::new(AtomicBool::new(false));
        let probes = scripted_probes(vec![false, true, false, true, true], Arc::clone(&stop));

        let outcome = poller(opener.clone(), probes, 3, stop).run();

        assert_eq!(outcome, LoopOutcome::GaveUp);
        assert_eq!(
            kinds(&opener.calls()),
            vec!["open", "error", "update", "close", "open", "close"]
        );
    }

    #[test]
    fn failed_error_snapshot_is_treated_as_storage_failure() {
        let opener = FakeOpener::default().scripted_writes(&[false]);
        let stop = Arc::new(AtomicBool::new(false));
        let probes = scripted_probes(vec![false, true], Arc::clone(&stop));

        let outcome = poller(opener.clone(), probes, 3, stop).run();

        assert_eq!(outcome, LoopOutcome::Finished);
        let calls = opener.calls();
        assert_eq!(calls[1], Call::Error("step 1 failed".to_string()));
        assert_eq!(
            kinds(&calls),
            vec!["open", "error", "close", "open", "update", "update", "finalize", "close"]
        );
    }

    #[test]
    fn stop_wakes_a_long_sleep() {
        let opener = FakeOpener::default();
        let stop = Arc::new(AtomicBool::new(false));
        let mut reg = ProbeRegistry::with_builtins(Utc::now(), 1);
        reg.add_updatable_typed("n", SqlType::Integer, || Ok::<_, Infallible>(1))
            .unwrap();
        let probes = reg.freeze();
        let poller = PollingLoop::new(
            opener.clone(),
            probes,
            Duration::from_secs(3600),
            3,
            Instant::now(),
            Arc::clone(&stop),
        );

        let handle = thread::spawn(move || poller.run());
        thread::sleep(Duration::from_millis(50));
        let begin = Instant::now();
        stop.store(true, Ordering::SeqCst);
        handle.thread().unpark();
        let outcome = handle.join().unwrap();

        assert_eq!(outcome, LoopOutcome::Finished);
        assert!(begin.elapsed() < Duration::from_secs(10));
        assert_eq!(count(&opener.calls(), |c| matches!(c, Call::Update(_))), 1);
    }
}
