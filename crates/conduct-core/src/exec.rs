//! Batch execution of tool calls.
//!
//! Three contracts over one dispatch capability:
//! - [`run_parallel`](BatchExecutor::run_parallel): bounded fan-out with
//!   fault isolation,
//! - [`run_with_dependencies`](BatchExecutor::run_with_dependencies):
//!   rounds of ready calls gated on batch-local indices,
//! - [`run_sequential`](BatchExecutor::run_sequential): strict order,
//!   fail-fast.
//!
//! Results are always aligned with the input batch by index, regardless of
//! completion order.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::Limits;
use crate::error::{Error, Result};
use crate::outcome::{ToolCall, ToolOutput};

/// Boxed future returned by dispatch implementations.
pub type DispatchFuture = Pin<Box<dyn Future<Output = ToolOutput> + Send>>;

/// A capability that can execute one named tool call.
///
/// Implementations build a `'static` future by cloning whatever state they
/// need; the executors never borrow across a spawn.
pub trait ToolDispatch: Send + Sync {
    fn dispatch(&self, name: &str, args: Value) -> DispatchFuture;
}

/// Schedules batches of tool calls against a dispatch capability.
pub struct BatchExecutor {
    dispatch: Arc<dyn ToolDispatch>,
    parallel_calls: usize,
}

impl BatchExecutor {
    pub fn new(dispatch: Arc<dyn ToolDispatch>) -> Self {
        Self {
            dispatch,
            parallel_calls: Limits::DEFAULT_PARALLEL_CALLS,
        }
    }

    /// Overrides the concurrency cap for [`run_parallel`](Self::run_parallel).
    /// A cap of zero is treated as one.
    #[must_use]
    pub fn with_parallel_calls(mut self, cap: usize) -> Self {
        self.parallel_calls = cap.max(1);
        self
    }

    /// Runs independent calls concurrently, at most `parallel_calls` in
    /// flight at any instant (FIFO admission through a semaphore).
    ///
    /// One call's failure is recorded as its own entry and neither cancels
    /// nor blocks siblings.
    pub async fn run_parallel(&self, calls: Vec<ToolCall>) -> Vec<ToolOutput> {
        let len = calls.len();
        let gate = Arc::new(Semaphore::new(self.parallel_calls));
        let mut join_set = JoinSet::new();

        for (index, call) in calls.into_iter().enumerate() {
            let gate = Arc::clone(&gate);
            let dispatch = Arc::clone(&self.dispatch);
            join_set.spawn(async move {
                let output = match gate.acquire_owned().await {
                    Ok(_permit) => dispatch.dispatch(&call.name, call.args).await,
                    Err(_) => ToolOutput::failure("internal", "executor gate closed"),
                };
                (index, output)
            });
        }

        let mut results: Vec<Option<ToolOutput>> = vec![None; len];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, output)) => results[index] = Some(output),
                Err(err) => warn!(error = %err, "batch call panicked"),
            }
        }
        results
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| ToolOutput::failure("internal", "call panicked")))
            .collect()
    }

    /// Runs a batch whose calls carry dependency indices into the same
    /// batch. Each round launches every ready call — a call is ready once
    /// all of its dependencies have *executed*, successfully or not — and
    /// waits for the round to finish before computing the next ready set.
    ///
    /// Rounds are launched without a concurrency cap: a wide dependency
    /// level can put many subprocesses in flight at once. Use
    /// [`run_parallel`](Self::run_parallel) when calls are independent and
    /// bounding matters.
    ///
    /// # Errors
    /// Returns [`Error::StalledDependencies`] when no remaining call can
    /// become ready (a cycle, or an out-of-range index). Calls that already
    /// executed keep their results inside the error.
    pub async fn run_with_dependencies(&self, calls: Vec<ToolCall>) -> Result<Vec<ToolOutput>> {
        let len = calls.len();
        let dependencies: Vec<Vec<usize>> = calls.iter().map(|c| c.dependencies.clone()).collect();
        let mut calls: Vec<Option<ToolCall>> = calls.into_iter().map(Some).collect();
        let mut executed = vec![false; len];
        let mut results: Vec<Option<ToolOutput>> = vec![None; len];
        let mut remaining = len;

        while remaining > 0 {
            let ready: Vec<usize> = (0..len)
                .filter(|&i| {
                    !executed[i]
                        && dependencies[i]
                            .iter()
                            .all(|&dep| executed.get(dep).copied().unwrap_or(false))
                })
                .collect();

            if ready.is_empty() {
                let stuck: Vec<usize> = (0..len).filter(|&i| !executed[i]).collect();
                let completed: Vec<(usize, ToolOutput)> = results
                    .iter()
                    .enumerate()
                    .filter_map(|(i, slot)| slot.clone().map(|output| (i, output)))
                    .collect();
                warn!(?stuck, "dependency batch cannot make progress");
                return Err(Error::StalledDependencies { stuck, completed });
            }

            debug!(round = ready.len(), remaining, "launching ready set");
            let mut join_set = JoinSet::new();
            for &index in &ready {
                if let Some(call) = calls[index].take() {
                    let dispatch = Arc::clone(&self.dispatch);
                    join_set.spawn(async move {
                        (index, dispatch.dispatch(&call.name, call.args).await)
                    });
                }
            }
            while let Some(joined) = join_set.join_next().await {
                if let Ok((index, output)) = joined {
                    results[index] = Some(output);
                }
            }
            // A panicked call still counts as executed so the batch can
            // make progress; its slot records the failure.
            for &index in &ready {
                if results[index].is_none() {
                    results[index] = Some(ToolOutput::failure("internal", "call panicked"));
                }
                executed[index] = true;
                remaining -= 1;
            }
        }

        Ok(results
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| ToolOutput::failure("internal", "missing result")))
            .collect())
    }

    /// Runs calls strictly in order, stopping at the first non-success.
    /// The returned partial results include the failing entry.
    pub async fn run_sequential(&self, calls: Vec<ToolCall>) -> Vec<ToolOutput> {
        let mut results = Vec::with_capacity(calls.len());
        for (index, call) in calls.into_iter().enumerate() {
            let output = self.dispatch.dispatch(&call.name, call.args).await;
            let ok = output.is_ok();
            results.push(output);
            if !ok {
                debug!(index, "sequential batch stopped at first failure");
                break;
            }
        }
        results
    }
}

impl std::fmt::Debug for BatchExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchExecutor")
            .field("parallel_calls", &self.parallel_calls)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;

    /// Shared bookkeeping for the stub dispatcher: execution order and the
    /// in-flight high-water mark.
    #[derive(Default)]
    struct StubDispatch {
        in_flight: AtomicUsize,
        high_water: AtomicUsize,
        executed: Mutex<Vec<String>>,
    }

    impl StubDispatch {
        fn executed(&self) -> Vec<String> {
            self.executed.lock().clone()
        }

        fn high_water(&self) -> usize {
            self.high_water.load(Ordering::SeqCst)
        }
    }

    /// Dispatcher adapter: sleeps per `delay_ms`, fails on `fail: true`,
    /// records into the shared stub state.
    struct ArcDispatch(Arc<StubDispatch>);

    impl ToolDispatch for ArcDispatch {
        fn dispatch(&self, name: &str, args: Value) -> DispatchFuture {
            let stub = Arc::clone(&self.0);
            let name = name.to_string();
            Box::pin(async move {
                let in_flight = stub.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                stub.high_water.fetch_max(in_flight, Ordering::SeqCst);

                let delay_ms = args.get("delay_ms").and_then(Value::as_u64).unwrap_or(5);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;

                stub.in_flight.fetch_sub(1, Ordering::SeqCst);
                stub.executed.lock().push(name.clone());

                if args.get("fail").and_then(Value::as_bool) == Some(true) {
                    ToolOutput::failure("stub_error", format!("{name} failed"))
                } else {
                    ToolOutput::success(json!({"name": name}))
                }
            })
        }
    }

    fn executor(stub: &Arc<StubDispatch>) -> BatchExecutor {
        BatchExecutor::new(Arc::new(ArcDispatch(Arc::clone(stub))))
    }

    fn call(name: &str, args: Value) -> ToolCall {
        ToolCall::new(name, args)
    }

    #[tokio::test]
    async fn parallel_results_align_with_input_order() {
        let stub = Arc::new(StubDispatch::default());
        let exec = executor(&stub);

        // Later calls finish first thanks to decreasing delays.
        let calls = vec![
            call("slow", json!({"delay_ms": 60})),
            call("medium", json!({"delay_ms": 30})),
            call("fast", json!({"delay_ms": 1})),
        ];
        let results = exec.run_parallel(calls).await;

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].data().unwrap()["name"], "slow");
        assert_eq!(results[1].data().unwrap()["name"], "medium");
        assert_eq!(results[2].data().unwrap()["name"], "fast");
    }

    #[tokio::test]
    async fn parallel_respects_the_concurrency_cap() {
        let stub = Arc::new(StubDispatch::default());
        let exec = executor(&stub).with_parallel_calls(2);

        let calls: Vec<ToolCall> = (0..8)
            .map(|i| call(&format!("c{i}"), json!({"delay_ms": 20})))
            .collect();
        let results = exec.run_parallel(calls).await;

        assert_eq!(results.len(), 8);
        assert!(results.iter().all(ToolOutput::is_ok));
        assert!(
            stub.high_water() <= 2,
            "high water {} exceeded cap",
            stub.high_water()
        );
    }

    #[tokio::test]
    async fn parallel_isolates_failures() {
        let stub = Arc::new(StubDispatch::default());
        let exec = executor(&stub);

        let calls = vec![
            call("ok1", json!({})),
            call("bad", json!({"fail": true})),
            call("ok2", json!({})),
        ];
        let results = exec.run_parallel(calls).await;

        assert!(results[0].is_ok());
        let (code, message) = results[1].error_info().unwrap();
        assert_eq!(code, "stub_error");
        assert!(message.contains("bad"));
        assert!(results[2].is_ok());
    }

    #[tokio::test]
    async fn dependencies_order_execution() {
        let stub = Arc::new(StubDispatch::default());
        let exec = executor(&stub);

        // C depends on B and A; B depends on A.
        let calls = vec![
            call("a", json!({"delay_ms": 10})),
            call("b", json!({"delay_ms": 1})).with_dependencies([0]),
            call("c", json!({"delay_ms": 1})).with_dependencies([1, 0]),
        ];
        let results = exec.run_with_dependencies(calls).await.unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(stub.executed(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn mutual_dependency_stalls_without_executing() {
        let stub = Arc::new(StubDispatch::default());
        let exec = executor(&stub);

        let calls = vec![
            call("a", json!({})).with_dependencies([1]),
            call("b", json!({})).with_dependencies([0]),
        ];
        let err = exec.run_with_dependencies(calls).await.unwrap_err();

        match err {
            Error::StalledDependencies { stuck, completed } => {
                assert_eq!(stuck, vec![0, 1]);
                assert!(completed.is_empty());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(stub.executed().is_empty());
    }

    #[tokio::test]
    async fn calls_outside_a_cycle_keep_their_results() {
        let stub = Arc::new(StubDispatch::default());
        let exec = executor(&stub);

        let calls = vec![
            call("free", json!({})),
            call("a", json!({})).with_dependencies([2]),
            call("b", json!({})).with_dependencies([1]),
        ];
        let err = exec.run_with_dependencies(calls).await.unwrap_err();

        match err {
            Error::StalledDependencies { stuck, completed } => {
                assert_eq!(stuck, vec![1, 2]);
                assert_eq!(completed.len(), 1);
                assert_eq!(completed[0].0, 0);
                assert!(completed[0].1.is_ok());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(stub.executed(), vec!["free"]);
    }

    #[tokio::test]
    async fn out_of_range_dependency_stalls_the_batch() {
        let stub = Arc::new(StubDispatch::default());
        let exec = executor(&stub);

        let calls = vec![call("a", json!({})).with_dependencies([7])];
        let err = exec.run_with_dependencies(calls).await.unwrap_err();
        assert!(matches!(err, Error::StalledDependencies { .. }));
    }

    #[tokio::test]
    async fn failed_dependencies_still_unblock_dependents() {
        let stub = Arc::new(StubDispatch::default());
        let exec = executor(&stub);

        let calls = vec![
            call("a", json!({"fail": true})),
            call("b", json!({})).with_dependencies([0]),
        ];
        let results = exec.run_with_dependencies(calls).await.unwrap();

        assert!(!results[0].is_ok());
        assert!(results[1].is_ok());
        assert_eq!(stub.executed(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn sequential_stops_at_first_failure() {
        let stub = Arc::new(StubDispatch::default());
        let exec = executor(&stub);

        let calls = vec![
            call("one", json!({})),
            call("two", json!({"fail": true})),
            call("three", json!({})),
        ];
        let results = exec.run_sequential(calls).await;

        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(!results[1].is_ok());
        assert_eq!(stub.executed(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn empty_batches_are_no_ops() {
        let stub = Arc::new(StubDispatch::default());
        let exec = executor(&stub);

        assert!(exec.run_parallel(Vec::new()).await.is_empty());
        assert!(exec.run_with_dependencies(Vec::new()).await.unwrap().is_empty());
        assert!(exec.run_sequential(Vec::new()).await.is_empty());
    }
}
