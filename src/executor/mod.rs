//! Datasource query execution: sequential or bounded worker pool.
//!
//! Each plan runs on its own connection. Cancellation is cooperative: a
//! shared kill flag is checked at plan boundaries, and in-flight
//! queries are cancelled best-effort through the connection's interrupt
//! handle (SQLite) or the dialect's kill statement.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::QueryMode;
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::planner::DataSourceQuery;
use crate::warehouse::Warehouse;

/// Wall-clock accounting for one executed plan.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct QueryTiming {
    pub datasource: String,
    pub rows: usize,
    pub seconds: f64,
}

/// One executed plan's output.
#[derive(Debug)]
pub struct QueryResult {
    /// Index of the plan in the planner's ordered list.
    pub index: usize,
    pub frame: Frame,
    pub timing: QueryTiming,
}

/// The outcome of running all plans; failed plans are reported per
/// index so `allow_partial` reports can keep going.
#[derive(Debug)]
pub struct ExecutionOutcome {
    pub results: Vec<QueryResult>,
    pub failures: Vec<(usize, Error)>,
}

pub struct Executor<'a> {
    warehouse: &'a Warehouse,
    kill_flag: Arc<AtomicBool>,
}

impl<'a> Executor<'a> {
    pub fn new(warehouse: &'a Warehouse, kill_flag: Arc<AtomicBool>) -> Self {
        Self {
            warehouse,
            kill_flag,
        }
    }

    /// Run all plans in the configured mode. Without `allow_partial`,
    /// the first failure raises the kill flag so outstanding plans
    /// stop; with it, failures are recorded and the rest keep going.
    pub fn execute(
        &self,
        queries: &[DataSourceQuery],
        allow_partial: bool,
    ) -> Result<ExecutionOutcome> {
        let mode = self.warehouse.settings.datasource_query_mode;
        let timeout = self.warehouse.settings.datasource_query_timeout;
        match mode {
            QueryMode::Sequential => self.execute_sequential(queries, timeout, allow_partial),
            QueryMode::Multithread => self.execute_multithread(queries, timeout, allow_partial),
        }
    }

    fn execute_sequential(
        &self,
        queries: &[DataSourceQuery],
        timeout: Option<u64>,
        allow_partial: bool,
    ) -> Result<ExecutionOutcome> {
        let mut outcome = ExecutionOutcome {
            results: Vec::new(),
            failures: Vec::new(),
        };
        for (index, query) in queries.iter().enumerate() {
            if self.kill_flag.load(Ordering::SeqCst) {
                return Err(Error::ReportKilled);
            }
            match run_one(self.warehouse, query, timeout, &self.kill_flag) {
                Ok(mut result) => {
                    result.index = index;
                    outcome.results.push(result);
                }
                Err(Error::ReportKilled) => return Err(Error::ReportKilled),
                Err(err) => {
                    outcome.failures.push((index, err));
                    if !allow_partial {
                        self.kill_flag.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            }
        }
        Ok(outcome)
    }

    fn execute_multithread(
        &self,
        queries: &[DataSourceQuery],
        timeout: Option<u64>,
        allow_partial: bool,
    ) -> Result<ExecutionOutcome> {
        let worker_count = self
            .warehouse
            .settings
            .datasource_query_workers
            .min(queries.len().max(1));
        let work: Arc<Mutex<VecDeque<usize>>> =
            Arc::new(Mutex::new((0..queries.len()).collect()));
        let (tx, rx) = mpsc::channel::<(usize, Result<QueryResult>)>();

        std::thread::scope(|scope| {
            for _ in 0..worker_count {
                let work = Arc::clone(&work);
                let tx = tx.clone();
                let kill_flag = Arc::clone(&self.kill_flag);
                let warehouse = self.warehouse;
                scope.spawn(move || loop {
                    if kill_flag.load(Ordering::SeqCst) {
                        break;
                    }
                    let index = {
                        let mut queue = work.lock().expect("work queue poisoned");
                        queue.pop_front()
                    };
                    let Some(index) = index else { break };
                    let outcome = run_one(warehouse, &queries[index], timeout, &kill_flag);
                    if tx.send((index, outcome)).is_err() {
                        break;
                    }
                });
            }
            drop(tx);

            let mut outcome = ExecutionOutcome {
                results: Vec::new(),
                failures: Vec::new(),
            };
            let mut killed = false;
            for (index, result) in rx {
                match result {
                    Ok(mut query_result) => {
                        query_result.index = index;
                        outcome.results.push(query_result);
                    }
                    Err(Error::ReportKilled) => killed = true,
                    Err(err) => {
                        outcome.failures.push((index, err));
                        if !allow_partial {
                            // Cancel outstanding plans.
                            self.kill_flag.store(true, Ordering::SeqCst);
                        }
                    }
                }
            }
            if killed && outcome.failures.is_empty() {
                return Err(Error::ReportKilled);
            }
            outcome.results.sort_by_key(|r| r.index);
            outcome.failures.sort_by_key(|f| f.0);
            Ok(outcome)
        })
    }
}

/// Run one plan with a per-query timeout. A watchdog thread interrupts
/// the in-flight query when the deadline passes or the report is
/// killed.
fn run_one(
    warehouse: &Warehouse,
    query: &DataSourceQuery,
    timeout: Option<u64>,
    kill_flag: &Arc<AtomicBool>,
) -> Result<QueryResult> {
    let datasource = warehouse.datasource(&query.datasource).ok_or_else(|| {
        Error::ds_config(&query.datasource, "datasource disappeared during execution")
    })?;

    let connection = datasource.open_connection()?;
    let started = Instant::now();

    let timed_out = Arc::new(AtomicBool::new(false));
    let (done_tx, done_rx) = mpsc::channel::<()>();

    let watchdog = connection.interrupt_handle().map(|interrupt| {
        let timed_out = Arc::clone(&timed_out);
        let kill_flag = Arc::clone(kill_flag);
        let deadline = timeout.map(|secs| started + Duration::from_secs(secs));
        std::thread::spawn(move || loop {
            match done_rx.recv_timeout(Duration::from_millis(50)) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if kill_flag.load(Ordering::SeqCst) {
                        interrupt();
                        break;
                    }
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            timed_out.store(true, Ordering::SeqCst);
                            interrupt();
                            break;
                        }
                    }
                }
            }
        })
    });

    let mut connection = connection;
    let run_result = connection.run(&query.sql);
    let _ = done_tx.send(());
    if let Some(handle) = watchdog {
        let _ = handle.join();
    }

    if kill_flag.load(Ordering::SeqCst) && run_result.is_err() {
        return Err(Error::ReportKilled);
    }
    if timed_out.load(Ordering::SeqCst) {
        return Err(Error::DataSourceQueryTimeout {
            datasource: query.datasource.clone(),
            seconds: timeout.unwrap_or(0),
        });
    }

    let frame = run_result.map_err(|err| Error::FailedExecution {
        datasource: query.datasource.clone(),
        message: err.to_string(),
    })?;

    let seconds = started.elapsed().as_secs_f64();
    tracing::debug!(
        datasource = %query.datasource,
        rows = frame.len(),
        seconds,
        "datasource query finished"
    );

    Ok(QueryResult {
        index: 0,
        timing: QueryTiming {
            datasource: query.datasource.clone(),
            rows: frame.len(),
            seconds,
        },
        frame,
    })
}
