use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};

use crate::error::WorkerError;
use crate::pipeline::PipelineCoordinator;
use crate::worker::cancel::CancellationToken;
use crate::worker::job::{IngestJob, RunOutcome};

type TokenMap = Arc<Mutex<HashMap<String, CancellationToken>>>;

/// Cancels every queued or running run of a pool without borrowing the pool.
#[derive(Clone)]
pub struct Canceller {
    tokens: TokenMap,
}

impl Canceller {
    pub fn cancel_all(&self) {
        if let Ok(tokens) = self.tokens.lock() {
            for token in tokens.values() {
                token.cancel();
            }
        }
    }
}

/// Fixed set of threads that drive queued runs through the coordinator.
///
/// A run id can be queued at most once at a time; its token stays registered
/// until the worker that picked it up is done with it.
pub struct WorkerPool {
    job_sender: Sender<IngestJob>,
    result_receiver: Receiver<RunOutcome>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    tokens: TokenMap,
}

impl WorkerPool {
    /// # Panics
    /// Panics if `worker_count` is 0.
    pub fn new(coordinator: Arc<PipelineCoordinator>, worker_count: usize) -> Self {
        assert!(worker_count > 0, "worker_count must be > 0");
        let (job_sender, job_receiver) = bounded::<IngestJob>(worker_count * 2);
        // Outcomes never block a worker, so callers may submit everything before draining.
        let (result_sender, result_receiver) = unbounded::<RunOutcome>();
        let shutdown = Arc::new(AtomicBool::new(false));
        let tokens: TokenMap = Arc::new(Mutex::new(HashMap::new()));

        let mut workers = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let job_rx = job_receiver.clone();
            let result_tx = result_sender.clone();
            let shutdown_flag = Arc::clone(&shutdown);
            let worker_coordinator = Arc::clone(&coordinator);
            let worker_tokens = Arc::clone(&tokens);

            let handle = thread::spawn(move || {
                run_worker(
                    worker_id,
                    job_rx,
                    result_tx,
                    shutdown_flag,
                    worker_coordinator,
                    worker_tokens,
                );
            });

            workers.push(handle);
        }

        info!("Started {} ingest workers", worker_count);

        Self {
            job_sender,
            result_receiver,
            workers,
            shutdown,
            tokens,
        }
    }

    /// Queues `run_id` and returns the token that cancels it.
    pub fn submit(&self, run_id: &str) -> Result<CancellationToken, WorkerError> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(WorkerError::ChannelClosed);
        }

        let token = CancellationToken::new();
        {
            let mut tokens = self.tokens.lock().map_err(|_| WorkerError::ChannelClosed)?;
            if tokens.contains_key(run_id) {
                return Err(WorkerError::AlreadyQueued {
                    run_id: run_id.to_string(),
                });
            }
            tokens.insert(run_id.to_string(), token.clone());
        }

        if self.job_sender.send(IngestJob::new(run_id)).is_err() {
            self.forget(run_id);
            return Err(WorkerError::ChannelClosed);
        }
        Ok(token)
    }

    /// Requests cancellation of a queued or running run.
    pub fn cancel(&self, run_id: &str) -> bool {
        match self.tokens.lock() {
            Ok(tokens) => match tokens.get(run_id) {
                Some(token) => {
                    token.cancel();
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    pub fn cancel_all(&self) {
        self.canceller().cancel_all();
    }

    /// A handle for signal handlers and other threads.
    pub fn canceller(&self) -> Canceller {
        Canceller {
            tokens: Arc::clone(&self.tokens),
        }
    }

    pub fn try_recv_result(&self) -> Option<RunOutcome> {
        self.result_receiver.try_recv().ok()
    }

    pub fn recv_result(&self) -> Option<RunOutcome> {
        self.result_receiver.recv().ok()
    }

    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn wait(self) {
        // Drop sender to signal workers to exit
        drop(self.job_sender);

        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }

        info!("All ingest workers have stopped");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    fn forget(&self, run_id: &str) {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.remove(run_id);
        }
    }
}

fn token_for(tokens: &TokenMap, run_id: &str) -> CancellationToken {
    match tokens.lock() {
        Ok(tokens) => tokens.get(run_id).cloned().unwrap_or_default(),
        Err(_) => CancellationToken::new(),
    }
}

fn run_worker(
    worker_id: usize,
    job_receiver: Receiver<IngestJob>,
    result_sender: Sender<RunOutcome>,
    shutdown: Arc<AtomicBool>,
    coordinator: Arc<PipelineCoordinator>,
    tokens: TokenMap,
) {
    debug!("Worker {} started", worker_id);

    loop {
        if shutdown.load(Ordering::Relaxed) {
            debug!("Worker {} received shutdown signal", worker_id);
            break;
        }

        match job_receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(job) => {
                debug!("Worker {} driving run {}", worker_id, job.run_id);

                let token = token_for(&tokens, &job.run_id);
                let outcome = match coordinator.run(&job.run_id, &token) {
                    Ok(run) => RunOutcome::success(&job, &run),
                    Err(e) => {
                        warn!("Run {} ended with error: {}", job.run_id, e);
                        RunOutcome::failure(&job, &e)
                    }
                };

                if let Ok(mut tokens) = tokens.lock() {
                    tokens.remove(&job.run_id);
                }

                if let Err(e) = result_sender.send(outcome) {
                    error!("Worker {} failed to send outcome: {}", worker_id, e);
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => {
                debug!("Worker {} job channel disconnected", worker_id);
                break;
            }
        }
    }

    debug!("Worker {} stopped", worker_id);
}
