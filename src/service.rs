//! Discovery service
//!
//! The long-lived, explicitly owned entry point. A service probes the host
//! once, validates its configuration against it and then runs any number of
//! independent discovery calls, concurrently if the caller wants.

use crate::config::types::{AccessedAddrs, DiscoveryError, Result, SandboxConfig};
use crate::config::validator::validate_config;
use crate::core::assembler::ResultAssembler;
use crate::core::interceptor::{Interceptor, InterceptorLimits};
use crate::core::supervisor;
use crate::exec::launcher::{Forked, LaunchedSandbox, Sandbox};
use crate::kernel::host::HostSupport;
use crate::observability::audit::{AuditLogger, CorrelationIds};
use crate::observability::metrics::{DiscoveryMetrics, MetricsSnapshot};
use crate::safety::cleanup::TeardownReport;
use std::time::Instant;

pub use crate::core::types::CancelToken;

/// Everything one call produced, before it is reported.
struct CallOutcome {
    result: Result<AccessedAddrs>,
    teardown: Option<TeardownReport>,
    launched: bool,
    iterations: u32,
    blocks_granted: usize,
}

impl CallOutcome {
    fn before_launch(err: DiscoveryError) -> Self {
        Self {
            result: Err(err),
            teardown: None,
            launched: false,
            iterations: 0,
            blocks_granted: 0,
        }
    }
}

pub struct DiscoveryService {
    config: SandboxConfig,
    host: HostSupport,
    metrics: DiscoveryMetrics,
    audit: AuditLogger,
}

impl DiscoveryService {
    /// Probe the host and validate `config` against it.
    pub fn new(config: SandboxConfig) -> Result<Self> {
        let host = HostSupport::probe()?;
        validate_config(&config, &host)?;

        let audit = match &config.audit_log_path {
            Some(path) => AuditLogger::with_file(path)?,
            None => AuditLogger::log_only(),
        };

        log::info!(
            "Discovery service ready: block size {:#x}, placement {:?}, priming {:?}",
            config.block_size.unwrap_or(host.page_size),
            config.placement,
            config.priming
        );

        Ok(Self {
            config,
            host,
            metrics: DiscoveryMetrics::new(),
            audit,
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(SandboxConfig::default())
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn host(&self) -> &HostSupport {
        &self.host
    }

    /// Granularity of every reported address.
    pub fn block_size(&self) -> u64 {
        self.config.block_size.unwrap_or(self.host.page_size)
    }

    pub fn metrics(&self) -> &DiscoveryMetrics {
        &self.metrics
    }

    /// Discover the memory blocks `code` touches.
    pub fn discover(&self, code: &[u8]) -> Result<AccessedAddrs> {
        self.discover_with_cancel(code, &CancelToken::new())
    }

    /// Like [`discover`](Self::discover), abandoning the call once `cancel` fires.
    pub fn discover_with_cancel(&self, code: &[u8], cancel: &CancelToken) -> Result<AccessedAddrs> {
        self.run(code, cancel, CorrelationIds::new())
    }

    /// Discover many blocks on `workers` threads. Results come back in
    /// input order; blocks not started before `cancel` fires yield
    /// `Cancelled`.
    pub fn discover_batch<B>(
        &self,
        blocks: &[B],
        workers: usize,
        cancel: &CancelToken,
    ) -> Vec<Result<AccessedAddrs>>
    where
        B: AsRef<[u8]> + Sync,
    {
        if blocks.is_empty() {
            return Vec::new();
        }
        let workers = workers.clamp(1, blocks.len());
        let batch = CorrelationIds::new();
        let request_id = batch.request_id.as_str();
        log::debug!(
            "Batch {}: {} blocks on {} workers",
            request_id,
            blocks.len(),
            workers
        );

        let (job_tx, job_rx) = crossbeam_channel::bounded::<(usize, &[u8])>(workers);
        let (result_tx, result_rx) = crossbeam_channel::unbounded();

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                // Each call stays on this thread: the tracee is bound to it.
                scope.spawn(move || {
                    for (index, code) in job_rx.iter() {
                        let result = if cancel.is_cancelled() {
                            Err(DiscoveryError::Cancelled)
                        } else {
                            self.run(code, cancel, CorrelationIds::for_request(request_id))
                        };
                        if result_tx.send((index, result)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(job_rx);
            drop(result_tx);

            for (index, block) in blocks.iter().enumerate() {
                if job_tx.send((index, block.as_ref())).is_err() {
                    break;
                }
            }
            drop(job_tx);
        });

        let mut results: Vec<Option<Result<AccessedAddrs>>> =
            (0..blocks.len()).map(|_| None).collect();
        for (index, result) in result_rx.iter() {
            results[index] = Some(result);
        }
        results
            .into_iter()
            .map(|result| result.unwrap_or(Err(DiscoveryError::Cancelled)))
            .collect()
    }

    /// Release the service, returning its final metrics.
    pub fn shutdown(self) -> MetricsSnapshot {
        let snapshot = self.metrics.snapshot();
        log::info!(
            "Discovery service shut down after {} calls ({} succeeded)",
            snapshot.calls_total,
            snapshot.calls_succeeded
        );
        snapshot
    }

    fn run(
        &self,
        code: &[u8],
        cancel: &CancelToken,
        correlation: CorrelationIds,
    ) -> Result<AccessedAddrs> {
        let started = Instant::now();
        self.metrics.active_calls.inc();
        self.audit.discovery_start(&correlation, code.len());

        let (outcome, correlation) = self.execute(code, cancel, correlation);

        if outcome.launched {
            self.metrics.record_teardown(outcome.teardown.as_ref());
            self.audit.teardown(&correlation, outcome.teardown.as_ref());
        }
        self.metrics.record_work(outcome.iterations, outcome.blocks_granted);
        self.metrics.record_outcome(&outcome.result, started.elapsed());
        self.audit.discovery_end(&correlation, &outcome.result);
        self.metrics.active_calls.dec();

        outcome.result
    }

    fn execute(
        &self,
        code: &[u8],
        cancel: &CancelToken,
        correlation: CorrelationIds,
    ) -> (CallOutcome, CorrelationIds) {
        if cancel.is_cancelled() {
            return (CallOutcome::before_launch(DiscoveryError::Cancelled), correlation);
        }

        let forked = match Sandbox::spawn(code, &self.config, &self.host) {
            Ok(forked) => forked,
            Err(err) => return (CallOutcome::before_launch(err), correlation),
        };
        let correlation = match forked.pid() {
            Ok(pid) => correlation.with_tracee_pid(pid.as_raw()),
            Err(_) => correlation,
        };

        // A failed step drops the sandbox, which kills and reaps the child.
        let mut launched = match self.launch(forked) {
            Ok(launched) => launched,
            Err(err) => return (CallOutcome::before_launch(err), correlation),
        };

        let mut interceptor = Interceptor::new(
            launched.layout.clone(),
            InterceptorLimits::from(&self.config),
        );
        let outcome = supervisor::run_to_completion(
            &mut launched,
            &mut interceptor,
            self.config.wall_time_limit(),
            cancel,
        );
        let iterations = interceptor.iterations();
        let blocks_granted = interceptor.tracker().len();

        let assembler = ResultAssembler {
            code_location: launched.layout.code_location,
            block_size: launched.layout.block_size,
        };
        let assembled = assembler.finish(&mut launched.tracee, interceptor.into_tracker(), outcome);

        (
            CallOutcome {
                result: assembled.result,
                teardown: assembled.teardown,
                launched: true,
                iterations,
                blocks_granted,
            },
            correlation,
        )
    }

    fn launch(&self, forked: Sandbox<Forked>) -> Result<LaunchedSandbox> {
        forked
            .await_stop()?
            .scrub(self.config.scrub_address_space)?
            .prime(&self.config.priming)?
            .start()
    }
}

/// One-shot discovery with the default configuration.
pub fn discover_accessed_addresses(code: &[u8]) -> Result<AccessedAddrs> {
    DiscoveryService::with_defaults()?.discover(code)
}
