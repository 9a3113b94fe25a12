//! Analyzer fan-out / fan-in
//!
//! All requested analyzers run concurrently against one shared
//! `Arc<NormalizedDataset>`. Each result is handled as it arrives:
//! successful insights go straight to the [`PipelineSink`] (no all-or-nothing
//! commit), failures are recorded under the analyzer's kind. A panicking
//! analyzer is caught at the task boundary and becomes
//! [`AnalyzerError::Panicked`].
//!
//! Cancellation is checked before each analyzer is started; analyzers that
//! already started are allowed to finish.

use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::analyzers::{AnalysisContext, AnalyzerError, AnalyzerRegistry};
use crate::models::{AnalyzerFailure, AnalyzerKind, Insight, NormalizedDataset};

/// Where pipeline results go
#[async_trait]
pub trait PipelineSink: Send + Sync {
    /// Durably store one analyzer's insights
    async fn persist(
        &self,
        analyzer: AnalyzerKind,
        insights: &[Insight],
    ) -> Result<(), repolens_common::Error>;

    /// Called once per analyzer after its result is handled
    async fn analyzer_finished(&self, report: &AnalyzerReport);
}

/// One analyzer's result as seen by the sink
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzerReport {
    pub analyzer: AnalyzerKind,
    /// Number of insights persisted, or the isolated failure
    pub result: Result<usize, AnalyzerError>,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Persisting {analyzer} insights failed: {source}")]
    Persistence {
        analyzer: AnalyzerKind,
        #[source]
        source: repolens_common::Error,
    },
}

/// Fan-in result: successes partitioned from failures
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineOutcome {
    /// Analyzer and the number of insights it persisted
    pub succeeded: Vec<(AnalyzerKind, usize)>,
    pub failed: Vec<AnalyzerFailure>,
    /// Not started because cancellation was observed first
    pub not_started: Vec<AnalyzerKind>,
}

impl PipelineOutcome {
    pub fn insight_count(&self) -> usize {
        self.succeeded.iter().map(|(_, n)| n).sum()
    }

    /// Every analyzer that ran failed
    pub fn all_failed(&self) -> bool {
        self.succeeded.is_empty() && !self.failed.is_empty()
    }

    pub fn was_cancelled(&self) -> bool {
        !self.not_started.is_empty()
    }
}

pub struct AnalyzerPipeline {
    registry: AnalyzerRegistry,
}

impl AnalyzerPipeline {
    pub fn new(registry: AnalyzerRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &AnalyzerRegistry {
        &self.registry
    }

    pub async fn run(
        &self,
        ctx: AnalysisContext,
        dataset: Arc<NormalizedDataset>,
        requested: &[AnalyzerKind],
        cancel: &CancellationToken,
        sink: &dyn PipelineSink,
    ) -> Result<PipelineOutcome, PipelineError> {
        let mut outcome = PipelineOutcome::default();
        let mut pending: BTreeSet<AnalyzerKind> = BTreeSet::new();
        let mut tasks = JoinSet::new();
        let mut early: Vec<AnalyzerReport> = Vec::new();

        for &kind in requested {
            if cancel.is_cancelled() {
                outcome.not_started.push(kind);
                continue;
            }

            let Some(analyzer) = self.registry.get(kind) else {
                early.push(AnalyzerReport {
                    analyzer: kind,
                    result: Err(AnalyzerError::Failed("analyzer not registered".to_string())),
                });
                continue;
            };

            let required = analyzer.requires();
            if !required.is_empty() && required.iter().all(|k| dataset.is_degraded(*k)) {
                let kinds: Vec<&str> = required.iter().map(|k| k.as_str()).collect();
                early.push(AnalyzerReport {
                    analyzer: kind,
                    result: Err(AnalyzerError::InsufficientData(format!(
                        "all required resource kinds degraded: {}",
                        kinds.join(", ")
                    ))),
                });
                continue;
            }

            let dataset = Arc::clone(&dataset);
            pending.insert(kind);
            tasks.spawn(async move {
                let result = AssertUnwindSafe(analyzer.analyze(&ctx, &dataset))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(AnalyzerError::Panicked(panic_message(&*panic))));
                (kind, result)
            });
        }

        if !outcome.not_started.is_empty() {
            info!(
                job_id = %ctx.job_id,
                skipped = ?outcome.not_started,
                "Cancellation observed, analyzers not started"
            );
        }

        for report in early {
            record(&mut outcome, &report, &ctx);
            sink.analyzer_finished(&report).await;
        }

        while let Some(joined) = tasks.join_next().await {
            let (kind, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    // Only reachable if the task was aborted from outside
                    error!(job_id = %ctx.job_id, error = %e, "Analyzer task lost");
                    continue;
                }
            };
            pending.remove(&kind);

            let report = match result {
                Ok(insights) => {
                    if let Err(source) = sink.persist(kind, &insights).await {
                        error!(
                            job_id = %ctx.job_id,
                            analyzer = %kind,
                            error = %source,
                            "Persisting insights failed"
                        );
                        tasks.abort_all();
                        return Err(PipelineError::Persistence {
                            analyzer: kind,
                            source,
                        });
                    }
                    AnalyzerReport {
                        analyzer: kind,
                        result: Ok(insights.len()),
                    }
                }
                Err(err) => AnalyzerReport {
                    analyzer: kind,
                    result: Err(err),
                },
            };

            record(&mut outcome, &report, &ctx);
            sink.analyzer_finished(&report).await;
        }

        for kind in pending {
            let report = AnalyzerReport {
                analyzer: kind,
                result: Err(AnalyzerError::Failed("analyzer task aborted".to_string())),
            };
            record(&mut outcome, &report, &ctx);
            sink.analyzer_finished(&report).await;
        }

        Ok(outcome)
    }
}

fn record(outcome: &mut PipelineOutcome, report: &AnalyzerReport, ctx: &AnalysisContext) {
    match &report.result {
        Ok(count) => {
            debug!(job_id = %ctx.job_id, analyzer = %report.analyzer, insights = count, "Analyzer finished");
            outcome.succeeded.push((report.analyzer, *count));
        }
        Err(err) => {
            warn!(
                job_id = %ctx.job_id,
                analyzer = %report.analyzer,
                error = %err,
                "Analyzer failed (isolated)"
            );
            outcome.failed.push(AnalyzerFailure {
                analyzer: report.analyzer,
                error: err.to_string(),
            });
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::analyzers::Analyzer;
    use crate::models::ResourceKind;
    use std::sync::Mutex;

    /// Analyzer standing in for a real one; fails or panics on demand
    pub struct StubAnalyzer {
        pub kind: AnalyzerKind,
        pub behaviour: Behaviour,
        pub requires: &'static [ResourceKind],
    }

    #[derive(Clone, Copy)]
    pub enum Behaviour {
        Succeed(usize),
        Fail,
        Panic,
    }

    #[async_trait]
    impl Analyzer for StubAnalyzer {
        fn kind(&self) -> AnalyzerKind {
            self.kind
        }

        fn requires(&self) -> &'static [ResourceKind] {
            self.requires
        }

        async fn analyze(
            &self,
            ctx: &AnalysisContext,
            _dataset: &NormalizedDataset,
        ) -> Result<Vec<Insight>, AnalyzerError> {
            match self.behaviour {
                Behaviour::Succeed(n) => Ok((0..n)
                    .map(|i| {
                        ctx.insight(self.kind, format!("stub {}", i), 0.5, serde_json::json!({}))
                    })
                    .collect()),
                Behaviour::Fail => Err(AnalyzerError::Failed("stub failure".to_string())),
                Behaviour::Panic => panic!("stub analyzer exploded"),
            }
        }
    }

    /// Collects everything in memory
    #[derive(Default)]
    pub struct MemorySink {
        pub persisted: Mutex<Vec<Insight>>,
        pub reports: Mutex<Vec<AnalyzerReport>>,
        pub fail_persist: bool,
    }

    #[async_trait]
    impl PipelineSink for MemorySink {
        async fn persist(
            &self,
            _analyzer: AnalyzerKind,
            insights: &[Insight],
        ) -> Result<(), repolens_common::Error> {
            if self.fail_persist {
                return Err(repolens_common::Error::Internal("disk full".to_string()));
            }
            self.persisted.lock().unwrap().extend_from_slice(insights);
            Ok(())
        }

        async fn analyzer_finished(&self, report: &AnalyzerReport) {
            self.reports.lock().unwrap().push(report.clone());
        }
    }
}
