//! Sequential pipeline over the probe steps.
//!
//! Steps run one at a time in a fixed order. Each is started with the inputs
//! its [`TargetScope`] asks for and polled until it reports completion; the
//! shared [`HostRegistry`] carries results from one step to the next.

use crate::config::{PipelineSettings, ScanConfig};
use crate::inventory::{Host, HostRegistry};
use crate::scanner::{
    ArpSource, ArpTableStep, DnsLookupStep, HttpFingerprintStep, InferenceStep, MdnsStep,
    MsrpcStep, NetBiosStep, PingSweepStep, PortScanStep, ProbeStep, TargetScope,
};
use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Snapshot reported to the caller while a step runs.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineProgress {
    /// Zero-based position of the running step.
    pub step_index: usize,
    pub step_count: usize,
    pub step_name: String,
    pub message: String,
    /// 0-100 within the running step.
    pub step_percent: u8,
    /// 0-100 across the whole pipeline.
    pub overall_percent: u8,
}

pub type ProgressCallback = Box<dyn Fn(PipelineProgress) + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub name: String,
    pub elapsed_ms: u64,
    pub log: String,
}

impl StepReport {
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }
}

/// Result of a full run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSummary {
    pub hosts: Vec<Host>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub steps: Vec<StepReport>,
}

impl PipelineSummary {
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// True when `requested` names `step`, ignoring case and punctuation.
/// A prefix such as `mdns` or `port` is enough.
pub fn step_matches(step: &str, requested: &str) -> bool {
    let requested = normalize(requested);
    !requested.is_empty() && normalize(step).starts_with(&requested)
}

pub struct PipelineRunner {
    registry: Arc<HostRegistry>,
    settings: PipelineSettings,
    steps: Vec<Box<dyn ProbeStep>>,
}

impl PipelineRunner {
    /// An empty pipeline over `registry`.
    pub fn new(registry: Arc<HostRegistry>, settings: PipelineSettings) -> Self {
        Self {
            registry,
            settings,
            steps: Vec::new(),
        }
    }

    /// The standard step order over a fresh registry.
    pub fn with_default_steps(config: &ScanConfig) -> Self {
        Self::with_registry(config, Arc::new(HostRegistry::new()))
    }

    /// The standard step order over an existing registry (e.g. a loaded inventory).
    pub fn with_registry(config: &ScanConfig, registry: Arc<HostRegistry>) -> Self {
        let r = &registry;
        let steps: Vec<Box<dyn ProbeStep>> = vec![
            Box::new(PingSweepStep::new(r.clone(), config.ping.clone())),
            Box::new(ArpTableStep::new(r.clone(), ArpSource::System)),
            Box::new(MdnsStep::new(r.clone(), config.mdns.clone())),
            Box::new(DnsLookupStep::new(r.clone(), config.dns.clone())),
            Box::new(PortScanStep::new(r.clone(), config.ports.clone())),
            Box::new(HttpFingerprintStep::new(r.clone(), config.http.clone())),
            Box::new(NetBiosStep::new(r.clone(), config.netbios.clone())),
            Box::new(MsrpcStep::new(r.clone(), config.msrpc.clone())),
            Box::new(InferenceStep::new(r.clone())),
        ];
        let mut runner = Self::new(registry, config.pipeline.clone());
        runner.steps = steps;
        runner
    }

    pub fn add_step(mut self, step: Box<dyn ProbeStep>) -> Self {
        self.steps.push(step);
        self
    }

    /// Drop the named steps. Unknown names are an error.
    pub fn skip(mut self, names: &[String]) -> Result<Self> {
        for name in names {
            if !self.steps.iter().any(|s| step_matches(s.name(), name)) {
                bail!(
                    "Unknown step '{}'. Available steps: {}",
                    name,
                    self.step_names().join(", ")
                );
            }
            self.steps.retain(|s| !step_matches(s.name(), name));
            tracing::info!("Skipping step '{}'", name);
        }
        Ok(self)
    }

    pub fn registry(&self) -> Arc<HostRegistry> {
        self.registry.clone()
    }

    pub fn steps(&self) -> &[Box<dyn ProbeStep>] {
        &self.steps
    }

    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Run every step in order. Steps start only once, so a runner is single-use.
    pub async fn run(
        &self,
        targets: Vec<String>,
        on_progress: Option<ProgressCallback>,
    ) -> Result<PipelineSummary> {
        if targets.is_empty() {
            bail!("No target addresses to scan");
        }

        let started_at = Utc::now();
        let step_count = self.steps.len();
        let report = |index: usize, step: &dyn ProbeStep| {
            if let Some(callback) = &on_progress {
                let step_fraction = step.progress_percentage().clamp(0.0, 1.0);
                let overall = (index as f64 + step_fraction) / step_count.max(1) as f64;
                callback(PipelineProgress {
                    step_index: index,
                    step_count,
                    step_name: step.name().to_string(),
                    message: step.progress_message(),
                    step_percent: (step_fraction * 100.0).round() as u8,
                    overall_percent: (overall * 100.0).round() as u8,
                });
            }
        };

        tracing::info!(
            "Starting pipeline: {} steps over {} targets",
            step_count,
            targets.len()
        );

        let mut reports = Vec::with_capacity(step_count);
        for (index, step) in self.steps.iter().enumerate() {
            let inputs = match step.target_scope() {
                TargetScope::Candidates => targets.clone(),
                TargetScope::OnlineHosts => self.registry.online_addresses(),
                TargetScope::Registry => Vec::new(),
            };

            let began = Instant::now();
            step.start(inputs);
            while !step.is_completed() {
                report(index, step.as_ref());
                tokio::time::sleep(self.settings.poll_interval()).await;
            }
            report(index, step.as_ref());

            let elapsed = began.elapsed();
            tracing::info!(
                "{} finished in {:.1}s: {}",
                step.name(),
                elapsed.as_secs_f64(),
                step.progress_message()
            );
            reports.push(StepReport {
                name: step.name().to_string(),
                elapsed_ms: elapsed.as_millis() as u64,
                log: step.progress_log(),
            });
        }

        let hosts = self.registry.snapshot();
        tracing::info!("Pipeline complete: {} hosts in inventory", hosts.len());
        Ok(PipelineSummary {
            hosts,
            started_at,
            finished_at: Utc::now(),
            steps: reports,
        })
    }
}
