use crate::error::AppError;
use crate::job::JobStep;

/// Events emitted by the orchestrator for monitoring/logging.
#[derive(Debug, Clone)]
pub enum JobEvent<'a> {
    Created {
        job_id: &'a str,
        url: &'a str,
    },
    StepCompleted {
        job_id: &'a str,
        step: JobStep,
    },
    StepSkipped {
        job_id: &'a str,
        step: JobStep,
    },
    StepFailed {
        job_id: Option<&'a str>,
        step: JobStep,
        error: &'a AppError,
    },
    AssetUploaded {
        job_id: &'a str,
        filename: &'a str,
    },
    Completed {
        job_id: &'a str,
        steps: usize,
    },
    Failed {
        job_id: Option<&'a str>,
        step: JobStep,
    },
}

/// Trait for receiving job events (decoupled logging).
pub trait JobReporter: Send + Sync {
    fn report(&self, event: JobEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullJobReporter;

impl JobReporter for NullJobReporter {}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingJobReporter;

impl JobReporter for TracingJobReporter {
    fn report(&self, event: JobEvent<'_>) {
        match event {
            JobEvent::Created { job_id, url } => {
                tracing::info!(%job_id, %url, "Extraction job created");
            }
            JobEvent::StepCompleted { job_id, step } => {
                tracing::info!(%job_id, %step, "Step completed");
            }
            JobEvent::StepSkipped { job_id, step } => {
                tracing::debug!(%job_id, %step, "Step skipped, dependencies unmet");
            }
            JobEvent::StepFailed {
                job_id,
                step,
                error,
            } => {
                tracing::warn!(?job_id, %step, %error, "Step failed");
            }
            JobEvent::AssetUploaded { job_id, filename } => {
                tracing::debug!(%job_id, %filename, "Asset uploaded");
            }
            JobEvent::Completed { job_id, steps } => {
                tracing::info!(%job_id, %steps, "Extraction job completed");
            }
            JobEvent::Failed { job_id, step } => {
                tracing::error!(?job_id, %step, "Extraction job failed");
            }
        }
    }
}
