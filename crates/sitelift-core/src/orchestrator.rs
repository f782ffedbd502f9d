use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use futures::future::join_all;
use serde_json::{Value, json};

use crate::error::AppError;
use crate::job::{ExtractionJob, ExtractionRequest, JobStatus, JobStep};
use crate::models::{Asset, ResponseBody};
use crate::reporter::{JobEvent, JobReporter, TracingJobReporter};
use crate::traits::{ApiClient, ExtractionSource};

/// Drives one extraction: create job → structure → optional artifacts → complete.
///
/// Generic over the API client so tests run without HTTP. Steps run in a
/// fixed order and are never retried; a failed job is left as-is on the
/// server and in the local job table.
#[derive(Clone)]
pub struct ExtractionOrchestrator<A>
where
    A: ApiClient,
{
    api: A,
    jobs: Arc<Mutex<HashMap<String, ExtractionJob>>>,
}

/// Mutable state of a single run.
struct Run<'r, R: JobReporter> {
    job: ExtractionJob,
    reporter: &'r R,
    first_failure: Option<AppError>,
}

impl<A> ExtractionOrchestrator<A>
where
    A: ApiClient,
{
    pub fn new(api: A) -> Self {
        Self {
            api,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run an extraction, logging progress through `tracing`.
    pub async fn run<S>(
        &self,
        request: &ExtractionRequest,
        source: &S,
    ) -> Result<ExtractionJob, AppError>
    where
        S: ExtractionSource,
    {
        self.run_with_reporter(request, source, &TracingJobReporter)
            .await
    }

    /// Run an extraction with a custom reporter.
    ///
    /// Create and structure failures abort at once. A failing optional step
    /// does not stop independent optional steps; the first such failure is
    /// returned once they have run, and the job is not finalized.
    pub async fn run_with_reporter<S, R>(
        &self,
        request: &ExtractionRequest,
        source: &S,
        reporter: &R,
    ) -> Result<ExtractionJob, AppError>
    where
        S: ExtractionSource,
        R: JobReporter,
    {
        let job_id = match self.create(request).await {
            Ok(id) => id,
            Err(e) => {
                reporter.report(JobEvent::StepFailed {
                    job_id: None,
                    step: JobStep::Create,
                    error: &e,
                });
                reporter.report(JobEvent::Failed {
                    job_id: None,
                    step: JobStep::Create,
                });
                return Err(e.at_step(None, JobStep::Create));
            }
        };

        let mut run = Run {
            job: ExtractionJob::new(job_id),
            reporter,
            first_failure: None,
        };
        reporter.report(JobEvent::Created {
            job_id: &run.job.id,
            url: &request.url,
        });
        self.complete_step(&mut run, JobStep::Create);

        let structure = match source.structure().await {
            Ok(s) => s,
            Err(e) => return Err(self.abort(run, JobStep::Structure, e)),
        };
        if let Err(e) = self
            .post(&run.job, JobStep::Structure, json!({ "structure": structure }))
            .await
        {
            return Err(self.abort(run, JobStep::Structure, e));
        }
        self.complete_step(&mut run, JobStep::Structure);

        let flags = request.flags;
        let mut design = None;

        if flags.design && self.ready(&mut run, JobStep::Design) {
            let artifact = source.design(&structure);
            design = self.submit(&mut run, JobStep::Design, "design", artifact).await;
        }

        if flags.source_code && self.ready(&mut run, JobStep::SourceCode) {
            let artifact = source.source_code(&structure);
            self.submit(&mut run, JobStep::SourceCode, "code", artifact)
                .await;
        }

        if flags.component_library && self.ready(&mut run, JobStep::ComponentLibrary) {
            let artifact = source.component_library(&structure);
            self.submit(
                &mut run,
                JobStep::ComponentLibrary,
                "componentLibrary",
                artifact,
            )
            .await;
        }

        if flags.assets && self.ready(&mut run, JobStep::AssetManifest) {
            self.run_assets(&mut run, source).await;
        }

        if flags.responsive && self.ready(&mut run, JobStep::Responsive) {
            let artifact = source.responsive().await;
            let responsive = self
                .submit(&mut run, JobStep::Responsive, "responsive", artifact)
                .await;

            if self.ready(&mut run, JobStep::ResponsiveVariants)
                && let (Some(design), Some(responsive)) = (&design, &responsive)
            {
                let artifact = source.responsive_variants(design, responsive);
                self.submit(&mut run, JobStep::ResponsiveVariants, "variants", artifact)
                    .await;
            }

            if self.ready(&mut run, JobStep::ResponsiveCss)
                && let Some(responsive) = &responsive
            {
                let artifact = source.responsive_css(responsive);
                self.submit(&mut run, JobStep::ResponsiveCss, "css", artifact)
                    .await;
            }
        }

        if let Some(err) = run.first_failure.take() {
            run.job.status = JobStatus::Failed;
            let step = match &err {
                AppError::JobStepFailed { step, .. } => *step,
                _ => JobStep::Complete,
            };
            run.reporter.report(JobEvent::Failed {
                job_id: Some(&run.job.id),
                step,
            });
            self.save(&run.job);
            return Err(err);
        }

        if let Err(e) = self
            .post(&run.job, JobStep::Complete, json!({ "status": "completed" }))
            .await
        {
            return Err(self.abort(run, JobStep::Complete, e));
        }
        self.complete_step(&mut run, JobStep::Complete);
        run.job.status = JobStatus::Completed;
        run.reporter.report(JobEvent::Completed {
            job_id: &run.job.id,
            steps: run.job.steps_completed.len(),
        });
        self.save(&run.job);

        Ok(run.job)
    }

    /// Snapshot of a job started by this orchestrator.
    pub fn job(&self, id: &str) -> Option<ExtractionJob> {
        self.lock_jobs().get(id).cloned()
    }

    /// Snapshots of every job, oldest first.
    pub fn jobs(&self) -> Vec<ExtractionJob> {
        let mut jobs: Vec<_> = self.lock_jobs().values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<String, ExtractionJob>> {
        self.jobs.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned job table mutex");
            poisoned.into_inner()
        })
    }

    fn save(&self, job: &ExtractionJob) {
        self.lock_jobs().insert(job.id.clone(), job.clone());
    }

    async fn create(&self, request: &ExtractionRequest) -> Result<String, AppError> {
        let body = request.create_body(Utc::now());
        let response = self.api.post_json("extractions", &body).await?;
        parse_job_id(&response)
    }

    async fn post(&self, job: &ExtractionJob, step: JobStep, body: Value) -> Result<(), AppError> {
        self.api
            .post_json(&job.endpoint(step), &body)
            .await
            .map(|_| ())
    }

    /// Check dependencies, recording a skip when they are unmet.
    fn ready<R: JobReporter>(&self, run: &mut Run<'_, R>, step: JobStep) -> bool {
        if run.job.is_ready(step) {
            return true;
        }
        run.job.steps_skipped.push(step);
        run.reporter.report(JobEvent::StepSkipped {
            job_id: &run.job.id,
            step,
        });
        self.save(&run.job);
        false
    }

    /// Post an artifact under `key`. Returns the artifact if the step succeeded.
    async fn submit<R: JobReporter>(
        &self,
        run: &mut Run<'_, R>,
        step: JobStep,
        key: &str,
        artifact: Result<Value, AppError>,
    ) -> Option<Value> {
        let artifact = match artifact {
            Ok(a) => a,
            Err(e) => {
                self.fail_step(run, step, e);
                return None;
            }
        };

        let mut body = serde_json::Map::new();
        body.insert(key.to_string(), artifact);
        match self.post(&run.job, step, Value::Object(body.clone())).await {
            Ok(()) => {
                self.complete_step(run, step);
                body.remove(key)
            }
            Err(e) => {
                self.fail_step(run, step, e);
                None
            }
        }
    }

    /// Manifest first, then one concurrent upload per asset.
    async fn run_assets<S, R>(&self, run: &mut Run<'_, R>, source: &S)
    where
        S: ExtractionSource,
        R: JobReporter,
    {
        let assets = match source.assets().await {
            Ok(assets) => assets,
            Err(e) => {
                self.fail_step(run, JobStep::AssetManifest, e);
                self.ready(run, JobStep::AssetUpload);
                return;
            }
        };

        let manifest: Vec<Value> = assets.iter().map(Asset::manifest_entry).collect();
        if self
            .submit(run, JobStep::AssetManifest, "assets", Ok(Value::Array(manifest)))
            .await
            .is_none()
        {
            self.ready(run, JobStep::AssetUpload);
            return;
        }

        if !self.ready(run, JobStep::AssetUpload) {
            return;
        }

        let endpoint = run.job.endpoint(JobStep::AssetUpload);
        let uploads = assets.iter().map(|asset| {
            let endpoint = endpoint.as_str();
            async move {
                let result = self.api.upload(endpoint, asset.to_upload()).await;
                (asset.filename.as_str(), result)
            }
        });

        let mut failed = false;
        for (filename, result) in join_all(uploads).await {
            match result {
                Ok(_) => {
                    run.job.uploaded_assets.push(filename.to_string());
                    run.reporter.report(JobEvent::AssetUploaded {
                        job_id: &run.job.id,
                        filename,
                    });
                }
                Err(e) => {
                    failed = true;
                    let err = AppError::AssetUploadFailed {
                        filename: filename.to_string(),
                        source: Box::new(e),
                    };
                    self.fail_step(run, JobStep::AssetUpload, err);
                }
            }
        }

        if failed {
            self.save(&run.job);
        } else {
            self.complete_step(run, JobStep::AssetUpload);
        }
    }

    fn complete_step<R: JobReporter>(&self, run: &mut Run<'_, R>, step: JobStep) {
        run.job.steps_completed.push(step);
        run.reporter.report(JobEvent::StepCompleted {
            job_id: &run.job.id,
            step,
        });
        self.save(&run.job);
    }

    /// Record a non-fatal step failure; only the first one is kept for the caller.
    fn fail_step<R: JobReporter>(&self, run: &mut Run<'_, R>, step: JobStep, error: AppError) {
        run.reporter.report(JobEvent::StepFailed {
            job_id: Some(&run.job.id),
            step,
            error: &error,
        });
        if run.first_failure.is_none() {
            run.job.error = Some(error.to_string());
            run.first_failure = Some(error.at_step(Some(&run.job.id), step));
        }
        self.save(&run.job);
    }

    /// Mark the job failed at `step` and build the error for the caller.
    fn abort<R: JobReporter>(&self, mut run: Run<'_, R>, step: JobStep, error: AppError) -> AppError {
        run.reporter.report(JobEvent::StepFailed {
            job_id: Some(&run.job.id),
            step,
            error: &error,
        });
        run.reporter.report(JobEvent::Failed {
            job_id: Some(&run.job.id),
            step,
        });
        run.job.status = JobStatus::Failed;
        run.job.error = Some(error.to_string());
        self.save(&run.job);
        error.at_step(Some(&run.job.id), step)
    }
}

/// The server answers the create call with `{"id": ...}`, string or number.
fn parse_job_id(response: &ResponseBody) -> Result<String, AppError> {
    let id = response.as_json().and_then(|body| body.get("id"));
    match id {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(AppError::UnexpectedResponse(format!(
            "create response carries no job id: {response}"
        ))),
    }
}
