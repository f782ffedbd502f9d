use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of an extraction job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// One step of the extraction workflow, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStep {
    Create,
    Structure,
    Design,
    SourceCode,
    ComponentLibrary,
    AssetManifest,
    AssetUpload,
    Responsive,
    ResponsiveVariants,
    ResponsiveCss,
    Complete,
}

impl JobStep {
    /// Steps that must have completed before this one may run.
    pub fn dependencies(&self) -> &'static [JobStep] {
        match self {
            JobStep::Create => &[],
            JobStep::Structure => &[JobStep::Create],
            JobStep::Design
            | JobStep::SourceCode
            | JobStep::ComponentLibrary
            | JobStep::AssetManifest
            | JobStep::Responsive => &[JobStep::Structure],
            JobStep::AssetUpload => &[JobStep::AssetManifest],
            JobStep::ResponsiveVariants => &[JobStep::Design, JobStep::Responsive],
            JobStep::ResponsiveCss => &[JobStep::Responsive],
            JobStep::Complete => &[JobStep::Structure],
        }
    }

    /// Path below `extractions/{id}/`; `None` for the create call.
    pub fn path(&self) -> Option<&'static str> {
        match self {
            JobStep::Create => None,
            JobStep::Structure => Some("structure"),
            JobStep::Design => Some("design"),
            JobStep::SourceCode => Some("code"),
            JobStep::ComponentLibrary => Some("components"),
            JobStep::AssetManifest => Some("assets"),
            JobStep::AssetUpload => Some("assets/upload"),
            JobStep::Responsive => Some("responsive"),
            JobStep::ResponsiveVariants => Some("responsive/variants"),
            JobStep::ResponsiveCss => Some("responsive/css"),
            JobStep::Complete => Some("complete"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStep::Create => "create",
            JobStep::Structure => "structure",
            JobStep::Design => "design",
            JobStep::SourceCode => "source_code",
            JobStep::ComponentLibrary => "component_library",
            JobStep::AssetManifest => "asset_manifest",
            JobStep::AssetUpload => "asset_upload",
            JobStep::Responsive => "responsive",
            JobStep::ResponsiveVariants => "responsive_variants",
            JobStep::ResponsiveCss => "responsive_css",
            JobStep::Complete => "complete",
        }
    }
}

impl fmt::Display for JobStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which optional artifacts the user asked for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionFlags {
    pub design: bool,
    pub source_code: bool,
    pub component_library: bool,
    pub assets: bool,
    pub responsive: bool,
}

impl ExtractionFlags {
    pub fn all() -> Self {
        Self {
            design: true,
            source_code: true,
            component_library: true,
            assets: true,
            responsive: true,
        }
    }
}

/// Parameters for starting an extraction.
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub url: String,
    pub title: String,
    pub settings: serde_json::Value,
    pub flags: ExtractionFlags,
}

impl ExtractionRequest {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            settings: serde_json::json!({}),
            flags: ExtractionFlags::default(),
        }
    }

    pub fn with_settings(mut self, settings: serde_json::Value) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_flags(mut self, flags: ExtractionFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Body of the create call.
    pub fn create_body(&self, now: DateTime<Utc>) -> serde_json::Value {
        serde_json::json!({
            "url": self.url,
            "title": self.title,
            "settings": self.settings,
            "timestamp": now.timestamp_millis(),
        })
    }
}

/// In-memory record of one extraction run.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionJob {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub status: JobStatus,
    pub steps_completed: Vec<JobStep>,
    pub steps_skipped: Vec<JobStep>,
    pub uploaded_assets: Vec<String>,
    pub error: Option<String>,
}

impl ExtractionJob {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
            status: JobStatus::Running,
            steps_completed: Vec::new(),
            steps_skipped: Vec::new(),
            uploaded_assets: Vec::new(),
            error: None,
        }
    }

    pub fn has_completed(&self, step: JobStep) -> bool {
        self.steps_completed.contains(&step)
    }

    /// True when every dependency of `step` has completed.
    pub fn is_ready(&self, step: JobStep) -> bool {
        step.dependencies().iter().all(|dep| self.has_completed(*dep))
    }

    /// Endpoint for a step of this job.
    pub fn endpoint(&self, step: JobStep) -> String {
        match step.path() {
            Some(path) => format!("extractions/{}/{}", self.id, path),
            None => "extractions".to_string(),
        }
    }
}
