//! Brain MRI tumor classification with Grad-CAM explanations, served as a
//! Spin HTTP component.

use std::sync::OnceLock;

use anyhow::Result;
use spin_sdk::http::{IntoResponse, Method, Request, Response};
use spin_sdk::variables;

pub mod analysis;
pub mod classifier;
pub mod config;
pub mod error;
pub mod explain;
pub mod preprocess;
pub mod render;
pub mod validator;

pub use analysis::{AnalysisResponse, Analyzer};
pub use classifier::{Classifier, Prediction, TUMOR_LABELS};
pub use config::AnalyzerConfig;
pub use error::{AnalysisError, SetupError, Stage};
pub use explain::{Explanation, GradCam, SaliencyMap};
pub use render::HeatmapRenderer;
pub use validator::{Validation, Validator};

/// Installs the global subscriber. Later calls are no-ops.
pub fn init_tracing(filter: &str) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

static ANALYZER: OnceLock<Analyzer> = OnceLock::new();

fn analyzer() -> Result<&'static Analyzer> {
    if let Some(analyzer) = ANALYZER.get() {
        return Ok(analyzer);
    }
    let config = AnalyzerConfig::from_lookup(|key| variables::get(key).ok())?;
    init_tracing(&config.log_filter);
    let analyzer = Analyzer::from_config(&config)?;
    Ok(ANALYZER.get_or_init(|| analyzer))
}

/// Status, content type and body of one HTTP answer.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl Reply {
    fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: "text/plain",
            body: body.to_string(),
        }
    }

    fn json(status: u16, body: &impl serde::Serialize) -> Result<Self> {
        Ok(Self {
            status,
            content_type: "application/json",
            body: serde_json::to_string(body)?,
        })
    }
}

/// Decides the answer to one request. `analyzer` is only consulted once the
/// request carries an image.
pub fn respond<'a>(
    method: &Method,
    body: &[u8],
    analyzer: impl FnOnce() -> Result<&'a Analyzer>,
) -> Result<Reply> {
    if !matches!(method, Method::Post) {
        return Ok(Reply::text(405, "Only POST is supported."));
    }
    if body.is_empty() {
        return Ok(Reply::text(400, "No image data received."));
    }

    let analyzer = match analyzer() {
        Ok(analyzer) => analyzer,
        Err(err) => {
            tracing::error!(error = ?err, "analyzer could not be initialised");
            return Reply::json(500, &serde_json::json!({ "error": "Model unavailable" }));
        }
    };

    match analyzer.analyze(body) {
        Ok(response) => Reply::json(200, &response),
        Err(err) => error_reply(&err),
    }
}

fn error_reply(err: &AnalysisError) -> Result<Reply> {
    tracing::error!(error = ?err, stage = %err.stage(), "analysis failed");
    let status = if err.is_client_error() { 400 } else { 500 };
    Reply::json(status, &serde_json::json!({ "error": err.to_string() }))
}

/// Accepts a raw JPEG or PNG body and answers with an [`AnalysisResponse`].
#[cfg_attr(target_arch = "wasm32", spin_sdk::http_component)]
fn handle_mri_analysis(req: Request) -> Result<impl IntoResponse> {
    let reply = respond(req.method(), req.body(), analyzer)?;
    let mut builder = Response::builder();
    builder
        .status(reply.status)
        .header("content-type", reply.content_type);
    if reply.status == 405 {
        builder.header("allow", "POST");
    }
    Ok(builder.body(reply.body).build())
}
