use async_trait::async_trait;
use thiserror::Error;

use crate::metrics::MetricsDocument;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TemplateError {
    /// The template source could not be read.
    #[error("Failed to read template {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The template failed to compile or render.
    #[error("Template error: {0}")]
    Render(String),
}

pub type TemplateResult<T> = Result<T, TemplateError>;

/// Renders the HTML view of the parsed metrics.
#[async_trait]
pub trait TemplateRenderer: Send + Sync + 'static {
    async fn render_dashboard(&self, document: &MetricsDocument) -> TemplateResult<String>;
}
