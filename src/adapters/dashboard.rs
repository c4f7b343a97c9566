use std::path::PathBuf;

use async_trait::async_trait;
use minijinja::{Environment, context};
use tokio::sync::OnceCell;

use crate::{
    metrics::MetricsDocument,
    ports::template::{TemplateError, TemplateRenderer, TemplateResult},
};

const TEMPLATE_NAME: &str = "dashboard.html";

/// Renders the metrics dashboard with minijinja. The template source is
/// read from disk on first use and cached for the life of the process.
pub struct DashboardRenderer {
    template_path: PathBuf,
    source: OnceCell<String>,
}

impl DashboardRenderer {
    pub fn new(template_path: impl Into<PathBuf>) -> Self {
        Self {
            template_path: template_path.into(),
            source: OnceCell::new(),
        }
    }

    async fn source(&self) -> TemplateResult<&str> {
        let source = self
            .source
            .get_or_try_init(|| async {
                tracing::debug!(path = %self.template_path.display(), "Loading dashboard template");
                tokio::fs::read_to_string(&self.template_path)
                    .await
                    .map_err(|source| TemplateError::Io {
                        path: self.template_path.display().to_string(),
                        source,
                    })
            })
            .await?;
        Ok(source)
    }
}

#[async_trait]
impl TemplateRenderer for DashboardRenderer {
    async fn render_dashboard(&self, document: &MetricsDocument) -> TemplateResult<String> {
        let source = self.source().await?;

        let mut env = Environment::new();
        env.add_template(TEMPLATE_NAME, source)
            .map_err(|e| TemplateError::Render(e.to_string()))?;
        let template = env
            .get_template(TEMPLATE_NAME)
            .map_err(|e| TemplateError::Render(e.to_string()))?;

        template
            .render(context! {
                metrics => &document.metrics,
                routes => &document.routes,
            })
            .map_err(|e| TemplateError::Render(e.to_string()))
    }
}
