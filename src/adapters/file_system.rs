use axum::body::Body as AxumBody;
use http_body_util::BodyExt;
use hyper::{Request, Response, Uri};
use tower::ServiceExt;
use tower_http::services::ServeDir;

use crate::ports::file_system::{FileSystem, FileSystemError};

/// Static file adapter backed by tower-http's `ServeDir`.
#[derive(Debug, Default, Clone)]
pub struct FileSystemAdapter;

impl FileSystemAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for FileSystemAdapter {
    async fn serve_file(
        &self,
        root: &str,
        path: &str,
        req: Request<AxumBody>,
    ) -> Result<Response<AxumBody>, FileSystemError> {
        let relative = path.trim_start_matches('/');
        if relative.split('/').any(|segment| segment == "..") {
            return Err(FileSystemError::InvalidPath(path.to_string()));
        }

        let uri = format!("/{relative}")
            .parse::<Uri>()
            .map_err(|e| FileSystemError::InvalidPath(format!("{path}: {e}")))?;
        let (mut parts, body) = req.into_parts();
        parts.uri = uri;

        let response = ServeDir::new(root)
            .append_index_html_on_directories(true)
            .oneshot(Request::from_parts(parts, body))
            .await
            .map_err(|e| FileSystemError::IoError(std::io::Error::other(e)))?;

        let (parts, body) = response.into_parts();
        let body = AxumBody::new(body.map_err(|e| {
            tracing::error!(error = %e, "Error reading static file body");
            axum::Error::new(e)
        }));
        Ok(Response::from_parts(parts, body))
    }
}
