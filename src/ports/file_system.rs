use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FileSystemError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

pub type FileSystemResult<T> = Result<T, FileSystemError>;

/// Port for serving static dashboard assets.
pub trait FileSystem: Send + Sync + 'static {
    /// Serve `path`, relative to `root`, answering `req`. Missing files
    /// produce a normal 404 response rather than an error.
    fn serve_file(
        &self,
        root: &str,
        path: &str,
        req: Request<AxumBody>,
    ) -> impl std::future::Future<Output = FileSystemResult<Response<AxumBody>>> + Send;
}
