pub mod dashboard;
pub mod file_system;
pub mod health_checker;
pub mod http_client;
pub mod http_handler;
pub mod middleware;

pub use dashboard::DashboardRenderer;
pub use file_system::FileSystemAdapter;
pub use health_checker::HealthChecker;
pub use http_client::HttpClientAdapter;
pub use http_handler::{HttpHandler, build_router};
