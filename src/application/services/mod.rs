pub mod config_service;
pub mod report_service;
pub mod session_service;

pub use config_service::{CheckReport, ConfigService};
pub use report_service::{render_logs, render_table, ReportService};
pub use session_service::{BoundRepository, SessionService};
