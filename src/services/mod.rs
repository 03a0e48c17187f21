pub mod billing_service;
pub mod usage_service;
pub mod user_service;
pub mod workflow_service;

pub use billing_service::BillingService;
pub use usage_service::{Metric, Tier, UsageService};
pub use user_service::UserService;
pub use workflow_service::WorkflowService;
