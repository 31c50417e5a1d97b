//! 业务服务层

pub mod approval_gate;
pub mod audit_service;
pub mod credential_broker;
pub mod dispatcher;
pub mod inventory;
pub mod issue_analysis;
pub mod poller;
pub mod scheduler;
pub mod secret_provider;
pub mod verification;

pub use approval_gate::ApprovalGate;
pub use audit_service::AuditService;
pub use credential_broker::CredentialBroker;
pub use dispatcher::{CommandDispatcher, DispatchParams};
pub use inventory::InventoryService;
pub use issue_analysis::IssueAnalysisService;
pub use poller::CompletionPoller;
pub use scheduler::{SchedulerSettings, WaveScheduler};
pub use secret_provider::SecretProvider;
pub use verification::VerificationService;
