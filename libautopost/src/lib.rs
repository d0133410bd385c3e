//! Autopost - quota-bound scheduled publishing to social platforms
//!
//! This library holds the publishing core: a per-cycle quota ledger, the post
//! lifecycle, a bounded worker queue that publishes through platform adapters,
//! credential refresh, and the enforcer that admits posts while their quota
//! cycle is active.

pub mod config;
pub mod db;
pub mod enforcer;
pub mod error;
pub mod ledger;
pub mod lifecycle;
pub mod logging;
pub mod platforms;
pub mod queue;
pub mod service;
pub mod throttle;
pub mod tokens;
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use db::{Database, PostFilter};
pub use enforcer::{AutoPostingEnforcer, EnforcementReport, RenewalReport};
pub use error::{AutopostError, ErrorClass, Result};
pub use ledger::QuotaLedger;
pub use lifecycle::PostLifecycle;
pub use queue::{DrainReport, PublishingQueue};
pub use service::events::{Event, EventBus};
pub use service::AutopostService;
pub use tokens::TokenRefreshManager;
pub use types::{CycleRenewed, Post, PostState, QuotaStatus, Subscriber};
