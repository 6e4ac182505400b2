//! Built-in checks. Domain checks (portfolio, market, relationship,
//! predictive) are external collaborators plugged in through [`HttpCheck`]
//! or any other [`tidewatch_core::traits::Check`] implementation.

pub mod http;
pub mod system_health;

pub use http::HttpCheck;
pub use system_health::{SYSTEM_HEALTH_CHECK, SystemHealthCheck};
