pub mod config;
pub mod error;
pub mod logger;
pub mod peer;
pub mod services;
pub mod session;
pub mod utils;

#[cfg(test)]
mod testing;

pub use config::CallConfig;
pub use error::{CallError, PeerError, ServiceError};
pub use services::{
    CallContext, CredentialMinter, EphemeralSecret, HttpCredentialMinter, HttpSignaling,
    IdentityProvider, MetricsStore, MintRequest, MintResponse, QuotaStore, ReconnectPolicy,
    Settings, SettingsStore, SignalingExchange, UserId,
};
pub use session::events::{CallEvent, LastError, SessionSnapshot};
pub use session::machine::CallState;
pub use session::metrics::{MetricUpdate, SessionStart};
pub use session::quota::{QuotaLimits, UsageDelta};
pub use session::{CallHandle, ImagePayload, Services, StartOptions};
