//! External collaborators of the call orchestrator.
//!
//! Persistence, identity and the back-end HTTP functions are reached through
//! the traits below. Their failures are opaque to the orchestrator, so the
//! traits return `anyhow::Result`; typed errors stay inside the implementations.

pub mod http;

use crate::config::CallConfig;
use crate::error::ServiceError;
use crate::peer::types::{IceServer, PeerConfig, ServerConfig};
use crate::session::control;
use crate::session::metrics::{MetricUpdate, SessionStart};
use crate::session::quota::{QuotaLimits, UsageDelta};
use crate::utils::{default_ice_servers, settings_ice_servers};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub use http::{HttpCredentialMinter, HttpSignaling};

/// Последняя поддерживаемая версия ответа минта
pub const MINT_RESPONSE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn current_user(&self) -> Option<UserId>;
}

/// Настройки пользователя; читаются один раз на звонок
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub ice_servers: Vec<ServerConfig>,
    pub model: Option<String>,
    pub instructions: Option<String>,
    pub response_modalities: Vec<String>,
    pub voice: Option<String>,
}

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn fetch_settings(&self) -> anyhow::Result<Settings>;
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MintRequest {
    pub session_id: Uuid,
    pub model: String,
}

/// Политика переподключения: задержка `backoff_ms * attempt`
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectPolicy {
    #[serde(alias = "max_attempts")]
    pub max_attempts: u32,
    #[serde(alias = "backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 1000,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(attempt)))
    }
}

/// Эфемерный ключ для signaling; затирается при drop
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct EphemeralSecret(String);

impl EphemeralSecret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for EphemeralSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EphemeralSecret(***)")
    }
}

impl<'de> Deserialize<'de> for EphemeralSecret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // ключ приходит строкой или объектом {"value": ..., "expires_at": ...}
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Plain(String),
            Wrapped { value: String },
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Plain(value) | Raw::Wrapped { value } => Self(value),
        })
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct MintFlags {
    pub instructions: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct MintResponse {
    pub version: u32,
    #[serde(alias = "client_secret", alias = "clientSecret")]
    pub secret: Option<EphemeralSecret>,
    #[serde(alias = "ice_servers")]
    pub ice_servers: Vec<IceServer>,
    pub model: Option<String>,
    pub flags: MintFlags,
    pub session: Option<Value>,
    pub reconnect: Option<ReconnectPolicy>,
}

#[async_trait]
pub trait CredentialMinter: Send + Sync {
    async fn mint(&self, request: &MintRequest) -> anyhow::Result<MintResponse>;
}

/// Обмен SDP offer на answer с realtime бэкендом
#[async_trait]
pub trait SignalingExchange: Send + Sync {
    async fn exchange(
        &self,
        model: &str,
        secret: &EphemeralSecret,
        offer_sdp: &str,
    ) -> anyhow::Result<String>;
}

#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn ensure_limits(&self, user: &UserId) -> anyhow::Result<QuotaLimits>;
    async fn update_limits(&self, user: &UserId, delta: UsageDelta) -> anyhow::Result<QuotaLimits>;
}

#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn insert_metric(&self, start: &SessionStart) -> anyhow::Result<()>;
    async fn update_metric(&self, session_id: Uuid, update: &MetricUpdate) -> anyhow::Result<()>;
}

/// Проверенный результат минта вместе с настройками.
///
/// Строится один раз на `start_call` и переиспользуется каждым переподключением.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub secret: EphemeralSecret,
    pub model: String,
    pub peer_config: Arc<PeerConfig>,
    pub reconnect: ReconnectPolicy,
    /// Полезная нагрузка `session.update` для data channel
    pub session_update: Value,
}

impl MintResponse {
    pub fn validate(&self) -> Result<(), ServiceError> {
        if self.version > MINT_RESPONSE_VERSION {
            return Err(ServiceError::UnsupportedVersion(self.version));
        }
        match &self.secret {
            Some(secret) if !secret.is_empty() => Ok(()),
            _ => Err(ServiceError::MissingSecret),
        }
    }

    pub fn into_context(
        self,
        settings: &Settings,
        config: &CallConfig,
    ) -> Result<CallContext, ServiceError> {
        self.validate()?;
        let secret = self.secret.ok_or(ServiceError::MissingSecret)?;

        // минт → настройки → публичный STUN
        let mut ice_servers = self.ice_servers;
        if ice_servers.is_empty() {
            ice_servers = settings_ice_servers(&settings.ice_servers);
        }
        if ice_servers.is_empty() {
            ice_servers = default_ice_servers();
        }

        let model = self
            .model
            .or_else(|| settings.model.clone())
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| config.default_model.clone());
        let instructions = self
            .flags
            .instructions
            .or_else(|| settings.instructions.clone());

        Ok(CallContext {
            secret,
            model,
            peer_config: Arc::new(PeerConfig {
                ice_servers,
                ice_candidate_pool_size: 0,
            }),
            reconnect: self.reconnect.unwrap_or(config.default_reconnect),
            session_update: control::session_update(
                instructions.as_deref(),
                &settings.response_modalities,
                settings.voice.as_deref(),
                self.session,
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mint_response_accepts_wrapped_secret_and_camel_case() {
        let mint: MintResponse = serde_json::from_value(json!({
            "version": 1,
            "client_secret": { "value": "ek_123", "expires_at": 1700000000 },
            "iceServers": [{ "urls": "turn:relay.example.org:3478", "username": "u", "credential": "c" }],
            "reconnect": { "maxAttempts": 5, "backoffMs": 250 }
        }))
        .unwrap();

        assert_eq!(mint.secret.as_ref().unwrap().expose(), "ek_123");
        assert_eq!(mint.ice_servers.len(), 1);
        assert_eq!(
            mint.reconnect,
            Some(ReconnectPolicy {
                max_attempts: 5,
                backoff_ms: 250
            })
        );
    }

    #[test]
    fn test_missing_secret_is_rejected() {
        let mint = MintResponse {
            secret: Some(EphemeralSecret::new("  ")),
            ..MintResponse::default()
        };
        assert!(matches!(mint.validate(), Err(ServiceError::MissingSecret)));
        assert!(matches!(
            MintResponse::default().into_context(&Settings::default(), &CallConfig::default()),
            Err(ServiceError::MissingSecret)
        ));
    }

    #[test]
    fn test_newer_version_is_rejected() {
        let mint = MintResponse {
            version: 2,
            secret: Some(EphemeralSecret::new("ek")),
            ..MintResponse::default()
        };
        assert!(matches!(
            mint.validate(),
            Err(ServiceError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn test_context_falls_back_to_settings_then_defaults() {
        let config = CallConfig::default();
        let settings = Settings {
            ice_servers: vec![ServerConfig {
                id: "1".into(),
                r#type: "turn".into(),
                url: "relay.example.org:3478".into(),
                username: Some("u".into()),
                credential: Some("c".into()),
            }],
            model: Some("custom-model".into()),
            instructions: Some("be brief".into()),
            ..Settings::default()
        };
        let mint = MintResponse {
            secret: Some(EphemeralSecret::new("ek")),
            ..MintResponse::default()
        };

        let ctx = mint.clone().into_context(&settings, &config).unwrap();
        assert_eq!(ctx.model, "custom-model");
        assert_eq!(
            ctx.peer_config.ice_servers[0].urls,
            vec!["turn:relay.example.org:3478".to_string()]
        );
        assert_eq!(ctx.reconnect, ReconnectPolicy::default());
        assert_eq!(ctx.session_update["session"]["instructions"], "be brief");

        let ctx = mint.into_context(&Settings::default(), &config).unwrap();
        assert_eq!(ctx.model, config.default_model);
        assert_eq!(ctx.peer_config.ice_servers, default_ice_servers());
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = EphemeralSecret::new("ek_live_secret");
        assert_eq!(format!("{secret:?}"), "EphemeralSecret(***)");
    }

    #[test]
    fn test_reconnect_delay_is_linear() {
        let policy = ReconnectPolicy {
            max_attempts: 3,
            backoff_ms: 1000,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(3000));
    }
}
