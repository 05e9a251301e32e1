// Конфигурация приложения
// Логирование можно отключить только в режиме разработки

use crate::services::ReconnectPolicy;
use std::time::Duration;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true; // В режиме отладки логирование включено

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false; // В продакшене логирование отключено

// Дополнительные настройки для режима разработки
#[cfg(debug_assertions)]
pub mod dev {
    // Для полного отключения логирования в режиме разработки
    // измените эту константу на false
    pub const ENABLE_LOGGING: bool = true;
}

#[cfg(not(debug_assertions))]
pub mod dev {
    pub const ENABLE_LOGGING: bool = false;
}

/// Метка data channel для управляющих сообщений
pub const DATA_CHANNEL_LABEL: &str = "oai-events";

/// Модель по умолчанию, если ни настройки, ни минт её не прислали
pub const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview";

/// Параметры оркестратора звонка
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Период тикера прошедшего времени (квота)
    pub tick_interval: Duration,
    /// Период опроса счётчиков транспорта
    pub stats_interval: Duration,
    /// Сколько ждём сбора ICE кандидатов перед отправкой offer
    pub ice_gathering_timeout: Duration,
    pub http_timeout: Duration,
    /// Используется, если минт не прислал свою политику
    pub default_reconnect: ReconnectPolicy,
    /// Роль в perfect negotiation
    pub polite: bool,
    pub data_channel_label: String,
    pub default_model: String,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            stats_interval: Duration::from_secs(4),
            ice_gathering_timeout: Duration::from_secs(2),
            http_timeout: Duration::from_secs(10),
            default_reconnect: ReconnectPolicy::default(),
            polite: true,
            data_channel_label: DATA_CHANNEL_LABEL.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
        }
    }
}

impl CallConfig {
    /// Значения по умолчанию с переопределениями из окружения
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(ms) = parse_var::<u64>(&var, "REALTIME_CALL_TICK_MS") {
            self.tick_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&var, "REALTIME_CALL_STATS_MS") {
            self.stats_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&var, "REALTIME_CALL_GATHER_MS") {
            self.ice_gathering_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&var, "REALTIME_CALL_HTTP_TIMEOUT_MS") {
            self.http_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var::<u32>(&var, "REALTIME_CALL_RECONNECT_ATTEMPTS") {
            self.default_reconnect.max_attempts = n;
        }
        if let Some(ms) = parse_var::<u64>(&var, "REALTIME_CALL_BACKOFF_MS") {
            self.default_reconnect.backoff_ms = ms;
        }
        if let Some(model) = var("REALTIME_CALL_MODEL").filter(|m| !m.trim().is_empty()) {
            self.default_model = model;
        }
    }
}

fn parse_var<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring invalid {key}={raw:?}");
            None
        }
    }
}
