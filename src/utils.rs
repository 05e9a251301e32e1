use crate::peer::types::{IceServer, ServerConfig};
use base64::{engine::general_purpose, Engine as _};
use uuid::Uuid;

/// Короткий случайный идентификатор для треков и логов
pub fn random_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}

/// Новый идентификатор сессии звонка
pub fn new_session_id() -> Uuid {
    Uuid::new_v4()
}

// Функция для добавления схемы протокола к URL ICE сервера, если она отсутствует
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    // Если url уже начинается с "turn:", "turns:" или "stun:", возвращаем как есть
    if has_ice_scheme(&config.url) {
        config.url.clone()
    } else {
        // В зависимости от типа сервера добавляем нужную схему
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}

fn has_ice_scheme(url: &str) -> bool {
    url.starts_with("turn:") || url.starts_with("turns:") || url.starts_with("stun:")
}

/// Серверы из настроек в форме RTCIceServer
pub fn settings_ice_servers(servers: &[ServerConfig]) -> Vec<IceServer> {
    servers
        .iter()
        .filter(|config| !config.url.trim().is_empty())
        .map(|config| IceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone(),
            credential: config.credential.clone(),
        })
        .collect()
}

/// Дефолтные публичные STUN серверы
pub fn default_ice_servers() -> Vec<IceServer> {
    vec![IceServer {
        urls: vec![
            "stun:stun.l.google.com:19302".into(),
            "stun:stun1.l.google.com:19302".into(),
        ],
        username: None,
        credential: None,
    }]
}

/// data: URL для отправки изображения через data channel
pub fn image_data_url(mime_type: &str, bytes: &[u8]) -> String {
    format!(
        "data:{};base64,{}",
        mime_type,
        general_purpose::STANDARD.encode(bytes)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(kind: &str, url: &str) -> ServerConfig {
        ServerConfig {
            id: "s".into(),
            r#type: kind.into(),
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    #[test]
    fn test_add_ice_url_scheme() {
        assert_eq!(
            add_ice_url_scheme(&server("turn", "relay.example.org:3478")),
            "turn:relay.example.org:3478"
        );
        assert_eq!(
            add_ice_url_scheme(&server("stun", "stun.example.org")),
            "stun:stun.example.org"
        );
        assert_eq!(
            add_ice_url_scheme(&server("turn", "turns:relay.example.org:443")),
            "turns:relay.example.org:443"
        );
    }

    #[test]
    fn test_settings_ice_servers_skip_empty_urls() {
        let servers = settings_ice_servers(&[server("stun", ""), server("turn", "relay:3478")]);
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls, vec!["turn:relay:3478".to_string()]);
    }

    #[test]
    fn test_image_data_url() {
        assert_eq!(image_data_url("image/png", b"abc"), "data:image/png;base64,YWJj");
    }

    #[test]
    fn test_random_id_is_short_and_unique() {
        let a = random_id();
        assert_eq!(a.len(), 16);
        assert_ne!(a, random_id());
    }
}
