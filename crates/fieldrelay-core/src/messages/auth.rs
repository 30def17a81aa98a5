//! Connection authentication and handshake messages

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha512};

use super::Envelope;

/// Build a one-time authentication code for a secret key.
///
/// Format: `<first 3 + last 3 key chars>;<nonce>;<base64 sha512(nonce;key)>`
/// with a fresh random nonce each call.
pub fn build_auth_code(secret_key: &str) -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    auth_code_with_nonce(secret_key, &STANDARD.encode(bytes))
}

/// Auth code for a given nonce
pub fn auth_code_with_nonce(secret_key: &str, nonce: &str) -> String {
    let digest = Sha512::digest(format!("{};{}", nonce, secret_key).as_bytes());
    format!(
        "{};{};{}",
        key_hint(secret_key),
        nonce,
        STANDARD.encode(digest)
    )
}

fn key_hint(secret_key: &str) -> String {
    let chars: Vec<char> = secret_key.chars().collect();
    let head: String = chars.iter().take(3).collect();
    let tail: String = chars[chars.len().saturating_sub(3)..].iter().collect();
    format!("{}{}", head, tail)
}

/// Messages sent at the head of the queue on every (re)connect
#[derive(Debug, Clone, Default)]
pub struct Handshake {
    /// Also receive messages addressed to child folders
    pub subscribe_children: bool,
    /// Authenticate with an explicit `connect` message instead of HTTP credentials
    pub old_auth: Option<LegacyAuth>,
}

/// Credentials for the `connect` message
#[derive(Debug, Clone)]
pub struct LegacyAuth {
    /// Controller secret key
    pub secret_key: String,
    /// `<version>:<build>`
    pub version: String,
    /// Controller display name, if configured
    pub name: Option<String>,
}

impl Handshake {
    /// Handshake messages in send order; auth codes are fresh on each call
    pub fn messages(&self) -> Vec<Envelope> {
        let mut messages = Vec::new();
        if let Some(auth) = &self.old_auth {
            let mut params = Map::new();
            params.insert("authCode".into(), Value::String(build_auth_code(&auth.secret_key)));
            params.insert("version".into(), Value::String(auth.version.clone()));
            if let Some(name) = &auth.name {
                params.insert("name".into(), Value::String(name.clone()));
            }
            messages.push(Envelope::new("connect", Value::Object(params)));
        }
        messages.push(Envelope::new(
            "subscribe",
            json!({
                "subscriptions": [
                    {"folder": "self", "include_children": self.subscribe_children}
                ]
            }),
        ));
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_code_known_nonce() {
        assert_eq!(
            auth_code_with_nonce("abcdefghij", "nonce"),
            "abchij;nonce;VImQuoiyatJEb/oeJCem1Z5llR+SDgGfRIoc9V2a4HO5rTxRACmmDsARbMhVf/Kv+rK9+/DnJn4TBW+afYJOkQ=="
        );
    }

    #[test]
    fn test_auth_code_fresh_nonce() {
        let a = build_auth_code("abcdefghij");
        let b = build_auth_code("abcdefghij");
        assert_ne!(a, b);
        assert!(a.starts_with("abchij;"));
        assert_eq!(a.split(';').count(), 3);
    }

    #[test]
    fn test_handshake_subscribe_only() {
        let messages = Handshake::default().messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_type, "subscribe");
        assert_eq!(
            messages[0].parameters["subscriptions"][0]["folder"],
            json!("self")
        );
    }

    #[test]
    fn test_handshake_connect_first() {
        let handshake = Handshake {
            subscribe_children: true,
            old_auth: Some(LegacyAuth {
                secret_key: "abcdefghij".into(),
                version: "0.1.0:abc".into(),
                name: Some("greenhouse".into()),
            }),
        };
        let messages = handshake.messages();
        let types: Vec<&str> = messages.iter().map(|m| m.message_type.as_str()).collect();
        assert_eq!(types, vec!["connect", "subscribe"]);
        assert_eq!(messages[0].parameters["name"], json!("greenhouse"));
        assert_eq!(
            messages[1].parameters["subscriptions"][0]["include_children"],
            json!(true)
        );
    }
}
