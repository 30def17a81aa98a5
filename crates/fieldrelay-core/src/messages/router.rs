//! Inbound message dispatch
//!
//! A few message types are handled here directly (`get_config`,
//! `set_config`, `shutdown`); everything else goes to the registered
//! handlers in order, then to the catch-all handler.

use serde_json::{Map, Value};
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

use super::{Envelope, OutboundQueue};
use crate::config::SharedConfig;

/// What a handler did with a message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandlerOutcome {
    /// The handler recognized the message; later handlers are skipped
    pub used: bool,
    /// Reply to send back on the message's channel
    pub response: Option<Envelope>,
}

impl HandlerOutcome {
    /// Not handled; try the next handler
    pub fn unused() -> Self {
        Self::default()
    }

    /// Handled with no reply
    pub fn used() -> Self {
        Self {
            used: true,
            response: None,
        }
    }

    /// Handled; send `response` back on the same channel
    pub fn respond(response: Envelope) -> Self {
        Self {
            used: true,
            response: Some(response),
        }
    }
}

/// Receives server messages
pub trait MessageHandler: Send + Sync {
    /// Handle one message; a used outcome stops later handlers
    fn handle_message(&self, message_type: &str, parameters: &Value) -> HandlerOutcome;
}

impl<F> MessageHandler for F
where
    F: Fn(&str, &Value) -> HandlerOutcome + Send + Sync,
{
    fn handle_message(&self, message_type: &str, parameters: &Value) -> HandlerOutcome {
        self(message_type, parameters)
    }
}

/// Routes inbound messages to handlers and queues their responses
pub struct MessageRouter {
    config: SharedConfig,
    queue: Arc<OutboundQueue>,
    handlers: RwLock<Vec<Arc<dyn MessageHandler>>>,
    fallback: RwLock<Option<Arc<dyn MessageHandler>>>,
    shutdown: CancellationToken,
}

impl MessageRouter {
    /// Router with the built-in config and shutdown messages
    pub fn new(config: SharedConfig, queue: Arc<OutboundQueue>, shutdown: CancellationToken) -> Self {
        Self {
            config,
            queue,
            handlers: RwLock::new(Vec::new()),
            fallback: RwLock::new(None),
            shutdown,
        }
    }

    /// Add a handler; handlers are consulted in registration order
    pub fn add_handler(&self, handler: Arc<dyn MessageHandler>) {
        write(&self.handlers).push(handler);
    }

    /// Handler for messages no other handler used
    pub fn set_fallback(&self, handler: Arc<dyn MessageHandler>) {
        *write(&self.fallback) = Some(handler);
    }

    /// Parse and dispatch one inbound text message
    pub fn dispatch_text(&self, text: &str) {
        match Envelope::parse(text) {
            Ok(envelope) => self.dispatch(envelope),
            Err(e) => tracing::warn!("unable to parse server message ({}): {}", e, text),
        }
    }

    /// Dispatch a parsed message
    pub fn dispatch(&self, envelope: Envelope) {
        let Envelope {
            message_type,
            parameters,
            channel,
            ..
        } = envelope;
        tracing::debug!("message: {}", message_type);

        let response = match message_type.as_str() {
            "get_config" | "getConfig" => Some(self.config_message(&parameters)),
            "set_config" | "setConfig" => {
                self.update_config(&parameters);
                None
            }
            "shutdown" => {
                tracing::info!("shutdown requested by server");
                self.shutdown.cancel();
                None
            }
            _ => self.run_handlers(&message_type, &parameters),
        };

        if let Some(response) = response {
            self.queue.push(response.with_channel(channel));
        }
    }

    fn run_handlers(&self, message_type: &str, parameters: &Value) -> Option<Envelope> {
        let handlers: Vec<Arc<dyn MessageHandler>> = read(&self.handlers).clone();
        for handler in handlers {
            let outcome = handler.handle_message(message_type, parameters);
            if outcome.used {
                return outcome.response;
            }
        }
        let fallback = read(&self.fallback).clone();
        match fallback {
            Some(handler) => handler.handle_message(message_type, parameters).response,
            None => None,
        }
    }

    /// `config` message with the requested entries (missing ones are empty strings)
    pub fn config_message(&self, parameters: &Value) -> Envelope {
        let names = parameters
            .get("names")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let config = read(&self.config);
        let values: Map<String, Value> = names
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(|name| {
                let value = config
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| Value::String(String::new()));
                (name.to_string(), value)
            })
            .collect();
        Envelope::new("config", Value::Object(values))
    }

    fn update_config(&self, parameters: &Value) {
        let Some(entries) = parameters.as_object() else {
            tracing::warn!("set_config parameters must be an object");
            return;
        };
        let mut config = write(&self.config);
        for (key, value) in entries {
            config.set(key, value.clone());
        }
        match config.save_local(entries) {
            Ok(()) => tracing::info!("updated config: {}", entries.keys().cloned().collect::<Vec<_>>().join(", ")),
            Err(e) => tracing::warn!("unable to persist config update: {}", e),
        }
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("handlers", &read(&self.handlers).len())
            .finish_non_exhaustive()
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Mutex;

    fn router() -> (MessageRouter, Arc<OutboundQueue>, SharedConfig, CancellationToken) {
        let config = Config::from_value(json!({"name": "greenhouse"}))
            .unwrap()
            .into_shared();
        let queue = Arc::new(OutboundQueue::new());
        let token = CancellationToken::new();
        (
            MessageRouter::new(config.clone(), queue.clone(), token.clone()),
            queue,
            config,
            token,
        )
    }

    #[test]
    fn test_get_config_reply_on_channel() {
        let (router, queue, _, _) = router();
        router.dispatch_text(
            r#"{"type": "get_config", "parameters": {"names": "name,missing"}, "channel": "c1"}"#,
        );
        let sent = queue.snapshot();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].envelope.message_type, "config");
        assert_eq!(sent[0].envelope.channel.as_deref(), Some("c1"));
        assert_eq!(
            sent[0].envelope.parameters,
            json!({"name": "greenhouse", "missing": ""})
        );
    }

    #[test]
    fn test_set_config_without_file_updates_memory() {
        let (router, queue, config, _) = router();
        router.dispatch_text(r#"{"setConfig": {"serial.polling": true}}"#);
        assert!(config.read().unwrap().get_bool("serial.polling", false));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_shutdown_cancels_token() {
        let (router, _, _, token) = router();
        router.dispatch_text("shutdown");
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_first_used_handler_wins() {
        let (router, queue, _, _) = router();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let log = seen.clone();
        router.add_handler(Arc::new(move |t: &str, _: &Value| {
            log.lock().unwrap().push(format!("first:{}", t));
            if t == "a" {
                HandlerOutcome::respond(Envelope::new("a_done", json!({})))
            } else {
                HandlerOutcome::unused()
            }
        }));
        let log = seen.clone();
        router.add_handler(Arc::new(move |t: &str, _: &Value| {
            log.lock().unwrap().push(format!("second:{}", t));
            HandlerOutcome::used()
        }));
        let log = seen.clone();
        router.set_fallback(Arc::new(move |t: &str, _: &Value| {
            log.lock().unwrap().push(format!("fallback:{}", t));
            HandlerOutcome::unused()
        }));

        router.dispatch_text(r#"{"type": "a", "parameters": {}}"#);
        router.dispatch_text(r#"{"type": "b", "parameters": {}}"#);

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["first:a", "first:b", "second:b"]
        );
        assert_eq!(queue.pending_types(), vec!["a_done"]);
    }

    #[test]
    fn test_fallback_when_unused() {
        let (router, _, _, _) = router();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        router.set_fallback(Arc::new(move |t: &str, p: &Value| {
            log.lock().unwrap().push((t.to_string(), p.clone()));
            HandlerOutcome::used()
        }));

        router.dispatch_text("custom,{\"x\": 2}");
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("custom".to_string(), json!({"x": 2}))]
        );
    }

    #[test]
    fn test_unparsable_message_ignored() {
        let (router, queue, _, _) = router();
        router.dispatch_text("{not json");
        assert!(queue.is_empty());
    }
}
