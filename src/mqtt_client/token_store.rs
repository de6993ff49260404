use std::collections::HashMap;
use std::sync::Mutex;

use tracing::trace;

use super::error::{MqttClientError, MqttClientResult};
use super::lock;
use super::token::MqttToken;
use crate::mqtt_serde::control_packet::MqttPacket;
use crate::mqtt_serde::publish::MqttPublish;

pub(crate) const CONNECT_KEY: &str = "Con";
pub(crate) const PING_KEY: &str = "Ping";
pub(crate) const DISCONNECT_KEY: &str = "Disc";

/// Token store key of a packet: the packet id for id-bearing packets, a
/// fixed name for the singleton exchanges.
pub(crate) fn packet_key(packet: &MqttPacket) -> Option<String> {
    match packet {
        MqttPacket::Connect(_) | MqttPacket::ConnAck(_) => Some(CONNECT_KEY.to_string()),
        MqttPacket::PingReq | MqttPacket::PingResp => Some(PING_KEY.to_string()),
        MqttPacket::Disconnect(_) => Some(DISCONNECT_KEY.to_string()),
        other => other.packet_id().map(|id| id.to_string()),
    }
}

#[derive(Default)]
struct StoreInner {
    tokens: HashMap<String, MqttToken>,
    // latched by quiesce; every save fails with it until reopened
    closed: Option<MqttClientError>,
}

/// Maps operation keys to their tokens. Lock order: the session queue lock
/// may be held while calling in here, never the reverse.
#[derive(Default)]
pub struct TokenStore {
    inner: Mutex<StoreInner>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save_token(&self, token: &MqttToken, key: &str) -> MqttClientResult<()> {
        let mut inner = lock(&self.inner);
        if let Some(reason) = &inner.closed {
            return Err(reason.clone());
        }
        token.set_key(key);
        inner.tokens.insert(key.to_string(), token.clone());
        trace!(key, "token saved");
        Ok(())
    }

    pub fn save_for_packet(&self, token: &MqttToken, packet: &MqttPacket) -> MqttClientResult<()> {
        match packet_key(packet) {
            Some(key) => self.save_token(token, &key),
            None => Err(MqttClientError::InternalError {
                message: format!("{} has no token key", packet.name()),
            }),
        }
    }

    pub fn get_token(&self, key: &str) -> Option<MqttToken> {
        lock(&self.inner).tokens.get(key).cloned()
    }

    pub fn get_for_packet(&self, packet: &MqttPacket) -> Option<MqttToken> {
        packet_key(packet).and_then(|key| self.get_token(&key))
    }

    pub fn remove_token(&self, key: &str) -> Option<MqttToken> {
        lock(&self.inner).tokens.remove(key)
    }

    /// Finds or re-creates the delivery token for a publish recovered from
    /// persistence. Works even while the store is quiesced.
    pub fn restore_token(&self, publish: &MqttPublish) -> MqttToken {
        let key = publish.packet_id.map(|id| id.to_string()).unwrap_or_default();
        let mut inner = lock(&self.inner);
        if let Some(existing) = inner.tokens.get(&key) {
            return existing.clone();
        }
        let token = MqttToken::for_packet(&MqttPacket::Publish(publish.clone()));
        token.set_key(&key);
        inner.tokens.insert(key, token.clone());
        token
    }

    pub fn quiesce(&self, reason: MqttClientError) {
        lock(&self.inner).closed = Some(reason);
    }

    pub fn open(&self) {
        lock(&self.inner).closed = None;
    }

    pub fn count(&self) -> usize {
        lock(&self.inner).tokens.len()
    }

    pub fn outstanding_tokens(&self) -> Vec<MqttToken> {
        lock(&self.inner)
            .tokens
            .values()
            .filter(|t| !t.is_complete())
            .cloned()
            .collect()
    }

    /// Delivery tokens still tracked by the session, ordered by packet id.
    pub fn outstanding_delivery_tokens(&self) -> Vec<MqttToken> {
        let mut tokens: Vec<MqttToken> = lock(&self.inner)
            .tokens
            .values()
            .filter(|t| t.is_delivery())
            .cloned()
            .collect();
        tokens.sort_by_key(|t| t.message_id());
        tokens
    }

    pub fn clear(&self) {
        lock(&self.inner).tokens.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt_serde::connect::MqttConnect;

    #[test]
    fn test_packet_keys() {
        assert_eq!(
            packet_key(&MqttPacket::Connect(MqttConnect::new("c", 0, true))).as_deref(),
            Some("Con")
        );
        assert_eq!(packet_key(&MqttPacket::PingReq).as_deref(), Some("Ping"));
        let mut publish = MqttPublish::new(0, "t", vec![]);
        assert_eq!(packet_key(&MqttPacket::Publish(publish.clone())), None);
        publish.packet_id = Some(12);
        assert_eq!(packet_key(&MqttPacket::Publish(publish)).as_deref(), Some("12"));
    }

    #[test]
    fn test_save_get_remove() {
        let store = TokenStore::new();
        let token = MqttToken::new();
        store.save_token(&token, "5").unwrap();
        assert_eq!(token.key(), "5");
        assert!(store.get_token("5").unwrap().ptr_eq(&token));
        assert_eq!(store.count(), 1);
        assert_eq!(store.outstanding_tokens().len(), 1);
        assert!(store.remove_token("5").is_some());
        assert!(store.get_token("5").is_none());
    }

    #[test]
    fn test_quiesce_rejects_saves() {
        let store = TokenStore::new();
        store.quiesce(MqttClientError::ClientDisconnecting);
        assert!(matches!(
            store.save_token(&MqttToken::new(), "1"),
            Err(MqttClientError::ClientDisconnecting)
        ));

        let mut publish = MqttPublish::new(1, "t", vec![]);
        publish.packet_id = Some(3);
        let restored = store.restore_token(&publish);
        assert!(store.restore_token(&publish).ptr_eq(&restored));
        assert_eq!(store.outstanding_delivery_tokens().len(), 1);

        store.open();
        assert!(store.save_token(&MqttToken::new(), "1").is_ok());
        store.clear();
        assert_eq!(store.count(), 0);
    }
}
