//! Verzeichnis oeffentlicher Schluessel
//!
//! Holt oeffentliche Schluessel vom Server und cached sie pro Benutzer.
//! `force` umgeht den Cache (nach einer Rotation beim Peer).

use std::sync::Arc;

use fluester_core::UserId;

use crate::cache::KeyCache;
use crate::error::{CryptoError, CryptoResult};
use crate::server::KeyServer;
use crate::types::PublicKey;

/// Client fuer `GET /users/{id}/public-key` mit Cache
pub struct PublicKeyDirectory {
    server: Arc<dyn KeyServer>,
    cache: KeyCache<UserId, PublicKey>,
}

impl PublicKeyDirectory {
    pub fn new(server: Arc<dyn KeyServer>) -> Self {
        Self {
            server,
            cache: KeyCache::new(),
        }
    }

    /// Veroeffentlicht den eigenen Schluessel und traegt ihn in den Cache ein
    pub async fn publish(&self, user_id: UserId, public_key: &PublicKey) -> CryptoResult<()> {
        self.server.publish_public_key(user_id, public_key).await?;
        self.cache.put(user_id, *public_key);
        tracing::debug!(user = %user_id, kid = %public_key.kid(), "Oeffentlicher Schluessel veroeffentlicht");
        Ok(())
    }

    /// Oeffentlicher Schluessel eines Benutzers; `None` wenn nie veroeffentlicht
    pub async fn get_public_key(
        &self,
        user_id: UserId,
        force: bool,
    ) -> CryptoResult<Option<PublicKey>> {
        if !force {
            if let Some(pk) = self.cache.get(&user_id) {
                return Ok(Some(pk));
            }
        }

        let (geholt, _) = self.neu_laden(user_id).await?;
        Ok(geholt)
    }

    /// Holt den Schluessel immer vom Server. Das zweite Feld ist `true`,
    /// wenn er sich gegenueber dem gecachten Stand geaendert hat (auch
    /// wenn vorher keiner bekannt war).
    pub async fn neu_laden(&self, user_id: UserId) -> CryptoResult<(Option<PublicKey>, bool)> {
        let alt = self.cache.get(&user_id);
        let geholt = self.server.fetch_public_key(user_id).await?;
        match geholt {
            Some(pk) => {
                if alt.is_some_and(|a| a != pk) {
                    tracing::info!(user = %user_id, kid = %pk.kid(), "Oeffentlicher Schluessel hat sich geaendert");
                }
                self.cache.put(user_id, pk);
            }
            None => {
                self.cache.invalidate(&user_id);
            }
        }
        Ok((geholt, geholt != alt))
    }

    /// Wie [`get_public_key`](Self::get_public_key), aber ein fehlender Schluessel ist ein Fehler
    pub async fn require(&self, user_id: UserId, force: bool) -> CryptoResult<PublicKey> {
        self.get_public_key(user_id, force)
            .await?
            .ok_or(CryptoError::MissingRecipientKey { user_id })
    }

    pub fn invalidate(&self, user_id: UserId) {
        self.cache.invalidate(&user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::InMemoryKeyServer;

    #[tokio::test]
    async fn cache_spart_anfragen() {
        let server = Arc::new(InMemoryKeyServer::new());
        let user = UserId::new();
        server.publish_public_key(user, &PublicKey([5u8; 32])).await.unwrap();

        let dir = PublicKeyDirectory::new(server.clone());
        let vorher = server.anfragen();
        dir.get_public_key(user, false).await.unwrap();
        dir.get_public_key(user, false).await.unwrap();
        assert_eq!(server.anfragen(), vorher + 1);

        dir.get_public_key(user, true).await.unwrap();
        assert_eq!(server.anfragen(), vorher + 2);
    }

    #[tokio::test]
    async fn force_holt_rotierten_schluessel() {
        let server = Arc::new(InMemoryKeyServer::new());
        let user = UserId::new();
        server.publish_public_key(user, &PublicKey([1u8; 32])).await.unwrap();

        let dir = PublicKeyDirectory::new(server.clone());
        dir.get_public_key(user, false).await.unwrap();
        server.publish_public_key(user, &PublicKey([2u8; 32])).await.unwrap();

        assert_eq!(dir.get_public_key(user, false).await.unwrap(), Some(PublicKey([1u8; 32])));
        assert_eq!(dir.get_public_key(user, true).await.unwrap(), Some(PublicKey([2u8; 32])));
    }

    #[tokio::test]
    async fn neu_laden_meldet_nur_echte_aenderungen() {
        let server = Arc::new(InMemoryKeyServer::new());
        let user = UserId::new();
        server.publish_public_key(user, &PublicKey([1u8; 32])).await.unwrap();

        let dir = PublicKeyDirectory::new(server.clone());
        // Erstes Laden: vorher unbekannt
        assert_eq!(dir.neu_laden(user).await.unwrap(), (Some(PublicKey([1u8; 32])), true));
        // Unveraendert auf dem Server
        assert_eq!(dir.neu_laden(user).await.unwrap(), (Some(PublicKey([1u8; 32])), false));

        server.publish_public_key(user, &PublicKey([2u8; 32])).await.unwrap();
        assert_eq!(dir.neu_laden(user).await.unwrap(), (Some(PublicKey([2u8; 32])), true));
        assert_eq!(dir.neu_laden(user).await.unwrap(), (Some(PublicKey([2u8; 32])), false));
    }

    #[tokio::test]
    async fn fehlender_schluessel() {
        let dir = PublicKeyDirectory::new(Arc::new(InMemoryKeyServer::new()));
        let user = UserId::new();
        assert!(dir.get_public_key(user, false).await.unwrap().is_none());
        assert!(matches!(
            dir.require(user, false).await,
            Err(CryptoError::MissingRecipientKey { user_id }) if user_id == user
        ));
    }
}
