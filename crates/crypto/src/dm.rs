//! Direktnachrichten: Schluessel-Ableitung und Entschluesselungs-Kette
//!
//! Der DM-Schluessel ist eine reine Funktion zweier Identitaets-Schluessel:
//!
//! ```text
//! shared = X25519(mein_privat, dein_oeffentlich)
//! salt   = min(pk_a, pk_b) || max(pk_a, pk_b)
//! key    = HKDF-SHA256(shared, salt, "fluester-dm-v1") -> 32 Bytes
//! ```
//!
//! Beide Seiten erhalten denselben Schluessel, unabhaengig davon, wer die
//! Unterhaltung beginnt. Kein Handshake vor der ersten Nachricht.

use std::sync::Arc;

use fluester_core::UserId;

use crate::aead::{hkdf_derive, SymmetricKey, KEY_LEN};
use crate::cache::KeyCache;
use crate::directory::PublicKeyDirectory;
use crate::envelope::{self, Envelope, EnvelopeKontext};
use crate::error::{CryptoError, CryptoResult};
use crate::identity::{KeyPair, SharedKeyRing};
use crate::types::{AeadAlgorithm, Kid, PublicKey};

const DM_INFO: &[u8] = b"fluester-dm-v1";

/// Leitet aus einem Schluessel-Paar und einem fremden oeffentlichen Schluessel
/// einen symmetrischen Schluessel ab. `info` trennt die Verwendungszwecke.
pub(crate) fn derive_pair_key(
    mine: &KeyPair,
    theirs: &PublicKey,
    info: &[u8],
) -> CryptoResult<SymmetricKey> {
    let shared = mine.diffie_hellman(theirs)?;

    let (a, b) = if mine.public_key.as_bytes() <= theirs.as_bytes() {
        (mine.public_key.as_bytes(), theirs.as_bytes())
    } else {
        (theirs.as_bytes(), mine.public_key.as_bytes())
    };
    let mut salt = Vec::with_capacity(64);
    salt.extend_from_slice(a);
    salt.extend_from_slice(b);

    SymmetricKey::from_bytes(hkdf_derive(shared.as_bytes(), &salt, info, KEY_LEN)?)
}

/// DM-Schluessel zweier Identitaeten (symmetrisch)
pub fn derive_dm_key(mine: &KeyPair, theirs: &PublicKey) -> CryptoResult<SymmetricKey> {
    derive_pair_key(mine, theirs, DM_INFO)
}

/// Cached abgeleitete DM-Schluessel nach `(mein_kid, dein_kid)`
#[derive(Debug, Default)]
pub struct DmKeyDeriver {
    cache: KeyCache<(Kid, Kid), SymmetricKey>,
}

impl DmKeyDeriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn derive(&self, mine: &KeyPair, theirs: &PublicKey) -> CryptoResult<SymmetricKey> {
        let cache_key = (mine.kid.clone(), theirs.kid());
        if let Some(key) = self.cache.get(&cache_key) {
            return Ok(key);
        }
        let key = derive_dm_key(mine, theirs)?;
        self.cache.put(cache_key, key.clone());
        Ok(key)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// Welche Stufe der Kette die Nachricht entschluesselt hat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmStrategie {
    /// Im Envelope eingebettete oeffentliche Schluessel, ohne Netzwerk
    Eingebettet,
    /// Kid-Treffer im KeyRing plus Verzeichnis-Schluessel aus dem Cache
    KeyRing,
    /// Erzwungen neu geladener Schluessel des Peers
    Aktualisiert,
}

/// Erfolgreich entschluesselte Direktnachricht
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmEntschluesselung {
    pub klartext: Vec<u8>,
    pub strategie: DmStrategie,
}

/// Ver- und Entschluesselung von Direktnachrichten eines lokalen Benutzers
pub struct DmCrypto {
    user_id: UserId,
    ring: SharedKeyRing,
    directory: Arc<PublicKeyDirectory>,
    deriver: DmKeyDeriver,
    algorithm: AeadAlgorithm,
}

impl DmCrypto {
    pub fn new(
        user_id: UserId,
        ring: SharedKeyRing,
        directory: Arc<PublicKeyDirectory>,
        algorithm: AeadAlgorithm,
    ) -> Self {
        Self {
            user_id,
            ring,
            directory,
            deriver: DmKeyDeriver::new(),
            algorithm,
        }
    }

    fn aktuelles_paar(&self) -> CryptoResult<KeyPair> {
        self.ring
            .read()
            .current()
            .cloned()
            .ok_or(CryptoError::KeineIdentitaet(self.user_id))
    }

    /// Verschluesselt fuer einen Peer.
    ///
    /// Ohne veroeffentlichten Schluessel des Peers: [`CryptoError::MissingRecipientKey`].
    pub async fn encrypt(&self, peer: UserId, plaintext: &[u8]) -> CryptoResult<Envelope> {
        let mine = self.aktuelles_paar()?;
        let theirs = self.directory.require(peer, false).await?;
        let key = self.deriver.derive(&mine, &theirs)?;
        envelope::seal(
            plaintext,
            &key,
            &EnvelopeKontext::dm(&mine, &theirs, self.algorithm),
        )
    }

    /// Entschluesselt eine Direktnachricht von oder an `peer`.
    ///
    /// Reihenfolge: eingebettete Schluessel, KeyRing + Verzeichnis,
    /// erzwungene Aktualisierung. Sind alle Stufen erschoepft, folgt
    /// [`CryptoError::DecryptionUnresolved`].
    pub async fn decrypt(&self, peer: UserId, env: &Envelope) -> CryptoResult<DmEntschluesselung> {
        // Stufe 1: eingebettete oeffentliche Schluessel
        if let Some((mine, theirs)) = self.eingebettetes_paar(env) {
            if let Some(klartext) = self.versuchen(&mine, &theirs, env) {
                return Ok(DmEntschluesselung {
                    klartext,
                    strategie: DmStrategie::Eingebettet,
                });
            }
        }

        let kandidaten = self.kandidaten(env);

        // Stufe 2: Kid-Treffer im KeyRing mit dem (gecachten) Verzeichnis-Schluessel
        if let Some(theirs) = self.verzeichnis(peer, false).await {
            if let Some(klartext) = kandidaten
                .iter()
                .find_map(|mine| self.versuchen(mine, &theirs, env))
            {
                return Ok(DmEntschluesselung {
                    klartext,
                    strategie: DmStrategie::KeyRing,
                });
            }
        }

        // Stufe 3: Peer hat evtl. rotiert
        if let Some(theirs) = self.verzeichnis(peer, true).await {
            let alle: Vec<KeyPair> = self.ring.read().newest_first().cloned().collect();
            if let Some(klartext) = kandidaten
                .iter()
                .chain(alle.iter())
                .find_map(|mine| self.versuchen(mine, &theirs, env))
            {
                return Ok(DmEntschluesselung {
                    klartext,
                    strategie: DmStrategie::Aktualisiert,
                });
            }
        }

        tracing::debug!(peer = %peer, "DM-Entschluesselung: alle Strategien erschoepft");
        Err(CryptoError::DecryptionUnresolved {
            grund: format!("Kein passender Schluessel fuer die Direktnachricht mit {peer}"),
        })
    }

    /// Verzeichnis-Abfrage; Transportfehler beenden nur die jeweilige Stufe
    async fn verzeichnis(&self, peer: UserId, force: bool) -> Option<PublicKey> {
        match self.directory.get_public_key(peer, force).await {
            Ok(pk) => pk,
            Err(e) => {
                tracing::warn!(peer = %peer, force, fehler = %e, "Verzeichnis nicht erreichbar");
                None
            }
        }
    }

    /// Eigenes Paar und Gegenseite aus den eingebetteten oeffentlichen Schluesseln
    fn eingebettetes_paar(&self, env: &Envelope) -> Option<(KeyPair, PublicKey)> {
        let (sender, empfaenger) = (env.sender_public_key?, env.recipient_public_key?);
        let ring = self.ring.read();
        if let Some(mine) = ring.find_by_public(&empfaenger) {
            return Some((mine.clone(), sender));
        }
        ring.find_by_public(&sender).map(|mine| (mine.clone(), empfaenger))
    }

    /// KeyRing-Eintraege, deren Kid im Envelope steht; sonst der ganze Ring
    fn kandidaten(&self, env: &Envelope) -> Vec<KeyPair> {
        let ring = self.ring.read();
        let treffer: Vec<KeyPair> = [env.recipient_key_id.as_ref(), env.sender_key_id.as_ref()]
            .into_iter()
            .flatten()
            .filter_map(|kid| ring.get(kid).cloned())
            .collect();
        if treffer.is_empty() {
            ring.newest_first().cloned().collect()
        } else {
            treffer
        }
    }

    fn versuchen(&self, mine: &KeyPair, theirs: &PublicKey, env: &Envelope) -> Option<Vec<u8>> {
        let key = self.deriver.derive(mine, theirs).ok()?;
        envelope::open(env, &key).ok()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::KeyRing;
    use crate::server::{InMemoryKeyServer, KeyServer};
    use parking_lot::RwLock;

    fn ring_mit(pair: &KeyPair) -> SharedKeyRing {
        let mut ring = KeyRing::new();
        ring.push(pair.clone());
        Arc::new(RwLock::new(ring))
    }

    #[test]
    fn dm_schluessel_ist_symmetrisch() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let ab = derive_dm_key(&a, &b.public_key).unwrap();
        let ba = derive_dm_key(&b, &a.public_key).unwrap();
        assert_eq!(ab.as_bytes(), ba.as_bytes());

        let c = KeyPair::generate();
        let ac = derive_dm_key(&a, &c.public_key).unwrap();
        assert_ne!(ab.as_bytes(), ac.as_bytes());
    }

    #[test]
    fn deriver_cached_nach_kid_paar() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        let deriver = DmKeyDeriver::new();
        deriver.derive(&a, &b.public_key).unwrap();
        deriver.derive(&a, &b.public_key).unwrap();
        assert_eq!(deriver.len(), 1);
    }

    #[tokio::test]
    async fn empfaenger_ohne_schluessel_bricht_ab() {
        let server = Arc::new(InMemoryKeyServer::new());
        let dir = Arc::new(PublicKeyDirectory::new(server));
        let a = KeyPair::generate();
        let alice = DmCrypto::new(UserId::new(), ring_mit(&a), dir, AeadAlgorithm::default());

        let result = alice.encrypt(UserId::new(), b"hallo").await;
        assert!(matches!(result, Err(CryptoError::MissingRecipientKey { .. })));
    }

    #[tokio::test]
    async fn rotierter_peer_wird_ueber_aktualisierung_gefunden() {
        let server = Arc::new(InMemoryKeyServer::new());
        let (alice_id, bob_id) = (UserId::new(), UserId::new());
        let (a, b_alt) = (KeyPair::generate(), KeyPair::generate());
        server.publish_public_key(alice_id, &a.public_key).await.unwrap();
        server.publish_public_key(bob_id, &b_alt.public_key).await.unwrap();

        let alice_dir = Arc::new(PublicKeyDirectory::new(server.clone()));
        let alice = DmCrypto::new(alice_id, ring_mit(&a), alice_dir, AeadAlgorithm::default());
        // Alice hat den alten Schluessel im Cache
        alice.directory.get_public_key(bob_id, false).await.unwrap();

        // Bob rotiert und schickt eine Nachricht ohne eingebettete Schluessel
        let b_neu = KeyPair::generate();
        server.publish_public_key(bob_id, &b_neu.public_key).await.unwrap();
        let bob_dir = Arc::new(PublicKeyDirectory::new(server.clone()));
        let bob = DmCrypto::new(bob_id, ring_mit(&b_neu), bob_dir, AeadAlgorithm::default());
        let mut env = bob.encrypt(alice_id, b"neu").await.unwrap();
        env.sender_public_key = None;
        env.recipient_public_key = None;

        let ergebnis = alice.decrypt(bob_id, &env).await.unwrap();
        assert_eq!(ergebnis.klartext, b"neu");
        assert_eq!(ergebnis.strategie, DmStrategie::Aktualisiert);
    }

    #[tokio::test]
    async fn fremde_nachricht_bleibt_ungeloest() {
        let server = Arc::new(InMemoryKeyServer::new());
        let (alice_id, bob_id) = (UserId::new(), UserId::new());
        let (a, b, x) = (KeyPair::generate(), KeyPair::generate(), KeyPair::generate());
        server.publish_public_key(alice_id, &a.public_key).await.unwrap();
        server.publish_public_key(bob_id, &b.public_key).await.unwrap();

        // Nachricht zwischen Bob und einem Dritten
        let key = derive_dm_key(&b, &x.public_key).unwrap();
        let env = envelope::seal(
            b"nicht fuer alice",
            &key,
            &EnvelopeKontext::dm(&b, &x.public_key, AeadAlgorithm::default()),
        )
        .unwrap();

        let dir = Arc::new(PublicKeyDirectory::new(server));
        let alice = DmCrypto::new(alice_id, ring_mit(&a), dir, AeadAlgorithm::default());
        assert!(matches!(
            alice.decrypt(bob_id, &env).await,
            Err(CryptoError::DecryptionUnresolved { .. })
        ));
    }
}
