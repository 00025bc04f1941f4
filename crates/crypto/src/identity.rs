//! Langzeit-Identitaetsschluessel (X25519)
//!
//! Jeder Benutzer erhaelt beim ersten Start ein X25519-Schluessel-Paar.
//! Der oeffentliche Schluessel wird im Verzeichnis des Servers
//! veroeffentlicht, der private Schluessel verlaesst das Geraet nie.
//!
//! Der KeyRing ist append-only: eine Rotation fuegt einen Eintrag hinzu,
//! alte Eintraege bleiben, weil alte DMs und Wraps auf sie verweisen.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use fluester_core::UserId;
use parking_lot::RwLock;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::error::{CryptoError, CryptoResult};
use crate::store::{KeyScope, KeyStore};
use crate::types::{Kid, PublicKey, SecretBytes};

/// Ein Identitaets-Schluessel-Paar
#[derive(Clone)]
pub struct KeyPair {
    pub kid: Kid,
    pub public_key: PublicKey,
    private_key: SecretBytes,
}

impl KeyPair {
    /// Generiert ein neues X25519-Schluessel-Paar
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self::from_secret(&secret)
    }

    /// Erstellt ein Paar aus einem privaten Schluessel (32 Bytes)
    pub fn from_private_bytes(bytes: [u8; 32]) -> Self {
        Self::from_secret(&StaticSecret::from(bytes))
    }

    fn from_secret(secret: &StaticSecret) -> Self {
        let public_key = PublicKey(X25519PublicKey::from(secret).to_bytes());
        Self {
            kid: public_key.kid(),
            public_key,
            private_key: SecretBytes::new(secret.to_bytes().to_vec()),
        }
    }

    /// X25519-Schluesselvereinbarung mit einem fremden oeffentlichen Schluessel.
    ///
    /// Lehnt Punkte kleiner Ordnung ab (nicht-beitragendes Ergebnis).
    pub fn diffie_hellman(&self, their: &PublicKey) -> CryptoResult<SecretBytes> {
        let bytes: [u8; 32] = self.private_key.as_bytes().try_into().map_err(|_| {
            CryptoError::UngueltigeSchluesselLaenge {
                erwartet: 32,
                erhalten: self.private_key.len(),
            }
        })?;
        let secret = StaticSecret::from(bytes);
        let shared = secret.diffie_hellman(&X25519PublicKey::from(*their.as_bytes()));
        if !shared.was_contributory() {
            return Err(CryptoError::UngueltigeDaten(
                "Oeffentlicher Schluessel kleiner Ordnung".into(),
            ));
        }
        Ok(SecretBytes::new(shared.as_bytes().to_vec()))
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyPair {{ kid: {}, private_key: [X25519 StaticSecret] }}", self.kid)
    }
}

/// Persistierte Form eines KeyRing-Eintrags
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GespeichertesPaar {
    kid: Kid,
    public_key: PublicKey,
    private_key: String,
}

/// Alle Identitaets-Generationen eines lokalen Kontos, aelteste zuerst
#[derive(Debug, Clone, Default)]
pub struct KeyRing {
    eintraege: Vec<KeyPair>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Neuester Eintrag
    pub fn current(&self) -> Option<&KeyPair> {
        self.eintraege.last()
    }

    pub fn get(&self, kid: &Kid) -> Option<&KeyPair> {
        self.eintraege.iter().find(|p| &p.kid == kid)
    }

    pub fn find_by_public(&self, public_key: &PublicKey) -> Option<&KeyPair> {
        self.eintraege.iter().find(|p| &p.public_key == public_key)
    }

    /// Eintraege, neueste zuerst
    pub fn newest_first(&self) -> impl Iterator<Item = &KeyPair> {
        self.eintraege.iter().rev()
    }

    /// Fuegt ein Paar hinzu; vorhandene Kids werden nie ersetzt
    pub fn push(&mut self, pair: KeyPair) -> bool {
        if self.get(&pair.kid).is_some() {
            return false;
        }
        self.eintraege.push(pair);
        true
    }

    pub fn len(&self) -> usize {
        self.eintraege.len()
    }

    pub fn is_empty(&self) -> bool {
        self.eintraege.is_empty()
    }

    pub fn to_bytes(&self) -> CryptoResult<Vec<u8>> {
        let gespeichert: Vec<GespeichertesPaar> = self
            .eintraege
            .iter()
            .map(|p| GespeichertesPaar {
                kid: p.kid.clone(),
                public_key: p.public_key,
                private_key: STANDARD.encode(p.private_key.as_bytes()),
            })
            .collect();
        Ok(serde_json::to_vec(&gespeichert)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        let gespeichert: Vec<GespeichertesPaar> = serde_json::from_slice(bytes)?;
        let mut ring = Self::new();
        for eintrag in gespeichert {
            let privat = STANDARD.decode(eintrag.private_key.as_bytes())?;
            let len = privat.len();
            let privat: [u8; 32] =
                privat
                    .try_into()
                    .map_err(|_| CryptoError::UngueltigeSchluesselLaenge {
                        erwartet: 32,
                        erhalten: len,
                    })?;
            let pair = KeyPair::from_private_bytes(privat);
            if pair.public_key != eintrag.public_key || pair.kid != eintrag.kid {
                return Err(CryptoError::UngueltigeDaten(format!(
                    "KeyRing-Eintrag {} passt nicht zu seinem privaten Schluessel",
                    eintrag.kid
                )));
            }
            ring.push(pair);
        }
        Ok(ring)
    }
}

/// Von Identitaet, Gruppen-Manager und DM-Ableitung gemeinsam genutzter KeyRing
pub type SharedKeyRing = Arc<RwLock<KeyRing>>;

/// Ergebnis von [`IdentityStore::load_or_create`]
#[derive(Debug, Clone)]
pub struct LoadedIdentity {
    pub key_pair: KeyPair,
    pub kid: Kid,
    pub ring: KeyRing,
    /// true wenn das Paar gerade erst erzeugt wurde
    pub neu_erstellt: bool,
}

/// Laedt und persistiert KeyRings ueber einen [`KeyStore`]
pub struct IdentityStore {
    store: Arc<dyn KeyStore>,
}

impl IdentityStore {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self { store }
    }

    /// Laedt den KeyRing eines Benutzers (leer wenn keiner existiert)
    pub async fn load_ring(&self, user_id: UserId) -> CryptoResult<KeyRing> {
        match self.store.load(&KeyScope::KeyRing(user_id)).await? {
            Some(bytes) => KeyRing::from_bytes(&bytes),
            None => Ok(KeyRing::new()),
        }
    }

    /// Gibt das neueste Paar zurueck oder erzeugt beim ersten Aufruf eines
    pub async fn load_or_create(&self, user_id: UserId) -> CryptoResult<LoadedIdentity> {
        let mut ring = self.load_ring(user_id).await?;

        if let Some(pair) = ring.current() {
            return Ok(LoadedIdentity {
                key_pair: pair.clone(),
                kid: pair.kid.clone(),
                ring: ring.clone(),
                neu_erstellt: false,
            });
        }

        let pair = KeyPair::generate();
        ring.push(pair.clone());
        self.store
            .save(&KeyScope::KeyRing(user_id), &ring.to_bytes()?)
            .await?;
        tracing::info!(user = %user_id, kid = %pair.kid, "Identitaets-Schluessel erzeugt");

        Ok(LoadedIdentity {
            kid: pair.kid.clone(),
            key_pair: pair,
            ring,
            neu_erstellt: true,
        })
    }

    /// Rotiert die Identitaet: neues Paar anhaengen, alte behalten
    pub async fn rotate(&self, user_id: UserId) -> CryptoResult<LoadedIdentity> {
        let mut ring = self.load_ring(user_id).await?;
        let pair = KeyPair::generate();
        ring.push(pair.clone());
        self.store
            .save(&KeyScope::KeyRing(user_id), &ring.to_bytes()?)
            .await?;
        tracing::info!(
            user = %user_id,
            kid = %pair.kid,
            generationen = ring.len(),
            "Identitaets-Schluessel rotiert"
        );

        Ok(LoadedIdentity {
            kid: pair.kid.clone(),
            key_pair: pair,
            ring,
            neu_erstellt: true,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
