//! Gemeinsame Typen fuer das Kryptografie-Subsystem

use std::collections::{BTreeMap, BTreeSet};

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use fluester_core::{ConversationId, UserId};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::{CryptoError, CryptoResult};

/// Serde-Hilfsmodul: Bytes als Standard-Base64-String
pub mod b64 {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Sicherer Schluessel-Container (wird beim Drop genullt)
#[derive(Clone)]
pub struct SecretBytes(pub Vec<u8>);

impl Drop for SecretBytes {
    fn drop(&mut self) {
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

impl std::fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretBytes([REDACTED] {} bytes)", self.0.len())
    }
}

impl SecretBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Oeffentlicher X25519-Schluessel (32 Bytes, auf dem Draht Base64)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn from_base64(s: &str) -> CryptoResult<Self> {
        let bytes = STANDARD.decode(s.as_bytes())?;
        let len = bytes.len();
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::UngueltigeSchluesselLaenge {
                erwartet: 32,
                erhalten: len,
            })?;
        Ok(Self(arr))
    }

    /// Stabile Kurz-ID dieses Schluessels
    pub fn kid(&self) -> Kid {
        Kid::from_public_key(self)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self.kid())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Self::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

/// Key-ID: stabiler Hash eines oeffentlichen Schluessels
///
/// `kid = base64url(SHA-256(public_key)[..12])`, 16 Zeichen.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Kid(pub String);

impl Kid {
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let digest = Sha256::digest(public_key.as_bytes());
        Self(URL_SAFE_NO_PAD.encode(&digest[..12]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Kid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// AEAD-Algorithmus fuer Nachrichten- und Gruppen-Schluessel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum AeadAlgorithm {
    #[default]
    #[serde(rename = "aes256-gcm")]
    Aes256Gcm,
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
}

impl AeadAlgorithm {
    pub fn ist_standard(&self) -> bool {
        *self == Self::default()
    }
}

/// Ein fuer genau einen Empfaenger eingewickelter symmetrischer Schluessel
///
/// Unveraenderlich nach der Erstellung.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrappedKeyBlob {
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub iv: Vec<u8>,
    /// Oeffentlicher Schluessel des Verteilers zum Zeitpunkt des Einwickelns
    pub sender_public_key: PublicKey,
    /// Verteiler (wer den symmetrischen Schluessel erzeugt hat)
    pub from: UserId,
}

/// Eingewickelte Schluessel einer Epoch, nach Mitglied
pub type WrappedKeyMap = BTreeMap<UserId, WrappedKeyBlob>;

/// Vollstaendige Epoch-Historie: Version -> eingewickelte Schluessel
pub type KeyHistory = BTreeMap<u32, WrappedKeyMap>;

/// Verschluesselungsrelevanter Ausschnitt eines Unterhaltungs-Datensatzes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub members: BTreeSet<UserId>,
    pub owner: UserId,
    #[serde(default)]
    pub admins: BTreeSet<UserId>,
    /// 0 = (noch) unverschluesselt
    pub key_version: u32,
    /// Eingewickelte Schluessel der aktuellen Epoch
    #[serde(default)]
    pub encrypted_keys: WrappedKeyMap,
    /// Epoch-Historie; Eintraege werden nie geloescht oder ueberschrieben
    #[serde(default)]
    pub encrypted_keys_by_version: KeyHistory,
}

impl ConversationRecord {
    pub fn ist_mitglied(&self, user_id: UserId) -> bool {
        self.members.contains(&user_id)
    }

    /// Eigentuemer oder Admin
    pub fn ist_administrator(&self, user_id: UserId) -> bool {
        self.owner == user_id || self.admins.contains(&user_id)
    }

    pub fn ist_verschluesselt(&self) -> bool {
        self.key_version > 0
    }

    /// Eingewickelter Schluessel eines Mitglieds fuer eine Version.
    ///
    /// Faellt fuer die aktuelle Version auf `encrypted_keys` zurueck
    /// (Datensaetze ohne Historien-Eintrag).
    pub fn wrap_fuer(&self, version: u32, user_id: UserId) -> Option<&WrappedKeyBlob> {
        self.encrypted_keys_by_version
            .get(&version)
            .and_then(|map| map.get(&user_id))
            .or_else(|| {
                if version == self.key_version {
                    self.encrypted_keys.get(&user_id)
                } else {
                    None
                }
            })
    }
}
