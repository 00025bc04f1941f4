//! Nachrichten-Envelope
//!
//! Der Envelope wird als JSON in das Textfeld einer Chat-Nachricht gelegt.
//! Am Transport-Rand wird der Text genau einmal klassifiziert
//! ([`Nachrichteninhalt::from_text`]), danach arbeitet alles mit dem
//! getypten Inhalt.
//!
//! ## Wire-Format
//! ```json
//! {"e2ee":true,"version":1,"ciphertext":"..","iv":"..",
//!  "senderKeyId":"..","recipientKeyId":"..",
//!  "senderPublicKey":"..","recipientPublicKey":"..","keyVersion":2}
//! ```

use serde::{Deserialize, Serialize};

use crate::aead::{self, SymmetricKey};
use crate::attachment::AnhangReferenz;
use crate::error::{CryptoError, CryptoResult};
use crate::identity::KeyPair;
use crate::types::{b64, AeadAlgorithm, Kid, PublicKey};

/// Aktuelle Envelope-Version
pub const ENVELOPE_VERSION: u32 = 1;

const ENVELOPE_AAD: &[u8] = b"fluester-envelope-v1";

/// Selbstbeschreibender Ciphertext einer Nachricht
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub e2ee: bool,
    pub version: u32,
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub iv: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_key_id: Option<Kid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_key_id: Option<Kid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_public_key: Option<PublicKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_public_key: Option<PublicKey>,
    /// Epoch des Gruppen-Schluessels; fehlt bei DMs und Alt-Nachrichten
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_version: Option<u32>,
    #[serde(default, skip_serializing_if = "AeadAlgorithm::ist_standard")]
    pub algorithm: AeadAlgorithm,
}

/// Metadaten, die beim Verschluesseln in den Envelope wandern
#[derive(Debug, Clone, Default)]
pub struct EnvelopeKontext {
    pub sender_key_id: Option<Kid>,
    pub recipient_key_id: Option<Kid>,
    pub sender_public_key: Option<PublicKey>,
    pub recipient_public_key: Option<PublicKey>,
    pub key_version: Option<u32>,
    pub algorithm: AeadAlgorithm,
}

impl EnvelopeKontext {
    /// Direktnachricht: beide oeffentlichen Schluessel einbetten
    pub fn dm(sender: &KeyPair, recipient: &PublicKey, algorithm: AeadAlgorithm) -> Self {
        Self {
            sender_key_id: Some(sender.kid.clone()),
            recipient_key_id: Some(recipient.kid()),
            sender_public_key: Some(sender.public_key),
            recipient_public_key: Some(*recipient),
            key_version: None,
            algorithm,
        }
    }

    /// Gruppennachricht: an eine Epoch gebunden
    pub fn gruppe(version: u32, algorithm: AeadAlgorithm) -> Self {
        Self {
            key_version: Some(version),
            algorithm,
            ..Self::default()
        }
    }
}

fn aad(key_version: Option<u32>) -> Vec<u8> {
    let mut aad = ENVELOPE_AAD.to_vec();
    if let Some(v) = key_version {
        aad.extend_from_slice(&v.to_be_bytes());
    }
    aad
}

/// Verschluesselt mit frischer IV
pub fn seal(
    plaintext: &[u8],
    key: &SymmetricKey,
    kontext: &EnvelopeKontext,
) -> CryptoResult<Envelope> {
    let sealed = aead::seal(kontext.algorithm, key, plaintext, &aad(kontext.key_version))?;
    Ok(Envelope {
        e2ee: true,
        version: ENVELOPE_VERSION,
        ciphertext: sealed.ciphertext,
        iv: sealed.iv.to_vec(),
        sender_key_id: kontext.sender_key_id.clone(),
        recipient_key_id: kontext.recipient_key_id.clone(),
        sender_public_key: kontext.sender_public_key,
        recipient_public_key: kontext.recipient_public_key,
        key_version: kontext.key_version,
        algorithm: kontext.algorithm,
    })
}

/// Entschluesselt und prueft Auth-Tag sowie gebundene Epoch
pub fn open(env: &Envelope, key: &SymmetricKey) -> CryptoResult<Vec<u8>> {
    if !env.e2ee || env.version != ENVELOPE_VERSION {
        return Err(CryptoError::UngueltigeDaten(format!(
            "Unbekannte Envelope-Version {}",
            env.version
        )));
    }
    aead::open(
        env.algorithm,
        key,
        &env.iv,
        &env.ciphertext,
        &aad(env.key_version),
    )
}

/// Diskriminante der strukturierten Nutzlast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NutzlastTyp {
    #[serde(rename = "attachments")]
    Anhaenge,
}

/// Nachricht mit Anhaengen (und optionalem Text)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrukturierteNutzlast {
    #[serde(rename = "type")]
    pub typ: NutzlastTyp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub attachments: Vec<AnhangReferenz>,
}

impl StrukturierteNutzlast {
    pub fn anhaenge(text: Option<String>, attachments: Vec<AnhangReferenz>) -> Self {
        Self {
            typ: NutzlastTyp::Anhaenge,
            text,
            attachments,
        }
    }
}

/// Getypter Inhalt des Textfelds einer Nachricht
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Nachrichteninhalt {
    Klartext(String),
    Strukturiert(StrukturierteNutzlast),
    Verschluesselt(Envelope),
}

/// Nur die Diskriminanten, ohne den Rest zu parsen
#[derive(Deserialize)]
struct Diskriminante {
    #[serde(default)]
    e2ee: bool,
    #[serde(rename = "type")]
    typ: Option<String>,
}

impl Nachrichteninhalt {
    /// Klassifiziert das Textfeld. Alles, was weder ein gueltiger Envelope
    /// noch eine gueltige strukturierte Nutzlast ist, bleibt Klartext.
    pub fn from_text(text: &str) -> Self {
        let trimmed = text.trim_start();
        if !trimmed.starts_with('{') {
            return Self::Klartext(text.to_string());
        }
        let Ok(d) = serde_json::from_str::<Diskriminante>(trimmed) else {
            return Self::Klartext(text.to_string());
        };

        if d.e2ee {
            if let Ok(env) = serde_json::from_str::<Envelope>(trimmed) {
                return Self::Verschluesselt(env);
            }
        } else if d.typ.as_deref() == Some("attachments") {
            if let Ok(nutzlast) = serde_json::from_str::<StrukturierteNutzlast>(trimmed) {
                return Self::Strukturiert(nutzlast);
            }
        }
        Self::Klartext(text.to_string())
    }

    pub fn to_text(&self) -> CryptoResult<String> {
        Ok(match self {
            Self::Klartext(text) => text.clone(),
            Self::Strukturiert(nutzlast) => serde_json::to_string(nutzlast)?,
            Self::Verschluesselt(env) => serde_json::to_string(env)?,
        })
    }

    pub fn ist_verschluesselt(&self) -> bool {
        matches!(self, Self::Verschluesselt(_))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
