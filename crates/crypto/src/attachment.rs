//! Anhang-Schluessel
//!
//! Jede Datei bekommt einen eigenen Einmal-Schluessel samt IV, unabhaengig
//! vom Schluessel der Unterhaltung. Schluessel und IV reisen in der
//! (bereits verschluesselten) Nachricht mit, die Datei selbst wird als
//! undurchsichtiger Ciphertext hochgeladen.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::aead::{self, random_iv, SymmetricKey, IV_LEN};
use crate::error::{CryptoError, CryptoResult};
use crate::types::AeadAlgorithm;

/// Maximale Laenge der kodierten Schluessel- und IV-Felder
pub const MAX_FELD_LAENGE: usize = 128;

const ANHANG_AAD: &[u8] = b"fluester-attachment-v1";

/// Einmal-Schluessel einer Datei
#[derive(Debug, Clone)]
pub struct DateiSchluessel {
    key: SymmetricKey,
    iv: [u8; IV_LEN],
}

/// Erzeugt Schluessel und IV fuer genau eine Datei
pub fn new_file_key() -> DateiSchluessel {
    DateiSchluessel {
        key: SymmetricKey::generate(),
        iv: random_iv(),
    }
}

fn feld_pruefen(feld: &'static str, wert: &str) -> CryptoResult<()> {
    if wert.len() > MAX_FELD_LAENGE {
        return Err(CryptoError::FeldZuLang {
            feld,
            laenge: wert.len(),
            max: MAX_FELD_LAENGE,
        });
    }
    Ok(())
}

impl DateiSchluessel {
    pub fn export_key(&self) -> String {
        self.key.export()
    }

    pub fn export_iv(&self) -> String {
        STANDARD.encode(self.iv)
    }

    /// Importiert Schluessel und IV aus einer Nachricht.
    ///
    /// Ueberlange Felder werden vor jedem Dekodieren abgelehnt.
    pub fn import(key: &str, iv: &str) -> CryptoResult<Self> {
        feld_pruefen("key", key)?;
        feld_pruefen("iv", iv)?;

        let key = SymmetricKey::import(key)?;
        let iv_bytes = STANDARD.decode(iv.as_bytes())?;
        let iv: [u8; IV_LEN] =
            iv_bytes
                .as_slice()
                .try_into()
                .map_err(|_| CryptoError::UngueltigeNonce {
                    erwartet: IV_LEN,
                    erhalten: iv_bytes.len(),
                })?;
        Ok(Self { key, iv })
    }
}

/// Verschluesselt eine Datei mit einem frischen Einmal-Schluessel
pub fn encrypt_file(daten: &[u8]) -> CryptoResult<(Vec<u8>, DateiSchluessel)> {
    let schluessel = new_file_key();
    let sealed = aead::seal_with_iv(
        AeadAlgorithm::Aes256Gcm,
        &schluessel.key,
        &schluessel.iv,
        daten,
        ANHANG_AAD,
    )?;
    Ok((sealed.ciphertext, schluessel))
}

/// Entschluesselt eine Datei mit den Feldern aus der Nachricht
pub fn decrypt_file(ciphertext: &[u8], key: &str, iv: &str) -> CryptoResult<Vec<u8>> {
    let schluessel = DateiSchluessel::import(key, iv)?;
    aead::open(
        AeadAlgorithm::Aes256Gcm,
        &schluessel.key,
        &schluessel.iv,
        ciphertext,
        ANHANG_AAD,
    )
}

/// Verweis auf eine hochgeladene, verschluesselte Datei
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnhangReferenz {
    pub file_id: String,
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    pub key: String,
    pub iv: String,
}

impl AnhangReferenz {
    pub fn neu(
        file_id: impl Into<String>,
        name: impl Into<String>,
        mime_type: impl Into<String>,
        size: u64,
        schluessel: &DateiSchluessel,
    ) -> Self {
        Self {
            file_id: file_id.into(),
            name: name.into(),
            mime_type: mime_type.into(),
            size,
            key: schluessel.export_key(),
            iv: schluessel.export_iv(),
        }
    }

    /// Entschluesselt den heruntergeladenen Ciphertext dieses Anhangs
    pub fn entschluesseln(&self, ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        decrypt_file(ciphertext, &self.key, &self.iv)
    }
}
