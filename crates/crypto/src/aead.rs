//! AEAD-Primitive
//!
//! Schluessel erzeugen, importieren/exportieren und authentifiziert
//! ver-/entschluesseln. Alles oberhalb dieses Moduls (Envelope, Wraps,
//! Anhaenge) geht ausschliesslich hier durch.
//!
//! ## Format
//! ```text
//! iv(12) + ciphertext + auth_tag(16)
//! ```
//! Die IV wird pro Aufruf frisch aus dem OS-Zufallsgenerator gezogen und
//! darf unter demselben Schluessel nie wiederverwendet werden.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Key, Nonce as AesNonce,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chacha20poly1305::{ChaCha20Poly1305, Key as ChaChaKey, Nonce as ChaChaNonce};
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;

use crate::error::{CryptoError, CryptoResult};
use crate::types::{AeadAlgorithm, SecretBytes};

/// Schluessellaenge in Bytes (256 Bit)
pub const KEY_LEN: usize = 32;
/// IV-Laenge in Bytes (96 Bit)
pub const IV_LEN: usize = 12;

/// Symmetrischer 256-Bit-Schluessel
#[derive(Debug, Clone)]
pub struct SymmetricKey {
    bytes: SecretBytes,
}

impl SymmetricKey {
    /// Erzeugt einen neuen zufaelligen Schluessel
    pub fn generate() -> Self {
        let mut key_bytes = vec![0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key_bytes);
        Self {
            bytes: SecretBytes::new(key_bytes),
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> CryptoResult<Self> {
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::UngueltigeSchluesselLaenge {
                erwartet: KEY_LEN,
                erhalten: bytes.len(),
            });
        }
        Ok(Self {
            bytes: SecretBytes::new(bytes),
        })
    }

    /// Importiert einen exportierten Schluessel-String (Base64)
    pub fn import(key_string: &str) -> CryptoResult<Self> {
        Self::from_bytes(STANDARD.decode(key_string.as_bytes())?)
    }

    /// Exportiert den Schluessel als Base64-String (fuer lokale Persistenz)
    pub fn export(&self) -> String {
        STANDARD.encode(self.bytes.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.bytes.as_bytes()
    }
}

/// Ergebnis einer Verschluesselung
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub iv: [u8; IV_LEN],
    /// Ciphertext inkl. 16 Bytes Auth-Tag (angehaengt)
    pub ciphertext: Vec<u8>,
}

/// Frische zufaellige IV
pub fn random_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    OsRng.fill_bytes(&mut iv);
    iv
}

/// Verschluesselt mit frischer IV
pub fn seal(
    algorithm: AeadAlgorithm,
    key: &SymmetricKey,
    plaintext: &[u8],
    aad: &[u8],
) -> CryptoResult<Sealed> {
    let iv = random_iv();
    seal_with_iv(algorithm, key, &iv, plaintext, aad)
}

/// Verschluesselt mit vorgegebener IV.
///
/// Nur fuer Einmal-Schluessel (Anhaenge), deren IV zusammen mit dem
/// Schluessel erzeugt wurde.
pub fn seal_with_iv(
    algorithm: AeadAlgorithm,
    key: &SymmetricKey,
    iv: &[u8; IV_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> CryptoResult<Sealed> {
    let ciphertext = match algorithm {
        AeadAlgorithm::Aes256Gcm => encrypt_aes256gcm(plaintext, key.as_bytes(), iv, aad)?,
        AeadAlgorithm::ChaCha20Poly1305 => {
            encrypt_chacha20(plaintext, key.as_bytes(), iv, aad)?
        }
    };
    Ok(Sealed {
        iv: *iv,
        ciphertext,
    })
}

/// Entschluesselt und verifiziert den Auth-Tag
pub fn open(
    algorithm: AeadAlgorithm,
    key: &SymmetricKey,
    iv: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> CryptoResult<Vec<u8>> {
    let iv: &[u8; IV_LEN] = iv.try_into().map_err(|_| CryptoError::UngueltigeNonce {
        erwartet: IV_LEN,
        erhalten: iv.len(),
    })?;

    match algorithm {
        AeadAlgorithm::Aes256Gcm => decrypt_aes256gcm(ciphertext, key.as_bytes(), iv, aad),
        AeadAlgorithm::ChaCha20Poly1305 => decrypt_chacha20(ciphertext, key.as_bytes(), iv, aad),
    }
}

/// HKDF-SHA256 Key Derivation
pub fn hkdf_derive(ikm: &[u8], salt: &[u8], info: &[u8], len: usize) -> CryptoResult<Vec<u8>> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = vec![0u8; len];
    hk.expand(info, &mut okm)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(okm)
}

/// Prueft beim Start, ob AEAD und ECDH funktionieren.
///
/// Schlaegt fehl mit [`CryptoError::CryptoUnavailable`]; der Aufrufer schaltet
/// dann explizit in den unverschluesselten Modus.
pub fn self_test() -> CryptoResult<()> {
    use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

    let probe = b"fluester-selbsttest";
    for algorithm in [AeadAlgorithm::Aes256Gcm, AeadAlgorithm::ChaCha20Poly1305] {
        let key = SymmetricKey::generate();
        let sealed = seal(algorithm, &key, probe, b"")
            .map_err(|e| CryptoError::CryptoUnavailable(e.to_string()))?;
        let opened = open(algorithm, &key, &sealed.iv, &sealed.ciphertext, b"")
            .map_err(|e| CryptoError::CryptoUnavailable(e.to_string()))?;
        if opened != probe {
            return Err(CryptoError::CryptoUnavailable(format!(
                "{algorithm:?}: Roundtrip liefert falschen Klartext"
            )));
        }
    }

    let a = StaticSecret::random_from_rng(OsRng);
    let b = StaticSecret::random_from_rng(OsRng);
    let ab = a.diffie_hellman(&X25519PublicKey::from(&b));
    let ba = b.diffie_hellman(&X25519PublicKey::from(&a));
    if ab.as_bytes() != ba.as_bytes() || !ab.was_contributory() {
        return Err(CryptoError::CryptoUnavailable(
            "X25519 liefert keine uebereinstimmenden Geheimnisse".into(),
        ));
    }

    Ok(())
}

fn encrypt_aes256gcm(
    plaintext: &[u8],
    key_bytes: &[u8],
    nonce_bytes: &[u8; IV_LEN],
    aad: &[u8],
) -> CryptoResult<Vec<u8>> {
    if key_bytes.len() != KEY_LEN {
        return Err(CryptoError::UngueltigeSchluesselLaenge {
            erwartet: KEY_LEN,
            erhalten: key_bytes.len(),
        });
    }

    let key = Key::<Aes256Gcm>::from_slice(key_bytes);
    let cipher = Aes256Gcm::new(key);
    let nonce = AesNonce::from_slice(nonce_bytes);

    cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|e| CryptoError::Verschluesselung(e.to_string()))
}

fn encrypt_chacha20(
    plaintext: &[u8],
    key_bytes: &[u8],
    nonce_bytes: &[u8; IV_LEN],
    aad: &[u8],
) -> CryptoResult<Vec<u8>> {
    if key_bytes.len() != KEY_LEN {
        return Err(CryptoError::UngueltigeSchluesselLaenge {
            erwartet: KEY_LEN,
            erhalten: key_bytes.len(),
        });
    }

    let key = ChaChaKey::from_slice(key_bytes);
    let cipher = ChaCha20Poly1305::new(key);
    let nonce = ChaChaNonce::from_slice(nonce_bytes);

    cipher
        .encrypt(nonce, chacha20poly1305::aead::Payload { msg: plaintext, aad })
        .map_err(|e| CryptoError::Verschluesselung(e.to_string()))
}

fn decrypt_aes256gcm(
    ciphertext: &[u8],
    key_bytes: &[u8],
    nonce_bytes: &[u8; IV_LEN],
    aad: &[u8],
) -> CryptoResult<Vec<u8>> {
    let key = Key::<Aes256Gcm>::from_slice(key_bytes);
    let cipher = Aes256Gcm::new(key);
    let nonce = AesNonce::from_slice(nonce_bytes);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|e| CryptoError::Entschluesselung(e.to_string()))
}

fn decrypt_chacha20(
    ciphertext: &[u8],
    key_bytes: &[u8],
    nonce_bytes: &[u8; IV_LEN],
    aad: &[u8],
) -> CryptoResult<Vec<u8>> {
    let key = ChaChaKey::from_slice(key_bytes);
    let cipher = ChaCha20Poly1305::new(key);
    let nonce = ChaChaNonce::from_slice(nonce_bytes);

    cipher
        .decrypt(
            nonce,
            chacha20poly1305::aead::Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|e| CryptoError::Entschluesselung(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
