//! Gruppen-Schluessel pro Epoch
//!
//! Jede Gruppe hat pro Epoch genau einen symmetrischen Schluessel. Er wird
//! bei der Erstellung (Version 1) und bei jedem Entfernen eines Mitglieds
//! (Version N+1) neu erzeugt und fuer jedes Mitglied einzeln eingewickelt.
//!
//! ## Wrap
//! 1. X25519 zwischen Verteiler und Empfaenger (statische Identitaeten)
//! 2. HKDF -> Wrapping Key (`fluester-key-wrap-v1`)
//! 3. AES-256-GCM, AAD = Label || Version
//!
//! Der Empfaenger braucht dafuer den oeffentlichen Schluessel des Verteilers
//! (`senderPublicKey` im Blob, sonst Verzeichnis).

use fluester_core::UserId;

use crate::aead::{self, SymmetricKey};
use crate::dm::derive_pair_key;
use crate::error::CryptoResult;
use crate::identity::KeyPair;
use crate::types::{AeadAlgorithm, PublicKey, WrappedKeyBlob};

const WRAP_INFO: &[u8] = b"fluester-key-wrap-v1";

/// Symmetrischer Schluessel einer Epoch
#[derive(Debug, Clone)]
pub struct GroupKeyRecord {
    pub key: SymmetricKey,
    pub version: u32,
    /// Exportierte Form fuer lokale Persistenz
    pub key_string: String,
}

impl GroupKeyRecord {
    fn aus_schluessel(key: SymmetricKey, version: u32) -> Self {
        let key_string = key.export();
        Self {
            key,
            version,
            key_string,
        }
    }
}

/// Erstellt einen neuen Gruppen-Schluessel fuer eine Epoch
pub fn create_group_key(version: u32) -> GroupKeyRecord {
    GroupKeyRecord::aus_schluessel(SymmetricKey::generate(), version)
}

/// Neue Epoch: frischer Schluessel, Version + 1
pub fn rotate_group_key(current: &GroupKeyRecord) -> GroupKeyRecord {
    create_group_key(current.version + 1)
}

/// Stellt einen lokal gespeicherten Schluessel wieder her
pub fn import_group_key(key_string: &str, version: u32) -> CryptoResult<GroupKeyRecord> {
    Ok(GroupKeyRecord::aus_schluessel(
        SymmetricKey::import(key_string)?,
        version,
    ))
}

fn wrap_aad(version: u32) -> Vec<u8> {
    let mut aad = WRAP_INFO.to_vec();
    aad.extend_from_slice(&version.to_be_bytes());
    aad
}

/// Wickelt einen Epoch-Schluessel fuer genau einen Empfaenger ein
pub fn wrap_key_for_recipient(
    distributor: &KeyPair,
    from: UserId,
    recipient_public_key: &PublicKey,
    record: &GroupKeyRecord,
) -> CryptoResult<WrappedKeyBlob> {
    let wrapping_key = derive_pair_key(distributor, recipient_public_key, WRAP_INFO)?;
    let sealed = aead::seal(
        AeadAlgorithm::Aes256Gcm,
        &wrapping_key,
        record.key.as_bytes(),
        &wrap_aad(record.version),
    )?;

    Ok(WrappedKeyBlob {
        ciphertext: sealed.ciphertext,
        iv: sealed.iv.to_vec(),
        sender_public_key: distributor.public_key,
        from,
    })
}

/// Packt einen eingewickelten Schluessel mit dem eigenen Paar aus.
///
/// `sender_public_key` ist der Schluessel des Verteilers, normalerweise
/// `blob.sender_public_key`.
pub fn unwrap_key_for_recipient(
    me: &KeyPair,
    blob: &WrappedKeyBlob,
    sender_public_key: &PublicKey,
    version: u32,
) -> CryptoResult<GroupKeyRecord> {
    let wrapping_key = derive_pair_key(me, sender_public_key, WRAP_INFO)?;
    let plaintext = aead::open(
        AeadAlgorithm::Aes256Gcm,
        &wrapping_key,
        &blob.iv,
        &blob.ciphertext,
        &wrap_aad(version),
    )?;
    Ok(GroupKeyRecord::aus_schluessel(
        SymmetricKey::from_bytes(plaintext)?,
        version,
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CryptoError;

    #[test]
    fn group_key_erstellen() {
        let key = create_group_key(1);
        assert_eq!(key.version, 1);
        assert_eq!(key.key.as_bytes().len(), 32);
        assert_eq!(key.key_string, key.key.export());
    }

    #[test]
    fn group_key_rotation_erhoeht_version() {
        let key1 = create_group_key(1);
        let key2 = rotate_group_key(&key1);

        assert_eq!(key2.version, 2);
        // Neuer Schluessel muss verschieden sein
        assert_ne!(key1.key.as_bytes(), key2.key.as_bytes());
    }

    #[test]
    fn group_key_wrap_und_unwrap_roundtrip() {
        let verteiler = KeyPair::generate();
        let empfaenger = KeyPair::generate();
        let original = create_group_key(3);

        let blob =
            wrap_key_for_recipient(&verteiler, UserId::new(), &empfaenger.public_key, &original)
                .unwrap();
        assert_eq!(blob.sender_public_key, verteiler.public_key);

        let entpackt =
            unwrap_key_for_recipient(&empfaenger, &blob, &blob.sender_public_key, 3).unwrap();
        assert_eq!(entpackt.key.as_bytes(), original.key.as_bytes());
    }

    #[test]
    fn falscher_empfaenger_kann_nicht_entpacken() {
        let verteiler = KeyPair::generate();
        let empfaenger = KeyPair::generate();
        let fremd = KeyPair::generate();
        let blob = wrap_key_for_recipient(
            &verteiler,
            UserId::new(),
            &empfaenger.public_key,
            &create_group_key(1),
        )
        .unwrap();

        let result = unwrap_key_for_recipient(&fremd, &blob, &blob.sender_public_key, 1);
        assert!(matches!(result, Err(CryptoError::Entschluesselung(_))));
    }

    #[test]
    fn wrap_ist_an_version_gebunden() {
        let verteiler = KeyPair::generate();
        let empfaenger = KeyPair::generate();
        let blob = wrap_key_for_recipient(
            &verteiler,
            UserId::new(),
            &empfaenger.public_key,
            &create_group_key(1),
        )
        .unwrap();

        assert!(unwrap_key_for_recipient(&empfaenger, &blob, &blob.sender_public_key, 2).is_err());
    }

    #[test]
    fn import_roundtrip() {
        let key = create_group_key(4);
        let restored = import_group_key(&key.key_string, 4).unwrap();
        assert_eq!(restored.key.as_bytes(), key.key.as_bytes());
    }
}
