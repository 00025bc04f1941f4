//! # fluester-crypto
//!
//! Ende-zu-Ende Schluesselverwaltung fuer Fluester.
//!
//! ## Module
//! - `aead` - AES-256-GCM / ChaCha20-Poly1305, HKDF, Selbsttest
//! - `identity` - X25519 Identitaeten und KeyRing
//! - `directory` - Verzeichnis oeffentlicher Schluessel (mit Cache)
//! - `dm` - Paarweise DM-Schluessel und Entschluesselungs-Kette
//! - `group_key` - Gruppen-Schluessel und Key-Wrapping
//! - `key_manager` - Gruppen-Epochen, Mitglieder-Aenderungen, Rotation
//! - `repair` - Reparatur fehlender Epochen und Wraps
//! - `retry` - Begrenzte Entschluesselungs-Versuche
//! - `envelope` - Wire-Format verschluesselter Nachrichten
//! - `attachment` - Datei-Schluessel fuer Anhaenge
//! - `client` - Fassade fuer einen angemeldeten Benutzer
//! - `server` - Schnittstelle zum Schluessel-Server (plus In-Memory-Variante)
//! - `store` - Lokaler Schluessel-Speicher
//! - `types` - Gemeinsame Typen
//! - `error` - Fehlertypen

pub mod aead;
pub mod attachment;
pub mod cache;
pub mod client;
pub mod config;
pub mod directory;
pub mod dm;
pub mod envelope;
pub mod error;
pub mod group_key;
pub mod identity;
pub mod key_manager;
pub mod repair;
pub mod retry;
pub mod server;
pub mod store;
pub mod types;

// Bequeme Re-Exports
pub use aead::{hkdf_derive, SymmetricKey};
pub use attachment::{decrypt_file, encrypt_file, new_file_key, AnhangReferenz, DateiSchluessel};
pub use client::{
    Anzeige, AusgehendeNachricht, E2eeClient, EingehendeNachricht, VerschluesselungsModus, Ziel,
};
pub use config::{E2eeConfig, HistorienFreigabe};
pub use directory::PublicKeyDirectory;
pub use dm::{derive_dm_key, DmCrypto, DmKeyDeriver, DmStrategie};
pub use envelope::{Envelope, Nachrichteninhalt, StrukturierteNutzlast};
pub use error::{CryptoError, CryptoResult};
pub use group_key::{
    create_group_key, import_group_key, rotate_group_key, unwrap_key_for_recipient,
    wrap_key_for_recipient, GroupKeyRecord,
};
pub use identity::{IdentityStore, KeyPair, KeyRing, SharedKeyRing};
pub use key_manager::GroupEpochManager;
pub use repair::{KeyHistoryRepairAgent, ReparaturBericht};
pub use retry::{RetryWarteschlange, VersuchStatus};
pub use server::{InMemoryKeyServer, KeyServer};
pub use store::{FileKeyStore, KeyScope, KeyStore, MemoryKeyStore};
pub use types::{
    AeadAlgorithm, ConversationRecord, Kid, PublicKey, WrappedKeyBlob,
};
