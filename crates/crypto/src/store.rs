//! Lokale Schluessel-Persistenz
//!
//! Das `KeyStore`-Trait abstrahiert den konkreten Speicher (Datei,
//! OS-Schluesselbund, verschluesselte Datenbank). Der Krypto-Kern kennt nur
//! Scopes und Bytes.

use std::path::PathBuf;

use async_trait::async_trait;
use dashmap::DashMap;
use fluester_core::{ConversationId, UserId};

use crate::error::CryptoResult;

/// Adresse eines gespeicherten Eintrags
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyScope {
    /// KeyRing eines lokalen Benutzerkontos
    KeyRing(UserId),
    /// Exportierter Gruppen-Schluessel einer Epoch
    GroupKey {
        user_id: UserId,
        conversation_id: ConversationId,
        version: u32,
    },
}

impl KeyScope {
    /// Relativer Pfad des Eintrags, z.B. `group/<user>/<conversation>/3`
    pub fn pfad(&self) -> String {
        match self {
            Self::KeyRing(user_id) => format!("keyring/{}", user_id.inner()),
            Self::GroupKey {
                user_id,
                conversation_id,
                version,
            } => format!(
                "{}{version}",
                Self::gruppen_praefix(*user_id, *conversation_id)
            ),
        }
    }

    /// Praefix aller Epoch-Schluessel einer Unterhaltung
    pub fn gruppen_praefix(user_id: UserId, conversation_id: ConversationId) -> String {
        format!("group/{}/{}/", user_id.inner(), conversation_id.inner())
    }

    /// Liest die Version aus einem Gruppen-Schluessel-Pfad
    pub fn version_aus_pfad(pfad: &str) -> Option<u32> {
        pfad.rsplit('/').next()?.parse().ok()
    }
}

/// Abstrakter lokaler Schluessel-Speicher
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Eintrag laden (`None` wenn nicht vorhanden)
    async fn load(&self, scope: &KeyScope) -> CryptoResult<Option<Vec<u8>>>;

    /// Eintrag speichern (ueberschreibt)
    async fn save(&self, scope: &KeyScope, bytes: &[u8]) -> CryptoResult<()>;

    /// Alle Pfade unterhalb eines Praefix
    async fn list(&self, praefix: &str) -> CryptoResult<Vec<String>>;
}

/// Fluechtiger Speicher (Tests, Sitzungen ohne Persistenz)
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    eintraege: DashMap<String, Vec<u8>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.eintraege.len()
    }

    pub fn is_empty(&self) -> bool {
        self.eintraege.is_empty()
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn load(&self, scope: &KeyScope) -> CryptoResult<Option<Vec<u8>>> {
        Ok(self.eintraege.get(&scope.pfad()).map(|e| e.value().clone()))
    }

    async fn save(&self, scope: &KeyScope, bytes: &[u8]) -> CryptoResult<()> {
        self.eintraege.insert(scope.pfad(), bytes.to_vec());
        Ok(())
    }

    async fn list(&self, praefix: &str) -> CryptoResult<Vec<String>> {
        let mut pfade: Vec<String> = self
            .eintraege
            .iter()
            .filter(|e| e.key().starts_with(praefix))
            .map(|e| e.key().clone())
            .collect();
        pfade.sort();
        Ok(pfade)
    }
}

/// Datei-basierter Speicher
///
/// Speichert jeden Scope unter `base_dir/<pfad>`.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    base_dir: PathBuf,
}

impl FileKeyStore {
    /// Neuer FileKeyStore mit dem angegebenen Basisverzeichnis
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn full_path(&self, pfad: &str) -> PathBuf {
        self.base_dir.join(pfad)
    }
}

#[async_trait]
impl KeyStore for FileKeyStore {
    async fn load(&self, scope: &KeyScope) -> CryptoResult<Option<Vec<u8>>> {
        let full = self.full_path(&scope.pfad());
        match tokio::fs::read(&full).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, scope: &KeyScope, bytes: &[u8]) -> CryptoResult<()> {
        let full = self.full_path(&scope.pfad());

        // Elternverzeichnis anlegen falls noetig
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Erst temporaer schreiben, dann umbenennen: kein halber KeyRing nach Absturz
        let tmp = full.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &full).await?;
        tracing::debug!(pfad = %full.display(), bytes = bytes.len(), "Schluessel gespeichert");
        Ok(())
    }

    async fn list(&self, praefix: &str) -> CryptoResult<Vec<String>> {
        let (verzeichnis, namens_praefix) = match praefix.rfind('/') {
            Some(idx) => (&praefix[..=idx], &praefix[idx + 1..]),
            None => ("", praefix),
        };

        let mut eintraege = match tokio::fs::read_dir(self.full_path(verzeichnis)).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut pfade = Vec::new();
        while let Some(eintrag) = eintraege.next_entry().await? {
            let name = eintrag.file_name().to_string_lossy().into_owned();
            if name.starts_with(namens_praefix) && !name.ends_with(".tmp") {
                pfade.push(format!("{verzeichnis}{name}"));
            }
        }
        pfade.sort();
        Ok(pfade)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gruppen_scope(user_id: UserId, conversation_id: ConversationId, version: u32) -> KeyScope {
        KeyScope::GroupKey {
            user_id,
            conversation_id,
            version,
        }
    }

    #[test]
    fn version_aus_pfad_lesen() {
        let scope = gruppen_scope(UserId::new(), ConversationId::new(), 7);
        assert_eq!(KeyScope::version_aus_pfad(&scope.pfad()), Some(7));
        assert_eq!(KeyScope::version_aus_pfad("group/x/y/kaputt"), None);
    }

    #[tokio::test]
    async fn memory_store_speichern_und_laden() {
        let store = MemoryKeyStore::new();
        let scope = KeyScope::KeyRing(UserId::new());

        assert!(store.load(&scope).await.unwrap().is_none());
        store.save(&scope, b"ring").await.unwrap();
        assert_eq!(store.load(&scope).await.unwrap().unwrap(), b"ring");
    }

    #[tokio::test]
    async fn memory_store_list_nach_praefix() {
        let store = MemoryKeyStore::new();
        let user = UserId::new();
        let conv = ConversationId::new();
        let andere = ConversationId::new();

        store.save(&gruppen_scope(user, conv, 1), b"a").await.unwrap();
        store.save(&gruppen_scope(user, conv, 2), b"b").await.unwrap();
        store.save(&gruppen_scope(user, andere, 1), b"c").await.unwrap();

        let pfade = store
            .list(&KeyScope::gruppen_praefix(user, conv))
            .await
            .unwrap();
        assert_eq!(pfade.len(), 2);
    }

    #[tokio::test]
    async fn file_store_roundtrip_und_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path());
        let user = UserId::new();
        let conv = ConversationId::new();

        store.save(&gruppen_scope(user, conv, 1), b"eins").await.unwrap();
        store.save(&gruppen_scope(user, conv, 3), b"drei").await.unwrap();

        let geladen = store.load(&gruppen_scope(user, conv, 3)).await.unwrap();
        assert_eq!(geladen.unwrap(), b"drei");

        let versionen: Vec<u32> = store
            .list(&KeyScope::gruppen_praefix(user, conv))
            .await
            .unwrap()
            .iter()
            .filter_map(|p| KeyScope::version_aus_pfad(p))
            .collect();
        assert_eq!(versionen, vec![1, 3]);
    }

    #[tokio::test]
    async fn file_store_fehlender_eintrag_ist_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileKeyStore::new(dir.path());
        let scope = KeyScope::KeyRing(UserId::new());
        assert!(store.load(&scope).await.unwrap().is_none());
        assert!(store.list("group/nichts/").await.unwrap().is_empty());
    }
}
