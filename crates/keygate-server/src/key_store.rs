use std::collections::HashSet;
use std::path::PathBuf;

use keygate_config::Config;
use keygate_kernel::{generate_key, key_fingerprint};
use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyStoreError {
    #[error("key already redeemed")]
    AlreadyRedeemed,
    #[error("key was never issued")]
    UnknownKey,
    #[error("persist config failed: {0}")]
    Persistence(String),
}

/// Owns the issued and redeemed key sets and the document they are saved in.
///
/// Every read-check-write-save sequence runs under `state`. Callers must not
/// perform network I/O while holding it, which is why redemption is split into
/// [`KeyStore::reserve`], [`KeyStore::commit`] and [`KeyStore::release`].
pub struct KeyStore {
    path: PathBuf,
    strict: bool,
    state: Mutex<KeyState>,
}

struct KeyState {
    doc: Config,
    rng: StdRng,
    /// Keys with a role grant in flight; never persisted.
    reserved: HashSet<String>,
}

impl KeyStore {
    pub fn new(path: impl Into<PathBuf>, doc: Config) -> Self {
        Self::with_rng(path, doc, StdRng::from_entropy())
    }

    pub fn with_rng(path: impl Into<PathBuf>, doc: Config, rng: StdRng) -> Self {
        Self {
            path: path.into(),
            strict: doc.strict_redemption,
            state: Mutex::new(KeyState {
                doc,
                rng,
                reserved: HashSet::new(),
            }),
        }
    }

    /// Issues a fresh key and saves it before returning.
    ///
    /// On a save failure the key stays in the in-memory collection but the
    /// caller must treat it as lost.
    pub async fn generate(&self) -> Result<String, KeyStoreError> {
        let mut state = self.state.lock().await;
        let key = generate_key(&mut state.rng);
        state.doc.keys.push(key.clone());
        self.persist(&state.doc).await?;
        info!(key = %key_fingerprint(&key), issued = state.doc.keys.len(), "key issued");
        Ok(key)
    }

    /// Marks `key` redeemed with no side effect in between.
    pub async fn redeem(&self, key: &str) -> Result<(), KeyStoreError> {
        self.reserve(key).await?;
        self.commit(key).await
    }

    /// Claims `key` for an in-flight redemption. Concurrent claims on the same
    /// key observe [`KeyStoreError::AlreadyRedeemed`].
    pub async fn reserve(&self, key: &str) -> Result<(), KeyStoreError> {
        let mut state = self.state.lock().await;
        if state.doc.used_keys.contains_key(key) || state.reserved.contains(key) {
            debug!(key = %key_fingerprint(key), "redeem rejected: already redeemed");
            return Err(KeyStoreError::AlreadyRedeemed);
        }
        if self.strict && !state.doc.keys.iter().any(|k| k == key) {
            debug!(key = %key_fingerprint(key), "redeem rejected: never issued");
            return Err(KeyStoreError::UnknownKey);
        }
        state.reserved.insert(key.to_string());
        Ok(())
    }

    /// Finalizes a reservation. The in-memory mark is kept even when the save
    /// fails, so this process will not accept the key again; the file may.
    pub async fn commit(&self, key: &str) -> Result<(), KeyStoreError> {
        let mut state = self.state.lock().await;
        state.reserved.remove(key);
        state.doc.used_keys.insert(key.to_string(), true);
        self.persist(&state.doc).await?;
        info!(key = %key_fingerprint(key), "key redeemed");
        Ok(())
    }

    pub async fn release(&self, key: &str) {
        let mut state = self.state.lock().await;
        if state.reserved.remove(key) {
            debug!(key = %key_fingerprint(key), "reservation released");
        }
    }

    pub async fn issued_keys(&self) -> Vec<String> {
        self.state.lock().await.doc.keys.clone()
    }

    pub async fn is_redeemed(&self, key: &str) -> bool {
        self.state.lock().await.doc.used_keys.contains_key(key)
    }

    /// Runs the blocking save off the async workers. Callers keep holding
    /// `state` until it finishes, so saves never interleave.
    async fn persist(&self, doc: &Config) -> Result<(), KeyStoreError> {
        let path = self.path.clone();
        let doc = doc.clone();
        let result = tokio::task::spawn_blocking(move || keygate_config::save(&path, &doc))
            .await
            .map_err(|e| e.to_string())
            .and_then(|saved| saved.map_err(|e| e.to_string()));
        result.map_err(|e| {
            warn!(path = %self.path.display(), error = %e, "config save failed");
            KeyStoreError::Persistence(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_path(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        std::env::temp_dir().join(format!("keygate-keystore-{tag}-{nanos}.json"))
    }

    fn doc(strict: bool) -> Config {
        let text = format!(
            r#"{{
  "botToken": "t",
  "allowedRoleId": "a",
  "keyRoleId": "k",
  "roleToAssign": "r",
  "keys": ["issued-1"],
  "api": {{ "home": {{ "url": "http://x/{{TARGET}}" }} }},
  "strictRedemption": {strict}
}}"#
        );
        keygate_config::parse_and_validate(&text).expect("test config")
    }

    #[tokio::test]
    async fn second_redeem_is_rejected() {
        let store = KeyStore::new(temp_path("twice"), doc(false));
        assert_eq!(store.redeem("issued-1").await, Ok(()));
        assert_eq!(
            store.redeem("issued-1").await,
            Err(KeyStoreError::AlreadyRedeemed)
        );
    }

    #[tokio::test]
    async fn lenient_mode_accepts_never_issued_keys() {
        let store = KeyStore::new(temp_path("lenient"), doc(false));
        assert_eq!(store.redeem("made-up").await, Ok(()));
        assert!(store.is_redeemed("made-up").await);
    }

    #[tokio::test]
    async fn strict_mode_rejects_never_issued_keys() {
        let store = KeyStore::new(temp_path("strict"), doc(true));
        assert_eq!(store.redeem("made-up").await, Err(KeyStoreError::UnknownKey));
        assert_eq!(store.redeem("issued-1").await, Ok(()));
    }

    #[tokio::test]
    async fn reservation_blocks_concurrent_claims_until_released() {
        let store = KeyStore::new(temp_path("reserve"), doc(false));
        store.reserve("issued-1").await.unwrap();
        assert_eq!(
            store.reserve("issued-1").await,
            Err(KeyStoreError::AlreadyRedeemed)
        );
        store.release("issued-1").await;
        assert!(!store.is_redeemed("issued-1").await);
        assert_eq!(store.reserve("issued-1").await, Ok(()));
    }

    #[tokio::test]
    async fn concurrent_redeems_have_one_winner() {
        let store = Arc::new(KeyStore::new(temp_path("race"), doc(false)));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.redeem("issued-1").await }));
        }
        let mut ok = 0;
        let mut rejected = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(()) => ok += 1,
                Err(KeyStoreError::AlreadyRedeemed) => rejected += 1,
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(rejected, 7);
    }

    #[tokio::test]
    async fn generated_keys_survive_reload() {
        let path = temp_path("reload");
        let store = KeyStore::with_rng(&path, doc(false), StdRng::seed_from_u64(1));
        let mut generated = Vec::new();
        for _ in 0..5 {
            generated.push(store.generate().await.unwrap());
        }
        store.redeem(&generated[0]).await.unwrap();

        let reloaded = keygate_config::load_and_validate(&path).unwrap();
        let mut expected = vec!["issued-1".to_string()];
        expected.extend(generated.iter().cloned());
        assert_eq!(reloaded.keys, expected);
        assert_eq!(reloaded.used_keys.get(&generated[0]), Some(&true));

        let again = KeyStore::new(&path, reloaded);
        assert_eq!(
            again.redeem(&generated[0]).await,
            Err(KeyStoreError::AlreadyRedeemed)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_generates_are_all_saved() {
        let path = temp_path("parallel-gen");
        let store = Arc::new(KeyStore::new(&path, doc(false)));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.generate().await }));
        }
        let mut generated = HashSet::new();
        for h in handles {
            generated.insert(h.await.unwrap().unwrap());
        }
        assert_eq!(generated.len(), 16);

        let reloaded = keygate_config::load_and_validate(&path).unwrap();
        assert_eq!(reloaded.keys.len(), 17);
        assert!(generated.iter().all(|k| reloaded.keys.contains(k)));
    }

    #[tokio::test]
    async fn generate_save_failure_keeps_key_in_memory() {
        let path = temp_path("no-dir").join("config.json");
        let store = KeyStore::new(&path, doc(false));
        let err = store.generate().await.expect_err("save should fail");
        assert!(matches!(err, KeyStoreError::Persistence(_)));
        assert_eq!(store.issued_keys().await.len(), 2);
    }

    #[tokio::test]
    async fn commit_save_failure_still_marks_in_memory() {
        let path = temp_path("no-dir-commit").join("config.json");
        let store = KeyStore::new(&path, doc(false));
        store.reserve("issued-1").await.unwrap();
        let err = store.commit("issued-1").await.expect_err("save should fail");
        assert!(matches!(err, KeyStoreError::Persistence(_)));
        assert!(store.is_redeemed("issued-1").await);
    }
}
