//! Session manager: the authoritative in-memory set of sessions, the active
//! pointer, and change notification. The single source of truth; no other
//! component mutates a `Session` in place.

use std::sync::Arc;

use async_lock::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cipher::Algorithm;
use crate::error::StorageError;
use crate::keys::Keypair;
use crate::storage::Storage;

/// Permissions every session carries regardless of what a pairing token
/// requested, in the order a UI should display them.
pub const DEFAULT_PERMISSIONS: [&str; 6] = [
    "sign_event",
    "nip44_encrypt",
    "nip44_decrypt",
    "nip04_encrypt",
    "nip04_decrypt",
    "get_public_key",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionType {
    ClientInitiated,
    SignerInitiated,
}

impl SessionType {
    fn tag(self) -> &'static str {
        match self {
            SessionType::ClientInitiated => "client-initiated",
            SessionType::SignerInitiated => "signer-initiated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pairing,
    Active,
    Revoked,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(rename = "type")]
    pub session_type: SessionType,
    #[serde(default)]
    pub remote_signer_pubkey: String,
    #[serde(default)]
    pub user_pubkey: String,
    pub client_public_key: String,
    pub client_private_key: String,
    #[serde(default)]
    pub relays: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    pub status: SessionStatus,
    #[serde(default = "Algorithm::default")]
    pub algorithm: Algorithm,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairing_secret: Option<String>,
    #[serde(default)]
    pub metadata: SessionMetadata,
    #[serde(default)]
    pub last_seen_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub pending_relays: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_challenge_url: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("type", &self.session_type)
            .field("remote_signer_pubkey", &self.remote_signer_pubkey)
            .field("user_pubkey", &self.user_pubkey)
            .field("client_public_key", &self.client_public_key)
            .field("client_private_key", &"<redacted>")
            .field("relays", &self.relays)
            .field("permissions", &self.permissions)
            .field("status", &self.status)
            .field("algorithm", &self.algorithm)
            .field(
                "pairing_secret",
                &self.pairing_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("metadata", &self.metadata)
            .field("last_seen_at", &self.last_seen_at)
            .field("last_error", &self.last_error)
            .field("pending_relays", &self.pending_relays)
            .field("auth_challenge_url", &self.auth_challenge_url)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

use crate::time::now_millis;

fn build_permissions(extra: &[String]) -> Vec<String> {
    let mut seen: Vec<String> = DEFAULT_PERMISSIONS.iter().map(|s| s.to_string()).collect();
    for perm in extra {
        if !seen.contains(perm) {
            seen.push(perm.clone());
        }
    }
    seen
}

impl Session {
    /// Build a client-initiated (invitation) session: a fresh keypair, no
    /// remote signer known yet.
    pub fn new_client_initiated(
        keypair: Keypair,
        relays: Vec<String>,
        extra_permissions: Vec<String>,
        secret: Option<String>,
    ) -> Self {
        let created = now_millis();
        let client_public_key = keypair.public_key.to_hex();
        let id = format!(
            "{}:{}:{}",
            SessionType::ClientInitiated.tag(),
            client_public_key,
            created
        );

        Session {
            id,
            session_type: SessionType::ClientInitiated,
            remote_signer_pubkey: String::new(),
            user_pubkey: String::new(),
            client_public_key,
            client_private_key: keypair.secret_key.to_hex(),
            relays,
            permissions: build_permissions(&extra_permissions),
            status: SessionStatus::Pairing,
            algorithm: Algorithm::Algo44,
            pairing_secret: secret,
            metadata: SessionMetadata::default(),
            last_seen_at: created,
            last_error: None,
            pending_relays: Vec::new(),
            auth_challenge_url: None,
            created_at: created,
            updated_at: created,
        }
    }

    /// Build a signer-initiated (pairing from a `bunker://` URI) session.
    pub fn new_signer_initiated(
        keypair: Keypair,
        remote_signer_pubkey: String,
        relays: Vec<String>,
        extra_permissions: Vec<String>,
        secret: Option<String>,
        metadata: SessionMetadata,
    ) -> Self {
        let created = now_millis();
        let id = format!(
            "{}:{}:{}",
            SessionType::SignerInitiated.tag(),
            remote_signer_pubkey,
            created
        );

        Session {
            id,
            session_type: SessionType::SignerInitiated,
            remote_signer_pubkey: remote_signer_pubkey.clone(),
            user_pubkey: remote_signer_pubkey,
            client_public_key: keypair.public_key.to_hex(),
            client_private_key: keypair.secret_key.to_hex(),
            relays,
            permissions: build_permissions(&extra_permissions),
            status: SessionStatus::Pairing,
            algorithm: Algorithm::Algo44,
            pairing_secret: secret,
            metadata,
            last_seen_at: created,
            last_error: None,
            pending_relays: Vec::new(),
            auth_challenge_url: None,
            created_at: created,
            updated_at: created,
        }
    }

    fn touch(&mut self) {
        self.updated_at = now_millis();
    }
}

/// `{ sessions, activeSessionId }` — the single persisted document.
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub sessions: Vec<Session>,
    pub active_session_id: Option<String>,
}

struct ManagerState {
    sessions: Vec<Session>,
    index: FxHashMap<String, usize>,
    active_session_id: Option<String>,
    hydrated: bool,
}

impl ManagerState {
    fn reindex(&mut self) {
        self.index.clear();
        for (i, session) in self.sessions.iter().enumerate() {
            self.index.insert(session.id.clone(), i);
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            sessions: self.sessions.clone(),
            active_session_id: self.active_session_id.clone(),
        }
    }
}

type Listener = Box<dyn Fn(&SessionSnapshot) + Send + Sync>;

/// Authoritative session store. All cross-component state changes go
/// through these methods so listeners always see a consistent snapshot.
pub struct SessionManager {
    state: Mutex<ManagerState>,
    storage: Arc<dyn Storage>,
    listeners: Mutex<Vec<Listener>>,
}

impl SessionManager {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            state: Mutex::new(ManagerState {
                sessions: Vec::new(),
                index: FxHashMap::default(),
                active_session_id: None,
                hydrated: false,
            }),
            storage,
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Load from storage once. Calling this again after the first
    /// successful hydration is a no-op.
    pub async fn hydrate(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        if state.hydrated {
            return Ok(());
        }

        if let Some(mut snapshot) = self.storage.load().await? {
            let mut migrated = false;
            for session in &mut snapshot.sessions {
                if session.id.starts_with("signer-initiated:") && session.user_pubkey.is_empty() {
                    session.user_pubkey = session.remote_signer_pubkey.clone();
                    migrated = true;
                }
            }

            state.sessions = snapshot.sessions;
            state.active_session_id = snapshot.active_session_id;
            state.reindex();
            state.hydrated = true;

            if migrated {
                debug!("migrated legacy session records during hydration");
                let to_persist = state.snapshot();
                drop(state);
                self.storage.save(&to_persist).await?;
                self.emit(&to_persist).await;
                return Ok(());
            }
        } else {
            state.hydrated = true;
        }

        Ok(())
    }

    pub async fn get_sessions(&self) -> Vec<Session> {
        self.state.lock().await.sessions.clone()
    }

    pub async fn get_session(&self, id: &str) -> Option<Session> {
        let state = self.state.lock().await;
        state.index.get(id).map(|&i| state.sessions[i].clone())
    }

    pub async fn get_session_by_client_pubkey(&self, pubkey: &str) -> Option<Session> {
        let state = self.state.lock().await;
        state
            .sessions
            .iter()
            .find(|s| s.client_public_key == pubkey)
            .cloned()
    }

    pub async fn get_active_session(&self) -> Option<Session> {
        let state = self.state.lock().await;
        let id = state.active_session_id.as_ref()?;
        state.index.get(id).map(|&i| state.sessions[i].clone())
    }

    /// Insert a new session or replace an existing one by id, preserving
    /// `created_at` across replacement. Becomes active if there is no
    /// active session yet.
    pub async fn upsert(&self, mut session: Session) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        session.touch();

        if let Some(&i) = state.index.get(&session.id) {
            session.created_at = state.sessions[i].created_at;
            state.sessions[i] = session;
        } else {
            let became_active = state.active_session_id.is_none();
            state.sessions.push(session.clone());
            state.reindex();
            if became_active {
                state.active_session_id = Some(session.id.clone());
            }
        }

        self.persist_and_emit(state).await
    }

    /// Patch an existing session in place.
    pub async fn update(
        &self,
        id: &str,
        patch: impl FnOnce(&mut Session),
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        let Some(&i) = state.index.get(id) else {
            warn!("update called for unknown session {id}");
            return Ok(());
        };
        patch(&mut state.sessions[i]);
        state.sessions[i].touch();

        self.persist_and_emit(state).await
    }

    /// Remove a session. If it was active, promote the first remaining
    /// session or clear the pointer if none remain.
    pub async fn remove(&self, id: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        let Some(&i) = state.index.get(id) else {
            return Ok(());
        };
        state.sessions.remove(i);
        state.reindex();

        if state.active_session_id.as_deref() == Some(id) {
            state.active_session_id = state.sessions.first().map(|s| s.id.clone());
        }

        self.persist_and_emit(state).await
    }

    pub async fn set_active(&self, id: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        if !state.index.contains_key(id) {
            warn!("set_active called for unknown session {id}");
            return Ok(());
        }
        state.active_session_id = Some(id.to_string());
        self.persist_and_emit(state).await
    }

    /// Subscribe to change. The listener is invoked immediately with the
    /// current snapshot, then again after every successful persist.
    pub async fn on_change(&self, listener: Listener) {
        let snapshot = self.state.lock().await.snapshot();
        listener(&snapshot);
        self.listeners.lock().await.push(listener);
    }

    async fn persist_and_emit(
        &self,
        state: async_lock::MutexGuard<'_, ManagerState>,
    ) -> Result<(), StorageError> {
        let snapshot = state.snapshot();
        drop(state);
        let result = self.storage.save(&snapshot).await;
        self.emit(&snapshot).await;
        info!("session snapshot persisted ({} sessions)", snapshot.sessions.len());
        result
    }

    /// Invoke every listener with `snapshot`, in registration order. Waits
    /// for the listener list's lock rather than skipping on contention, so a
    /// mutation racing a concurrent `on_change` registration never drops a
    /// snapshot delivery.
    async fn emit(&self, snapshot: &SessionSnapshot) {
        let listeners = self.listeners.lock().await;
        for listener in listeners.iter() {
            listener(snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;

    fn manager() -> SessionManager {
        SessionManager::new(Arc::new(InMemoryStorage::new()))
    }

    #[tokio::test]
    async fn first_upsert_becomes_active() {
        let mgr = manager();
        let session = Session::new_client_initiated(crate::keys::generate(), vec![], vec![], None);
        let id = session.id.clone();
        mgr.upsert(session).await.unwrap();

        assert_eq!(mgr.get_active_session().await.unwrap().id, id);
    }

    #[tokio::test]
    async fn default_permissions_always_present() {
        let session = Session::new_client_initiated(
            crate::keys::generate(),
            vec![],
            vec!["custom_perm".into()],
            None,
        );
        for perm in DEFAULT_PERMISSIONS {
            assert!(session.permissions.contains(&perm.to_string()));
        }
        assert!(session.permissions.contains(&"custom_perm".to_string()));
    }

    #[tokio::test]
    async fn removing_active_session_promotes_next() {
        let mgr = manager();
        let a = Session::new_client_initiated(crate::keys::generate(), vec![], vec![], None);
        let b = Session::new_client_initiated(crate::keys::generate(), vec![], vec![], None);
        let (a_id, b_id) = (a.id.clone(), b.id.clone());

        mgr.upsert(a).await.unwrap();
        mgr.upsert(b).await.unwrap();
        mgr.set_active(&a_id).await.unwrap();
        mgr.remove(&a_id).await.unwrap();

        assert_eq!(mgr.get_active_session().await.unwrap().id, b_id);
    }

    #[tokio::test]
    async fn removing_last_session_clears_active_pointer() {
        let mgr = manager();
        let a = Session::new_client_initiated(crate::keys::generate(), vec![], vec![], None);
        let a_id = a.id.clone();
        mgr.upsert(a).await.unwrap();
        mgr.remove(&a_id).await.unwrap();

        assert!(mgr.get_active_session().await.is_none());
    }

    #[tokio::test]
    async fn created_at_preserved_across_upsert_of_existing_id() {
        let mgr = manager();
        let mut session =
            Session::new_client_initiated(crate::keys::generate(), vec![], vec![], None);
        let id = session.id.clone();
        let original_created = session.created_at;
        mgr.upsert(session.clone()).await.unwrap();

        session.created_at = 0;
        session.status = SessionStatus::Active;
        mgr.upsert(session).await.unwrap();

        let reloaded = mgr.get_session(&id).await.unwrap();
        assert_eq!(reloaded.created_at, original_created);
        assert_eq!(reloaded.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn listener_receives_snapshot_on_subscribe_and_mutation() {
        let mgr = manager();
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count_clone = count.clone();
        mgr.on_change(Box::new(move |_snapshot| {
            count_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }))
        .await;
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);

        let session = Session::new_client_initiated(crate::keys::generate(), vec![], vec![], None);
        mgr.upsert(session).await.unwrap();
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
