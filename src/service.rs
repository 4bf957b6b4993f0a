//! Service facade: the consumer-facing surface a host application drives.
//! Wires the session manager, request queue, URI parser, and key utilities
//! together into `pair_with_uri` / `create_invitation` / `send_request` /
//! `connect_session` / `fetch_user_public_key` plus `init`/`destroy`.

use std::sync::Arc;

use async_lock::Mutex;
use getrandom::getrandom;
use tracing::info;

use crate::cipher::Algorithm;
use crate::config::QueueConfig;
use crate::error::Nip46Error;
use crate::keys;
use crate::payload::{Method, RequestPayload, ResponsePayload};
use crate::queue::Queue;
use crate::relay::Transport;
use crate::session::{Session, SessionManager, SessionMetadata};
use crate::storage::Storage;
use crate::uri::{self, PairingToken};

/// Tuning knobs for `pair_with_uri`. Relays, secret and permissions come
/// from the parsed token; this only covers what a caller can't express in
/// the URI itself.
#[derive(Debug, Clone)]
pub struct PairOptions {
    pub algorithm: Algorithm,
}

impl Default for PairOptions {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Algo44,
        }
    }
}

/// Inputs for `create_invitation`. A secret is generated if none is given.
#[derive(Debug, Clone, Default)]
pub struct CreateInvitationOptions {
    pub relays: Vec<String>,
    pub permissions: Vec<String>,
    pub metadata: SessionMetadata,
    pub secret: Option<String>,
    pub algorithm: Option<Algorithm>,
}

/// The host-facing entry point. Holds the authoritative session manager and
/// the request queue, and lazily wires the two together on first use.
pub struct Nip46Client {
    sessions: Arc<SessionManager>,
    queue: Arc<Queue>,
    initialized: Mutex<bool>,
}

impl Nip46Client {
    pub fn new(storage: Arc<dyn Storage>, transport: Arc<dyn Transport>, config: QueueConfig) -> Arc<Self> {
        let sessions = Arc::new(SessionManager::new(storage));
        let queue = Queue::new(transport, sessions.clone(), config);
        Arc::new(Self {
            sessions,
            queue,
            initialized: Mutex::new(false),
        })
    }

    /// The authoritative session manager, for a host to subscribe to
    /// (`on_change`) and read (`get_sessions`, `get_active_session`, ...).
    pub fn session_manager(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Hydrate sessions from storage and wire a change listener that rebuilds
    /// the queue's subscription whenever the session set changes. Idempotent:
    /// the queue is only ever initialized once per client lifetime.
    pub async fn init(self: &Arc<Self>) -> Result<(), Nip46Error> {
        let mut initialized = self.initialized.lock().await;
        if *initialized {
            return Ok(());
        }

        self.sessions.hydrate().await?;

        let queue = self.queue.clone();
        self.sessions
            .on_change(Box::new(move |_snapshot| {
                let queue = queue.clone();
                crate::rt::spawn(async move {
                    queue.rebuild_subscription().await;
                });
            }))
            .await;

        *initialized = true;
        info!("nip46 client initialized");
        Ok(())
    }

    /// Unsubscribe, drop every in-flight request, and allow `init` to run
    /// again on a future call.
    pub async fn destroy(&self) {
        self.queue.destroy().await;
        *self.initialized.lock().await = false;
    }

    /// Parse `uri` (either scheme), create the corresponding session, and —
    /// only when the remote signer's pubkey is already known (the
    /// signer-initiated `bunker://` scheme) — issue the `connect` handshake.
    ///
    /// A `nostrconnect://` token handed to this method (rather than produced
    /// by `create_invitation`) is treated as resuming that invitation: a
    /// fresh local keypair is generated and the session waits for the
    /// signer to initiate, exactly as `create_invitation` would have left
    /// it. This crate has no way to recover a private key from a bare
    /// client-initiated URI, so there's no other sound interpretation.
    pub async fn pair_with_uri(
        self: &Arc<Self>,
        token_uri: &str,
        options: PairOptions,
    ) -> Result<Session, Nip46Error> {
        self.init().await?;
        let token = uri::parse(token_uri)?;

        match token {
            PairingToken::SignerInitiated(token) => {
                let keypair = keys::generate();
                let session = Session::new_signer_initiated(
                    keypair,
                    token.remote_signer_pubkey.to_hex(),
                    token.relays,
                    token.perms.clone(),
                    token.secret.clone(),
                    token.metadata,
                );
                let session = self.with_algorithm(session, options.algorithm);
                let session_id = session.id.clone();
                self.sessions.upsert(session).await?;

                let mut params = vec![token.remote_signer_pubkey.to_hex()];
                if let Some(secret) = &token.secret {
                    params.push(secret.clone());
                } else if !token.perms.is_empty() {
                    params.push(String::new());
                }
                if !token.perms.is_empty() {
                    params.push(token.perms.join(","));
                }

                let connect = RequestPayload::new(None, Method::Connect, params);
                let response = self.queue.enqueue(&session_id, connect).await?;
                self.after_connect(&session_id, &response).await?;

                Ok(self
                    .sessions
                    .get_session(&session_id)
                    .await
                    .expect("session just upserted"))
            }
            PairingToken::ClientInitiated(token) => {
                self.create_invitation(CreateInvitationOptions {
                    relays: token.relays,
                    permissions: token.perms,
                    metadata: token.metadata,
                    secret: token.secret,
                    algorithm: Some(options.algorithm),
                })
                .await
                .map(|(session, _uri)| session)
            }
        }
    }

    /// Generate a fresh keypair, build a `nostrconnect://` invitation, store
    /// it as a pairing session, and return both. The client then waits for
    /// the signer to initiate the `connect` handshake (`handle_request` in
    /// `queue.rs`).
    pub async fn create_invitation(
        self: &Arc<Self>,
        options: CreateInvitationOptions,
    ) -> Result<(Session, String), Nip46Error> {
        self.init().await?;

        let keypair = keys::generate();
        let relays = crate::relay::normalize_and_dedupe(&options.relays);
        let secret = Some(options.secret.unwrap_or_else(random_secret_hex));

        let session = Session::new_client_initiated(
            keypair,
            relays.clone(),
            options.permissions.clone(),
            secret.clone(),
        );
        let session = self.with_algorithm(session, options.algorithm.unwrap_or(Algorithm::Algo44));
        let client_pubkey = keys::PublicKey::from_hex(&session.client_public_key)
            .expect("session's own public key is always valid hex");

        let built_uri = uri::build_client_initiated(
            &client_pubkey,
            &relays,
            secret.as_deref(),
            &session.permissions,
            Some(&options.metadata),
        );

        self.sessions.upsert(session.clone()).await?;
        Ok((session, built_uri))
    }

    /// Look up `session_id` and enqueue `(method, params)` through the
    /// request queue. Fails synchronously (before ever touching the
    /// transport) if the session doesn't exist.
    pub async fn send_request(
        &self,
        session_id: &str,
        method: Method,
        params: Vec<String>,
        id: Option<String>,
    ) -> Result<ResponsePayload, Nip46Error> {
        if self.sessions.get_session(session_id).await.is_none() {
            return Err(Nip46Error::UnknownSession(session_id.to_string()));
        }
        let payload = RequestPayload::new(id, method, params);
        Ok(self.queue.enqueue(session_id, payload).await?)
    }

    /// Re-issue the `connect` handshake for an existing session (e.g. after
    /// the user manually retries a failed pairing).
    pub async fn connect_session(&self, session_id: &str) -> Result<ResponsePayload, Nip46Error> {
        let session = self
            .sessions
            .get_session(session_id)
            .await
            .ok_or_else(|| Nip46Error::UnknownSession(session_id.to_string()))?;

        if session.remote_signer_pubkey.is_empty() {
            return Err(Nip46Error::Queue(crate::error::QueueError::SignerPubkeyUnknown));
        }

        let mut params = vec![session.remote_signer_pubkey.clone()];
        if let Some(secret) = &session.pairing_secret {
            params.push(secret.clone());
        }

        let connect = RequestPayload::new(None, Method::Connect, params);
        let response = self.queue.enqueue(session_id, connect.clone()).await?;
        self.after_connect(session_id, &response).await?;
        Ok(response)
    }

    /// Issue `get_public_key` and persist the result on the session.
    pub async fn fetch_user_public_key(&self, session_id: &str) -> Result<String, Nip46Error> {
        let payload = RequestPayload::new(None, Method::GetPublicKey, vec![]);
        let response = self.queue.enqueue(session_id, payload).await?;
        let result = response
            .result
            .ok_or_else(|| Nip46Error::Other("get_public_key response carried no result".into()))?;

        self.sessions
            .update(session_id, |s| s.user_pubkey = result.clone())
            .await?;
        Ok(result)
    }

    /// After a successful `connect` response, fetch the user's pubkey if
    /// it's still unknown and the session permits it (mirrors the
    /// auto-enqueue the queue itself performs for signer-initiated connects
    /// in `queue.rs`'s `handle_request`).
    async fn after_connect(
        &self,
        session_id: &str,
        _response: &ResponsePayload,
    ) -> Result<(), Nip46Error> {
        let Some(session) = self.sessions.get_session(session_id).await else {
            return Ok(());
        };
        let needs_pubkey = session.user_pubkey.is_empty()
            && session.permissions.iter().any(|p| p == "get_public_key");
        if needs_pubkey {
            self.fetch_user_public_key(session_id).await?;
        }
        Ok(())
    }

    fn with_algorithm(&self, mut session: Session, algorithm: Algorithm) -> Session {
        session.algorithm = algorithm;
        session
    }
}

fn random_secret_hex() -> String {
    let mut bytes = [0u8; 16];
    getrandom(&mut bytes).expect("system RNG must be available");
    hex::encode(bytes)
}
