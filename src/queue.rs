//! Request queue / dispatcher: per-request correlation, timeout, the
//! incoming-event state machine, secret validation, auth-challenge
//! handling, and the signer-initiated `connect` reply.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_lock::Mutex;
use futures::channel::oneshot;
use futures::future::Either;
use tracing::{debug, info, warn};

use crate::cipher::EncryptionContext;
use crate::config::QueueConfig;
use crate::error::{QueueError, TransportError};
use crate::keys::{self, PublicKey, SecretKey};
use crate::payload::{self, Method, RequestPayload, ResponsePayload};
use crate::relay::{EventHandler, Filter, RelayEvent, Transport, Unsubscribe};
use crate::session::{Session, SessionManager, SessionStatus};
use crate::time::now_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingState {
    Pending,
    Sent,
    Resolved,
    Error,
    Expired,
    Challenge,
}

struct InFlight {
    method: Method,
    #[allow(dead_code)]
    state: PendingState,
    responder: Option<oneshot::Sender<Result<ResponsePayload, QueueError>>>,
    deadline: Arc<StdMutex<Instant>>,
    /// `createdAt`/`lastSentAt` in wall-clock millis, folded into the
    /// subscription's `since` window alongside each session's timestamps.
    created_at_ms: u64,
}

/// Per-request correlation, timers, subscription lifecycle, and the
/// incoming-event state machine described by the dispatcher design.
pub struct Queue {
    transport: Arc<dyn Transport>,
    sessions: Arc<SessionManager>,
    config: QueueConfig,
    inflight: Mutex<HashMap<String, InFlight>>,
    subscription: Mutex<Option<Unsubscribe>>,
}

impl Queue {
    pub fn new(
        transport: Arc<dyn Transport>,
        sessions: Arc<SessionManager>,
        config: QueueConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            sessions,
            config,
            inflight: Mutex::new(HashMap::new()),
            subscription: Mutex::new(None),
        })
    }

    /// Enqueue `(session, payload)`. Resolves with the correlated response,
    /// or rejects on publish failure, timeout, or a remote-carried error.
    pub async fn enqueue(
        self: &Arc<Self>,
        session_id: &str,
        payload: RequestPayload,
    ) -> Result<ResponsePayload, QueueError> {
        let session = self
            .sessions
            .get_session(session_id)
            .await
            .ok_or(QueueError::SignerPubkeyUnknown)?;

        if session.remote_signer_pubkey.is_empty() {
            return Err(QueueError::SignerPubkeyUnknown);
        }

        let (tx, rx) = oneshot::channel();
        let deadline = Arc::new(StdMutex::new(
            Instant::now() + Duration::from_millis(self.config.request_timeout_ms),
        ));

        {
            let mut inflight = self.inflight.lock().await;
            inflight.insert(
                payload.id.clone(),
                InFlight {
                    method: payload.method,
                    state: PendingState::Pending,
                    responder: Some(tx),
                    deadline: deadline.clone(),
                    created_at_ms: now_millis(),
                },
            );
        }

        let relays = session.relays.clone();
        self.sessions
            .update(session_id, |s| s.pending_relays = s.relays.clone())
            .await
            .ok();

        match self.publish_request(&session, &payload, &relays).await {
            Ok(()) => {
                if let Some(inflight) = self.inflight.lock().await.get_mut(&payload.id) {
                    inflight.state = PendingState::Sent;
                }
                self.sessions
                    .update(session_id, |s| {
                        s.last_seen_at = now_millis();
                        s.pending_relays.clear();
                    })
                    .await
                    .ok();
            }
            Err(e) => {
                self.inflight.lock().await.remove(&payload.id);
                let message = e.to_string();
                let relay_not_connected = matches!(e, TransportError::RelayNotConnected(_));
                self.sessions
                    .update(session_id, |s| {
                        s.last_error = Some(message.clone());
                        if relay_not_connected {
                            s.status = SessionStatus::Pairing;
                        }
                    })
                    .await
                    .ok();
                return Err(e.into());
            }
        }

        self.await_response(payload.id, rx, deadline).await
    }

    async fn publish_request(
        &self,
        session: &Session,
        payload: &RequestPayload,
        relays: &[String],
    ) -> Result<(), TransportError> {
        let secret_key = SecretKey::from_hex(&session.client_private_key)
            .map_err(|e| TransportError::PublishFailed(e.to_string()))?;
        let remote_pubkey = crate::cipher::normalize_remote_pubkey(&session.remote_signer_pubkey)
            .map_err(|e| TransportError::PublishFailed(e.to_string()))?;
        let ctx = EncryptionContext {
            local_private_key: &secret_key,
            remote_public_key: &remote_pubkey,
            algorithm: session.algorithm,
        };

        let ciphertext = payload::encode_request(payload, &ctx)
            .map_err(|e| TransportError::PublishFailed(e.to_string()))?;

        let event = build_event(
            &session.client_public_key,
            &secret_key,
            &session.remote_signer_pubkey,
            &ciphertext,
        )
        .map_err(TransportError::PublishFailed)?;

        self.transport.publish(relays, event).await
    }

    /// Races the correlated response against the deadline. A deadline that
    /// moved (an auth challenge extended it) is not a timeout: the loop
    /// re-reads it and sleeps again.
    async fn await_response(
        &self,
        request_id: String,
        mut rx: oneshot::Receiver<Result<ResponsePayload, QueueError>>,
        deadline: Arc<StdMutex<Instant>>,
    ) -> Result<ResponsePayload, QueueError> {
        loop {
            let current_deadline = *deadline.lock().expect("deadline mutex poisoned");
            let sleep_fut = crate::rt::sleep_until(current_deadline);
            futures::pin_mut!(sleep_fut);

            match futures::future::select(&mut rx, sleep_fut).await {
                Either::Left((result, _)) => {
                    self.inflight.lock().await.remove(&request_id);
                    return result.unwrap_or(Err(QueueError::Timeout));
                }
                Either::Right((_, _)) => {
                    let latest_deadline = *deadline.lock().expect("deadline mutex poisoned");
                    if latest_deadline > current_deadline {
                        continue;
                    }
                    if let Some(entry) = self.inflight.lock().await.get_mut(&request_id) {
                        entry.state = PendingState::Expired;
                    }
                    self.inflight.lock().await.remove(&request_id);
                    return Err(QueueError::Timeout);
                }
            }
        }
    }

    /// Rebuild the single subscription across every known session's relays
    /// and client pubkeys. Always closes the previous handle first.
    pub async fn rebuild_subscription(self: &Arc<Self>) {
        let sessions = self.sessions.get_sessions().await;

        if let Some(unsub) = self.subscription.lock().await.take() {
            unsub();
        }

        if sessions.is_empty() {
            return;
        }

        let p_tags: Vec<String> = sessions.iter().map(|s| s.client_public_key.clone()).collect();
        let mut relays: Vec<String> = Vec::new();
        for session in &sessions {
            for relay in &session.relays {
                if !relays.contains(relay) {
                    relays.push(relay.clone());
                }
            }
        }

        let session_min_ms = sessions
            .iter()
            .map(|s| s.last_seen_at.max(s.updated_at).max(s.created_at))
            .min()
            .unwrap_or_else(now_millis);
        let pending_min_ms = self
            .inflight
            .lock()
            .await
            .values()
            .map(|entry| entry.created_at_ms)
            .min();
        let min_relevant_ms = match pending_min_ms {
            Some(pending) => session_min_ms.min(pending),
            None => session_min_ms,
        };

        let since = (min_relevant_ms / 1000).saturating_sub(self.config.since_window_secs);

        let filter = Filter {
            kinds: vec![24133],
            p_tags,
            since,
        };

        let queue = self.clone();
        let handler: EventHandler = Box::new(move |event| {
            let queue = queue.clone();
            crate::rt::spawn(async move {
                queue.handle_incoming(event).await;
            });
        });

        let unsub = self.transport.subscribe(&relays, filter, handler).await;
        *self.subscription.lock().await = Some(unsub);
    }

    async fn handle_incoming(self: &Arc<Self>, event: RelayEvent) {
        let Some(client_pubkey) = event
            .tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some("p"))
            .and_then(|t| t.get(1))
        else {
            return;
        };

        let Some(session) = self.sessions.get_session_by_client_pubkey(client_pubkey).await else {
            debug!("dropping event for unknown client pubkey {client_pubkey}");
            return;
        };

        let secret_key = match SecretKey::from_hex(&session.client_private_key) {
            Ok(k) => k,
            Err(e) => {
                warn!("session {} has unparseable client key: {e}", session.id);
                return;
            }
        };
        let remote_pubkey = match crate::cipher::normalize_remote_pubkey(&event.pubkey) {
            Ok(pk) => pk,
            Err(e) => {
                warn!("event pubkey {} invalid: {e}", event.pubkey);
                return;
            }
        };
        let ctx = EncryptionContext {
            local_private_key: &secret_key,
            remote_public_key: &remote_pubkey,
            algorithm: session.algorithm,
        };

        match payload::decode_response(&event.content, &ctx) {
            Ok(response) => self.handle_response(session, event.pubkey.clone(), response).await,
            Err(response_err) => {
                let is_decode_failure = matches!(
                    &response_err,
                    crate::error::PayloadError::Codec(c) if c.is_decode()
                );
                if !is_decode_failure {
                    warn!("failed to decode incoming event as a response: {response_err}");
                    return;
                }
                match payload::decode_request(&event.content, &ctx) {
                    Ok(request) => self.handle_request(session, event.pubkey, request).await,
                    Err(request_err) => {
                        warn!(
                            "event neither decoded as response nor as request: {response_err} / {request_err}"
                        );
                    }
                }
            }
        }
    }

    async fn handle_response(
        self: &Arc<Self>,
        session: Session,
        event_pubkey: String,
        response: ResponsePayload,
    ) {
        let session_id = session.id.clone();
        let pending_method = {
            let inflight = self.inflight.lock().await;
            inflight.get(&response.id).map(|entry| entry.method)
        };

        if response.is_auth_challenge() {
            let challenge_url = response.error.clone().unwrap_or_default();
            self.sessions
                .update(&session_id, |s| {
                    s.status = SessionStatus::Pairing;
                    s.auth_challenge_url = Some(challenge_url);
                    s.last_error = None;
                    s.pending_relays.clear();
                    s.last_seen_at = now_millis();
                })
                .await
                .ok();

            let mut inflight = self.inflight.lock().await;
            if let Some(entry) = inflight.get_mut(&response.id) {
                entry.state = PendingState::Challenge;
                *entry.deadline.lock().expect("deadline mutex poisoned") =
                    Instant::now() + Duration::from_millis(self.config.request_timeout_ms);
            }
            return;
        }

        let mut effective_response = response.clone();

        // The secret-echo mismatch check (result must equal pairingSecret or
        // the session is revoked) is the nostrconnect direction's job,
        // handled in `handle_request` when the signer dials back in. Here we
        // are the one who sent `connect` with the secret as a param (the
        // bunker:// direction); the signer's own success shape is whatever
        // it wants ("ack" per spec.md §8 scenario 1), so any non-error
        // response just consumes the secret.
        if session.pairing_secret.is_some() {
            if pending_method == Some(Method::Connect) {
                if response.error.is_none() {
                    self.sessions
                        .update(&session_id, |s| s.pairing_secret = None)
                        .await
                        .ok();
                }
            } else if response.result.as_deref().is_some_and(|r| !r.is_empty()) {
                self.sessions
                    .update(&session_id, |s| s.pairing_secret = None)
                    .await
                    .ok();
            }
        }

        if let Some(err) = effective_response.error.as_ref() {
            let lower = err.to_ascii_lowercase();
            let already_connected = lower.contains("already") && lower.contains("connect");
            let method_is_connect = pending_method == Some(Method::Connect);
            let session_already_active = session.status == SessionStatus::Active;
            if already_connected && (method_is_connect || (pending_method.is_none() && session_already_active)) {
                effective_response.error = None;
            }
        }

        let remaining_error = effective_response.error.clone();
        let new_status = if remaining_error.is_some() {
            SessionStatus::Pairing
        } else {
            SessionStatus::Active
        };

        let adopt_pubkey = session.remote_signer_pubkey.is_empty();
        self.sessions
            .update(&session_id, |s| {
                s.status = new_status;
                s.last_seen_at = now_millis();
                s.auth_challenge_url = None;
                s.pending_relays.clear();
                s.last_error = remaining_error.clone();
                if adopt_pubkey && s.remote_signer_pubkey.is_empty() {
                    s.remote_signer_pubkey = event_pubkey.clone();
                }
            })
            .await
            .ok();

        let settle_result = if remaining_error.is_some() {
            Err(QueueError::RemoteError(remaining_error.unwrap_or_default()))
        } else {
            Ok(effective_response)
        };
        self.settle(&response.id, settle_result).await;
    }

    async fn settle(&self, request_id: &str, result: Result<ResponsePayload, QueueError>) {
        let mut inflight = self.inflight.lock().await;
        if let Some(mut entry) = inflight.remove(request_id) {
            entry.state = match &result {
                Ok(_) => PendingState::Resolved,
                Err(_) => PendingState::Error,
            };
            if let Some(responder) = entry.responder.take() {
                let _ = responder.send(result);
            }
        }
    }

    async fn handle_request(self: &Arc<Self>, session: Session, event_pubkey: String, request: RequestPayload) {
        if request.method != Method::Connect {
            self.reply(&session, &event_pubkey, ResponsePayload::err(&request.id, "unsupported_method"))
                .await;
            return;
        }

        let session_id = session.id.clone();
        let incoming_secret = request.params.get(1).cloned();

        if let Some(expected) = session.pairing_secret.clone() {
            if incoming_secret.as_deref().is_some_and(|s| s != expected) {
                self.sessions
                    .update(&session_id, |s| {
                        s.status = SessionStatus::Revoked;
                        s.last_error = Some("signer failed secret validation".to_string());
                    })
                    .await
                    .ok();
                self.reply(&session, &event_pubkey, ResponsePayload::err(&request.id, "invalid_secret"))
                    .await;
                return;
            }
        }

        let result_value = session.pairing_secret.clone().unwrap_or_else(|| "ack".to_string());
        let adopt_pubkey = session.remote_signer_pubkey.is_empty();
        self.sessions
            .update(&session_id, |s| {
                s.status = SessionStatus::Active;
                s.pairing_secret = None;
                s.last_error = None;
                if adopt_pubkey {
                    s.remote_signer_pubkey = event_pubkey.clone();
                }
            })
            .await
            .ok();

        self.reply(&session, &event_pubkey, ResponsePayload::ok(&request.id, result_value))
            .await;
        self.sessions.set_active(&session_id).await.ok();

        if let Some(refreshed) = self.sessions.get_session(&session_id).await {
            let should_fetch_pubkey = refreshed.user_pubkey.is_empty()
                && refreshed.permissions.iter().any(|p| p == "get_public_key")
                && !refreshed.remote_signer_pubkey.is_empty();
            if should_fetch_pubkey {
                let queue = self.clone();
                crate::rt::spawn(async move {
                    let payload = RequestPayload::new(None, Method::GetPublicKey, vec![]);
                    if let Ok(response) = queue.enqueue(&session_id, payload).await {
                        if let Some(result) = response.result {
                            queue
                                .sessions
                                .update(&session_id, |s| s.user_pubkey = result)
                                .await
                                .ok();
                        }
                    }
                });
            }
        }
    }

    async fn reply(&self, session: &Session, remote_pubkey_hex: &str, response: ResponsePayload) {
        let secret_key = match SecretKey::from_hex(&session.client_private_key) {
            Ok(k) => k,
            Err(_) => return,
        };
        let remote_pubkey = match crate::cipher::normalize_remote_pubkey(remote_pubkey_hex) {
            Ok(pk) => pk,
            Err(_) => return,
        };
        let ctx = EncryptionContext {
            local_private_key: &secret_key,
            remote_public_key: &remote_pubkey,
            algorithm: session.algorithm,
        };

        let Ok(ciphertext) = payload::encode_response(&response, &ctx) else {
            return;
        };
        let Ok(event) = build_event(
            &session.client_public_key,
            &secret_key,
            remote_pubkey_hex,
            &ciphertext,
        ) else {
            return;
        };

        if let Err(e) = self.transport.publish(&session.relays, event).await {
            warn!("failed to publish reply for session {}: {e}", session.id);
        }
    }

    /// Unsubscribe and drop every in-flight responder without resolving it
    /// (callers are expected to have abandoned any outstanding awaits).
    pub async fn destroy(&self) {
        if let Some(unsub) = self.subscription.lock().await.take() {
            unsub();
        }
        self.inflight.lock().await.clear();
        info!("queue destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Keypair;
    use crate::storage::InMemoryStorage;
    use async_trait::async_trait;

    struct NullTransport;

    #[async_trait]
    impl Transport for NullTransport {
        async fn publish(&self, _relays: &[String], _event: RelayEvent) -> Result<(), TransportError> {
            Ok(())
        }
        async fn subscribe(
            &self,
            _relays: &[String],
            _filter: Filter,
            _handler: EventHandler,
        ) -> Unsubscribe {
            Box::new(|| {})
        }
    }

    struct FailingTransport;

    #[async_trait]
    impl Transport for FailingTransport {
        async fn publish(&self, _relays: &[String], _event: RelayEvent) -> Result<(), TransportError> {
            Err(TransportError::RelayNotConnected("wss://relay".into()))
        }
        async fn subscribe(
            &self,
            _relays: &[String],
            _filter: Filter,
            _handler: EventHandler,
        ) -> Unsubscribe {
            Box::new(|| {})
        }
    }

    async fn setup(
        transport: Arc<dyn Transport>,
        timeout_ms: u64,
    ) -> (Arc<Queue>, Arc<SessionManager>, Session, Keypair) {
        let sessions = Arc::new(SessionManager::new(Arc::new(InMemoryStorage::new())));
        let remote = keys::generate();
        let mut session = Session::new_signer_initiated(
            keys::generate(),
            remote.public_key.to_hex(),
            vec!["wss://relay".into()],
            vec![],
            None,
            Default::default(),
        );
        session.status = SessionStatus::Active;
        sessions.upsert(session.clone()).await.unwrap();
        let session = sessions.get_session(&session.id).await.unwrap();

        let config = QueueConfig {
            request_timeout_ms: timeout_ms,
            since_window_secs: 30,
        };
        let queue = Queue::new(transport, sessions.clone(), config);
        (queue, sessions, session, remote)
    }

    /// Build a wire event as if sent by `remote`, correlated to `session`'s
    /// client keypair, carrying `response` as the encrypted plaintext.
    fn encode_response_event(session: &Session, remote: &Keypair, response: &ResponsePayload) -> RelayEvent {
        let client_pubkey = PublicKey::from_hex(&session.client_public_key).unwrap();
        let ctx = EncryptionContext {
            local_private_key: &remote.secret_key,
            remote_public_key: &client_pubkey,
            algorithm: session.algorithm,
        };
        let content = payload::encode_response(response, &ctx).unwrap();
        build_event(
            &remote.public_key.to_hex(),
            &remote.secret_key,
            &session.client_public_key,
            &content,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn enqueue_times_out_when_no_response_arrives() {
        let (queue, _sessions, session, _remote) = setup(Arc::new(NullTransport), 50).await;
        let payload = RequestPayload::new(Some("T1".into()), Method::Ping, vec![]);
        let result = queue.enqueue(&session.id, payload).await;
        assert!(matches!(result, Err(QueueError::Timeout)));
    }

    #[tokio::test]
    async fn publish_failure_marks_session_pairing_and_propagates() {
        let (queue, sessions, session, _remote) = setup(Arc::new(FailingTransport), 5_000).await;
        let payload = RequestPayload::new(Some("F1".into()), Method::Ping, vec![]);
        let result = queue.enqueue(&session.id, payload).await;
        assert!(matches!(
            result,
            Err(QueueError::Transport(TransportError::RelayNotConnected(_)))
        ));

        let refreshed = sessions.get_session(&session.id).await.unwrap();
        assert_eq!(refreshed.status, SessionStatus::Pairing);
        assert!(refreshed.last_error.is_some());
    }

    #[tokio::test]
    async fn auth_challenge_restarts_timer_then_resolves() {
        let (queue, sessions, session, remote) = setup(Arc::new(NullTransport), 200).await;
        let payload = RequestPayload::new(Some("R1".into()), Method::SignEvent, vec![]);
        let queue_for_task = queue.clone();
        let session_id = session.id.clone();
        let handle = tokio::spawn(async move { queue_for_task.enqueue(&session_id, payload).await });

        tokio::time::sleep(Duration::from_millis(20)).await;

        let challenge = ResponsePayload::auth_challenge("R1", "https://signer/approve/X");
        queue.handle_incoming(encode_response_event(&session, &remote, &challenge)).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        let mid_flight = sessions.get_session(&session.id).await.unwrap();
        assert_eq!(
            mid_flight.auth_challenge_url.as_deref(),
            Some("https://signer/approve/X")
        );

        let ok = ResponsePayload::ok("R1", "signed-event-json");
        queue.handle_incoming(encode_response_event(&session, &remote, &ok)).await;

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.result.as_deref(), Some("signed-event-json"));

        let settled = sessions.get_session(&session.id).await.unwrap();
        assert!(settled.auth_challenge_url.is_none());
        assert_eq!(settled.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn connect_response_matching_secret_clears_it_and_activates() {
        let (queue, sessions, mut session, remote) = setup(Arc::new(NullTransport), 5_000).await;
        session.pairing_secret = Some("SECRET".into());
        sessions.upsert(session.clone()).await.unwrap();
        let session = sessions.get_session(&session.id).await.unwrap();

        let payload = RequestPayload::new(Some("C1".into()), Method::Connect, vec![]);
        let queue_for_task = queue.clone();
        let session_id = session.id.clone();
        let handle = tokio::spawn(async move { queue_for_task.enqueue(&session_id, payload).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let resp = ResponsePayload::ok("C1", "SECRET");
        queue.handle_incoming(encode_response_event(&session, &remote, &resp)).await;

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.result.as_deref(), Some("SECRET"));

        let refreshed = sessions.get_session(&session.id).await.unwrap();
        assert!(refreshed.pairing_secret.is_none());
        assert_eq!(refreshed.status, SessionStatus::Active);
    }

    /// The bunker:// direction: we sent the secret as a `connect` param and
    /// the signer answers with its own success shape (`"ack"` per spec.md
    /// §8 scenario 1, but any non-error result counts). The secret-echo
    /// mismatch check belongs to the nostrconnect direction (`handle_request`,
    /// see `incoming_connect_request_with_wrong_secret_revokes_session`
    /// below), not to responses correlated here.
    #[tokio::test]
    async fn connect_response_clears_secret_regardless_of_result_value() {
        let (queue, sessions, mut session, remote) = setup(Arc::new(NullTransport), 5_000).await;
        session.pairing_secret = Some("SECRET".into());
        sessions.upsert(session.clone()).await.unwrap();
        let session = sessions.get_session(&session.id).await.unwrap();

        let payload = RequestPayload::new(Some("C2".into()), Method::Connect, vec![]);
        let queue_for_task = queue.clone();
        let session_id = session.id.clone();
        let handle = tokio::spawn(async move { queue_for_task.enqueue(&session_id, payload).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let resp = ResponsePayload::ok("C2", "ack");
        queue.handle_incoming(encode_response_event(&session, &remote, &resp)).await;

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.result.as_deref(), Some("ack"));

        let refreshed = sessions.get_session(&session.id).await.unwrap();
        assert!(refreshed.pairing_secret.is_none());
        assert_eq!(refreshed.status, SessionStatus::Active);
        assert!(refreshed.last_error.is_none());
    }

    /// The nostrconnect:// direction: the signer dials back in with a
    /// `connect` request carrying the secret we put in the invitation URI.
    /// A mismatching secret revokes the session and replies `invalid_secret`.
    #[tokio::test]
    async fn incoming_connect_request_with_wrong_secret_revokes_session() {
        let (queue, sessions, mut session, remote) = setup(Arc::new(NullTransport), 5_000).await;
        session.pairing_secret = Some("SECRET".into());
        session.status = SessionStatus::Pairing;
        sessions.upsert(session.clone()).await.unwrap();
        let session = sessions.get_session(&session.id).await.unwrap();

        let request = RequestPayload::new(
            Some("Q1".into()),
            Method::Connect,
            vec![session.client_public_key.clone(), "WRONG".into()],
        );
        let client_pubkey = PublicKey::from_hex(&session.client_public_key).unwrap();
        let ctx = EncryptionContext {
            local_private_key: &remote.secret_key,
            remote_public_key: &client_pubkey,
            algorithm: session.algorithm,
        };
        let content = payload::encode_request(&request, &ctx).unwrap();
        let event = build_event(
            &remote.public_key.to_hex(),
            &remote.secret_key,
            &session.client_public_key,
            &content,
        )
        .unwrap();

        queue.handle_incoming(event).await;

        let refreshed = sessions.get_session(&session.id).await.unwrap();
        assert_eq!(refreshed.status, SessionStatus::Revoked);
        assert!(refreshed.pairing_secret.is_some());
        assert_eq!(
            refreshed.last_error.as_deref(),
            Some("signer failed secret validation")
        );
    }

    #[tokio::test]
    async fn already_connected_tolerance_does_not_apply_to_non_connect_methods() {
        let (queue, sessions, session, remote) = setup(Arc::new(NullTransport), 5_000).await;
        let payload = RequestPayload::new(Some("P1".into()), Method::Ping, vec![]);
        let queue_for_task = queue.clone();
        let session_id = session.id.clone();
        let handle = tokio::spawn(async move { queue_for_task.enqueue(&session_id, payload).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let resp = ResponsePayload::err("P1", "Already connected to this signer");
        queue.handle_incoming(encode_response_event(&session, &remote, &resp)).await;

        let result = handle.await.unwrap();
        assert!(result.is_err(), "ping isn't `connect`, so the tolerance shouldn't fire");

        let refreshed = sessions.get_session(&session.id).await.unwrap();
        assert_eq!(refreshed.status, SessionStatus::Pairing);
    }

    #[tokio::test]
    async fn already_connected_tolerance_fires_for_pending_connect() {
        let (queue, sessions, session, remote) = setup(Arc::new(NullTransport), 5_000).await;
        let payload = RequestPayload::new(Some("CC1".into()), Method::Connect, vec![]);
        let queue_for_task = queue.clone();
        let session_id = session.id.clone();
        let handle = tokio::spawn(async move { queue_for_task.enqueue(&session_id, payload).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let resp = ResponsePayload::err("CC1", "Already connected to this signer");
        queue.handle_incoming(encode_response_event(&session, &remote, &resp)).await;

        let result = handle.await.unwrap().unwrap();
        assert!(result.error.is_none());

        let refreshed = sessions.get_session(&session.id).await.unwrap();
        assert_eq!(refreshed.status, SessionStatus::Active);
    }
}

fn build_event(
    client_pubkey_hex: &str,
    secret_key: &SecretKey,
    remote_pubkey_hex: &str,
    content: &str,
) -> Result<RelayEvent, String> {
    let pubkey = PublicKey::from_hex(client_pubkey_hex).map_err(|e| e.to_string())?;
    let created_at = now_millis() / 1000;
    let tags = vec![vec!["p".to_string(), remote_pubkey_hex.to_string()]];
    let id = keys::compute_event_id(&pubkey, created_at, 24133, &tags, content);
    let sig = keys::sign_event_id(secret_key, &id).map_err(|e| e.to_string())?;

    Ok(RelayEvent {
        kind: 24133,
        pubkey: client_pubkey_hex.to_string(),
        content: content.to_string(),
        created_at,
        tags,
        id: hex::encode(id),
        sig,
        relays: None,
        session_id: None,
    })
}
