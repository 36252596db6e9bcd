//! The WhisperBox protocol engine.
//!
//! A single task owns every piece of mutable state: the repository, the
//! key store, the navigation context and the channel subscription. Local
//! actions reach it through an `EngineHandle`; inbound channel traffic is
//! processed in the same `tokio::select!` loop, one message at a time.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, watch};
use whisperbox_protocol::{
    constants::CHANNEL,
    envelope::Envelope,
    form::{Answer, Form, FormDraft, Response},
    payload::{random_confirmation_id, Confirmation, EncryptedResponse},
    signature::{verify_form, verify_response},
    ProtocolError,
};

use crate::{
    error::EngineError,
    events::{EngineEvent, EngineState, EventSink},
    handle::{Command, EngineHandle},
    identity::Wallet,
    keystore::KeyStore,
    repository::{FormRepository, Role},
    transport::{PeerProtocol, Subscription, Transport, TransportError},
};

const COMMAND_QUEUE: usize = 64;

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Peers required per protocol before joining the channel.
    pub min_peers:         usize,
    /// `None` waits forever.
    pub peer_wait_timeout: Option<Duration>,
    pub event_capacity:    usize,
    /// Unix milliseconds.
    pub clock:             fn() -> u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_peers:         1,
            peer_wait_timeout: Some(Duration::from_secs(30)),
            event_capacity:    256,
            clock:             now_millis,
        }
    }
}

/// What happened to one inbound message that was not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// Stored and, where applicable, announced.
    Admitted,
    /// Already held; nothing changed.
    Known,
    /// A valid form this node does not keep.
    Declined,
    /// Sealed for a form whose key we do not hold.
    Unaddressed,
    /// Confirmation for a form we do not hold.
    UnknownForm,
}

pub struct Engine {
    config:       EngineConfig,
    transport:    Arc<dyn Transport>,
    wallet:       Arc<dyn Wallet>,
    repository:   FormRepository,
    keys:         KeyStore,
    events:       EventSink,
    commands:     mpsc::Receiver<Command>,
    state:        EngineState,
    subscription: Option<Subscription>,
    current_form: Option<String>,
    granted:      HashSet<String>,
}

impl Engine {
    pub fn new(
        config:     EngineConfig,
        transport:  Arc<dyn Transport>,
        wallet:     Arc<dyn Wallet>,
        repository: FormRepository,
        keys:       KeyStore,
    ) -> (Self, EngineHandle, mpsc::Receiver<EngineEvent>) {
        let (events, event_rx) = EventSink::channel(config.event_capacity);
        let (command_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let engine = Self {
            config,
            transport,
            wallet,
            repository,
            keys,
            events,
            commands,
            state: EngineState::Uninitialized,
            subscription: None,
            current_form: None,
            granted: HashSet::new(),
        };
        (engine, EngineHandle::new(command_tx), event_rx)
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn address(&self) -> &str {
        self.wallet.address()
    }

    pub fn repository(&self) -> &FormRepository {
        &self.repository
    }

    fn set_state(&mut self, state: EngineState) {
        if self.state != state {
            tracing::info!("Engine state: {} -> {}", self.state, state);
            self.state = state;
            self.events.emit(EngineEvent::StateChanged { state });
        }
    }

    fn ensure_ready(&self) -> Result<(), EngineError> {
        match self.state {
            EngineState::Ready => Ok(()),
            other => Err(EngineError::NotReady(other)),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Wait for peers, subscribe and replay history. Calling it again after
    /// a failure retries from scratch; on a ready engine it does nothing.
    pub async fn initialize(&mut self) -> Result<(), EngineError> {
        if self.state == EngineState::Ready {
            return Ok(());
        }
        self.set_state(EngineState::Initializing);
        match self.try_initialize().await {
            Ok(()) => {
                self.set_state(EngineState::Ready);
                Ok(())
            }
            Err(e) => {
                tracing::error!("Initialization failed: {e}");
                self.subscription = None;
                self.set_state(EngineState::Failed);
                Err(e)
            }
        }
    }

    async fn try_initialize(&mut self) -> Result<(), EngineError> {
        let wait = self.transport.wait_for_peers(&PeerProtocol::ALL, self.config.min_peers);
        match self.config.peer_wait_timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| TransportError::PeerTimeout(PeerProtocol::ALL.to_vec(), limit))??,
            None => wait.await?,
        }

        self.subscription = Some(self.transport.subscribe(CHANNEL).await?);
        tracing::info!("Subscribed to {CHANNEL}");

        let local = self.transport.replay_local(CHANNEL).await?;
        self.replay(local, "local").await;

        if self.repository.is_empty() {
            let network = self.transport.replay_network(CHANNEL).await?;
            self.replay(network, "network").await;
        }
        Ok(())
    }

    async fn replay(&mut self, messages: Vec<Vec<u8>>, source: &str) {
        let count = messages.len();
        for bytes in messages {
            self.dispatch(&bytes).await;
        }
        tracing::info!("Replayed {count} {source} history messages ({} forms held)", self.repository.len());
    }

    /// Drive commands and channel traffic until `shutdown` flips to true.
    /// A command or message in flight is abandoned at its next suspension
    /// point; its caller sees `EngineError::Shutdown`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(address = %self.wallet.address(), "Engine running");
        loop {
            let stopped = tokio::select! {
                _ = shutdown_requested(&mut shutdown) => true,
                Some(command) = self.commands.recv() => {
                    interrupted(&mut shutdown, self.handle_command(command)).await
                }
                message = next_message(&mut self.subscription) => match message {
                    Some(bytes) => interrupted(&mut shutdown, self.dispatch(&bytes)).await,
                    None => {
                        tracing::warn!("Subscription to {CHANNEL} ended");
                        self.subscription = None;
                        false
                    }
                },
            };
            if stopped {
                break;
            }
        }
        tracing::info!("Engine stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Initialize(reply) => {
                let _ = reply.send(self.initialize().await);
            }
            Command::CreateForm { draft, reply } => {
                let _ = reply.send(self.create_form(draft).await);
            }
            Command::SubmitResponse { form_id, answers, display_name, reply } => {
                let _ = reply.send(self.submit_response(&form_id, answers, display_name).await);
            }
            Command::NavigateTo { form_id, reply } => {
                let _ = reply.send(self.navigate_to(form_id).await);
            }
            Command::GrantAccess { form_id, reply } => {
                let _ = reply.send(self.grant_access(form_id).await);
            }
            Command::GetForm { form_id, reply } => {
                let _ = reply.send(Ok(self.form(&form_id)));
            }
            Command::ListForms { role, reply } => {
                let _ = reply.send(Ok(self.forms(role)));
            }
            Command::State(reply) => {
                let _ = reply.send(Ok(self.state));
            }
        }
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Error boundary for channel traffic: failures are logged and dropped.
    async fn dispatch(&mut self, bytes: &[u8]) {
        match self.handle_message(bytes).await {
            Ok(outcome) => tracing::trace!(?outcome, "Handled channel message"),
            Err(EngineError::Duplicate(what)) => tracing::debug!("Dropping duplicate {what}"),
            Err(e) => tracing::warn!("Dropping channel message: {e}"),
        }
    }

    pub async fn handle_message(&mut self, bytes: &[u8]) -> Result<Inbound, EngineError> {
        match Envelope::from_bytes(bytes)? {
            Envelope::NewForm(form) => self.handle_new_form(form).await,
            Envelope::FormResponse(sealed) => self.handle_form_response(sealed).await,
            Envelope::Confirmation(confirmation) => self.handle_confirmation(confirmation),
        }
    }

    pub async fn handle_new_form(&mut self, form: Form) -> Result<Inbound, EngineError> {
        if self.repository.contains(&form.id) {
            return Ok(Inbound::Known);
        }
        verify_form(&form)?;
        form.validate()?;

        let me = self.wallet.address();
        if !self.repository.access().can_access(&form, Some(me)).await {
            tracing::debug!(form = %form.id, "Declining form we cannot respond to");
            return Ok(Inbound::Declined);
        }
        // Open forms reach everyone; only keep the ones the user asked for.
        if form.is_open() && !self.holds_reference(&form.id) {
            tracing::debug!(form = %form.id, "Declining unreferenced open form");
            return Ok(Inbound::Declined);
        }

        let role = if form.is_created_by(me) && self.keys.contains(&form.id) {
            Role::Creator
        } else {
            Role::Accessible
        };
        let form = Form {
            private_key:   String::new(),
            responses:     Vec::new(),
            confirmations: Default::default(),
            ..form
        };
        self.repository.insert_form(form.clone(), role)?;
        tracing::info!(form = %form.id, creator = %form.creator, %role, "Admitted form: {}", form.title);
        self.events.emit(EngineEvent::NewForm { form });
        Ok(Inbound::Admitted)
    }

    pub async fn handle_form_response(
        &mut self,
        sealed: EncryptedResponse,
    ) -> Result<Inbound, EngineError> {
        let bytes = sealed.sealed_bytes()?;
        let Some((form_id, response)) = self.trial_decrypt(&bytes) else {
            return Ok(Inbound::Unaddressed);
        };
        let form = self
            .repository
            .get_form(&form_id)
            .cloned()
            .ok_or_else(|| EngineError::FormNotFound(form_id.clone()))?;

        response.validate_against(&form)?;
        if !form.is_open() {
            verify_response(&response)?;
        }
        self.repository.insert_response(response.clone()).await?;
        self.repository.insert_confirmation(&form_id, &response.confirmation_id)?;
        tracing::info!(form = %form_id, respondent = %response.respondent, "Admitted response");

        let confirmation = Confirmation::new(&form_id, &response.confirmation_id);
        let published = publish(self.transport.as_ref(), &Envelope::Confirmation(confirmation)).await;
        let form = self
            .repository
            .get_form(&form_id)
            .map(Form::for_publication)
            .unwrap_or(form);
        self.events.emit(EngineEvent::NewResponse { form, response });
        published?;
        Ok(Inbound::Admitted)
    }

    /// Try every stored sealing key; the first that opens the payload wins.
    fn trial_decrypt(&self, sealed: &[u8]) -> Option<(String, Response)> {
        for (form_id, private_key) in self.keys.iter() {
            match EncryptedResponse::open_with(sealed, private_key) {
                Ok(response) => return Some((form_id.to_string(), response)),
                Err(ProtocolError::Decryption) => continue,
                Err(e) => {
                    tracing::debug!(form = form_id, "Sealed payload opened but is not a response: {e}");
                }
            }
        }
        None
    }

    pub fn handle_confirmation(&mut self, confirmation: Confirmation) -> Result<Inbound, EngineError> {
        confirmation.validate()?;
        if !self.repository.contains(&confirmation.form_id) {
            return Ok(Inbound::UnknownForm);
        }
        let fresh = self
            .repository
            .insert_confirmation(&confirmation.form_id, &confirmation.confirmation_id)?;
        if fresh {
            tracing::info!(form = %confirmation.form_id, "Recorded confirmation");
            Ok(Inbound::Admitted)
        } else {
            Ok(Inbound::Known)
        }
    }

    fn holds_reference(&self, form_id: &str) -> bool {
        self.current_form.as_deref() == Some(form_id)
            || self.granted.contains(form_id)
            || self.keys.contains(form_id)
    }

    // ========================================================================
    // Local actions
    // ========================================================================

    /// Create, sign, publish and store a form. Nothing is stored unless the
    /// publish succeeded. The returned copy carries the private sealing key.
    pub async fn create_form(&mut self, draft: FormDraft) -> Result<Form, EngineError> {
        self.ensure_ready()?;
        draft.validate()?;

        let pair = KeyStore::generate();
        let creator = self.wallet.address().to_string();
        let mut form = draft.into_form(creator, (self.config.clock)(), pair.public_key);
        if self.repository.contains(&form.id) {
            return Err(EngineError::Duplicate(format!("form {}", form.id)));
        }
        form.creator_signature = self.wallet.sign(&form.signing_message()).await?;
        form.validate()?;

        publish(self.transport.as_ref(), &Envelope::new_form(&form)).await?;
        self.keys.persist(&form.id, &pair.private_key)?;
        self.repository.insert_form(form.clone(), Role::Creator)?;
        tracing::info!(form = %form.id, "Created form: {}", form.title);

        form.private_key = pair.private_key;
        Ok(form)
    }

    /// Answer a held form. Nothing is stored locally unless the publish
    /// succeeded.
    pub async fn submit_response(
        &mut self,
        form_id:      &str,
        answers:      Vec<Answer>,
        display_name: Option<String>,
    ) -> Result<Response, EngineError> {
        self.ensure_ready()?;
        let form = self
            .repository
            .get_form(form_id)
            .cloned()
            .ok_or_else(|| EngineError::FormNotFound(form_id.to_string()))?;

        let me = self.wallet.address().to_string();
        if !self.repository.access().can_access(&form, Some(&me)).await {
            return Err(EngineError::AccessDenied { form_id: form.id, address: me });
        }
        if self.repository.has_responded(&form.id, &me) {
            return Err(EngineError::Duplicate(format!("response from {me} to form {}", form.id)));
        }

        let mut response = Response {
            form_id:                 form.id.clone(),
            respondent:              me,
            respondent_display_name: display_name.filter(|n| !n.trim().is_empty()),
            submitted_at:            (self.config.clock)(),
            signature:               String::new(),
            confirmation_id:         random_confirmation_id(),
            answers,
        };
        if !form.is_open() {
            response.signature = self.wallet.sign(&response.signing_message()).await?;
        }
        response.validate_against(&form)?;

        let sealed = EncryptedResponse::seal(&response, &form.public_key)?;
        publish(self.transport.as_ref(), &Envelope::FormResponse(sealed)).await?;

        self.repository.insert_response(response.clone()).await?;
        if self.repository.role(&form.id) != Some(Role::Creator) {
            self.repository.tag(&form.id, Role::Participated)?;
        }
        tracing::info!(form = %form.id, "Submitted response");
        Ok(response)
    }

    /// Set (or clear) the form the user is looking at.
    pub async fn navigate_to(&mut self, form_id: Option<String>) -> Result<(), EngineError> {
        self.current_form = form_id.clone();
        let Some(id) = form_id else {
            return Ok(());
        };
        self.admit_from_history(&id).await?;
        if self.repository.role(&id) == Some(Role::Accessible) {
            self.repository.tag(&id, Role::Viewed)?;
        }
        Ok(())
    }

    /// Remember `form_id` as explicitly granted, so its open form is kept
    /// whenever it shows up.
    pub async fn grant_access(&mut self, form_id: String) -> Result<(), EngineError> {
        self.granted.insert(form_id.clone());
        self.admit_from_history(&form_id).await
    }

    /// A form declined before it was referenced is still in local history.
    async fn admit_from_history(&mut self, form_id: &str) -> Result<(), EngineError> {
        if self.state != EngineState::Ready || self.repository.contains(form_id) {
            return Ok(());
        }
        let history = self.transport.replay_local(CHANNEL).await?;
        for bytes in history {
            self.dispatch(&bytes).await;
        }
        Ok(())
    }

    /// A held form, with its private key attached if this node created it.
    pub fn form(&self, form_id: &str) -> Option<Form> {
        let mut form = self.repository.get_form(form_id)?.clone();
        if let Ok(key) = self.keys.load(form_id) {
            form.private_key = key.to_string();
        }
        Some(form)
    }

    /// Held forms, newest first, without private keys.
    pub fn forms(&self, role: Option<Role>) -> Vec<Form> {
        let forms = match role {
            Some(role) => self.repository.list_by_role(role),
            None => self.repository.list_all(),
        };
        forms.into_iter().map(Form::for_publication).collect()
    }
}

// ============================================================================
// Outbound
// ============================================================================

/// Takes the transport alone so no borrow of the engine spans the await.
async fn publish(transport: &dyn Transport, envelope: &Envelope) -> Result<(), EngineError> {
    let bytes = envelope.to_bytes()?;
    transport.publish(CHANNEL, bytes).await?;
    tracing::debug!(kind = %envelope.kind(), "Published");
    Ok(())
}

/// Resolves once shutdown is signalled or its sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Run `work` unless shutdown comes first; true means it was cut short.
async fn interrupted(shutdown: &mut watch::Receiver<bool>, work: impl Future<Output = ()>) -> bool {
    tokio::select! {
        _ = work => false,
        _ = shutdown_requested(shutdown) => true,
    }
}

async fn next_message(subscription: &mut Option<Subscription>) -> Option<Vec<u8>> {
    match subscription {
        Some(sub) => sub.next().await,
        None => std::future::pending().await,
    }
}

// ============================================================================
// Tests
// ============================================================================
