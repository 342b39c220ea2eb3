//! Service facade over the persona store.
//!
//! [`PersonaService`] exposes every record operation as an async method and
//! routes all writes through [`PersonaStore::consistent_write_access`].
//!
//! For callers on the other side of a message channel, requests and
//! responses are plain serde enums. [`PersonaService::spawn`] runs a command
//! loop fed by a bounded mpsc channel; each command carries a oneshot sender
//! for its reply, and commands are processed one at a time, so write
//! transactions from the channel never overlap.

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{PersonaDbConfig, DEFAULT_SERVICE_QUEUE_CAPACITY};
use crate::error::{PersonaError, PersonaResult};
use crate::events::EventBus;
use crate::identifier::{PersonaIdentifier, ProfileIdentifier};
use crate::storage::{CheckMode, ConsistencyReport, DeleteConfirmation, Diagnosis, PersonaStore};
use crate::types::{
    LinkedProfileDetails, MergePolicy, PersonaRecord, PersonaRecordUpdate, ProfileRecord,
    ProfileRecordUpdate,
};

// ═══════════════════════════════════════════════════════════════════════════
// Wire types
// ═══════════════════════════════════════════════════════════════════════════

/// A request to the persona service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum PersonaRequest {
    CreatePersona {
        record: PersonaRecord,
    },
    QueryPersona {
        identifier: PersonaIdentifier,
    },
    /// All personas
    QueryPersonas,
    QueryPersonasWithPrivateKey,
    QueryPersonaByProfile {
        profile: ProfileIdentifier,
    },
    UpdatePersona {
        update: PersonaRecordUpdate,
        policy: MergePolicy,
    },
    CreateOrUpdatePersona {
        update: PersonaRecordUpdate,
        policy: MergePolicy,
    },
    DeletePersona {
        identifier: PersonaIdentifier,
        confirmation: DeleteConfirmation,
    },
    SafeDeletePersona {
        identifier: PersonaIdentifier,
    },
    CreateProfile {
        record: ProfileRecord,
    },
    QueryProfile {
        identifier: ProfileIdentifier,
    },
    /// All profiles, or those on one network
    QueryProfiles {
        #[serde(default)]
        network: Option<String>,
    },
    UpdateProfile {
        update: ProfileRecordUpdate,
    },
    CreateOrUpdateProfile {
        update: ProfileRecordUpdate,
    },
    DeleteProfile {
        identifier: ProfileIdentifier,
    },
    AttachProfile {
        profile: ProfileIdentifier,
        persona: PersonaIdentifier,
        #[serde(default)]
        details: LinkedProfileDetails,
    },
    DetachProfile {
        profile: ProfileIdentifier,
    },
    Diagnose,
    CheckConsistency {
        mode: CheckMode,
    },
}

/// Reply to a [`PersonaRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", content = "data", rename_all = "snake_case")]
pub enum PersonaResponse {
    Done,
    Persona(Option<PersonaRecord>),
    Personas(Vec<PersonaRecord>),
    Profile(Option<ProfileRecord>),
    Profiles(Vec<ProfileRecord>),
    /// Whether the record is gone
    Deleted(bool),
    Diagnoses(Vec<Diagnosis>),
    Report(ConsistencyReport),
    Error { message: String },
}

impl PersonaResponse {
    pub fn is_error(&self) -> bool {
        matches!(self, PersonaResponse::Error { .. })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// PersonaService
// ═══════════════════════════════════════════════════════════════════════════

/// Async facade over a [`PersonaStore`]
#[derive(Debug, Clone)]
pub struct PersonaService {
    store: PersonaStore,
    queue_capacity: usize,
}

impl PersonaService {
    pub fn new(store: PersonaStore) -> Self {
        Self {
            store,
            queue_capacity: DEFAULT_SERVICE_QUEUE_CAPACITY,
        }
    }

    /// Open the store described by `config` with a fresh event bus.
    pub fn open(config: &PersonaDbConfig) -> PersonaResult<Self> {
        let bus = EventBus::with_capacity(config.event_channel_capacity);
        let store = PersonaStore::open(config, bus)?;
        Ok(Self::new(store).with_queue_capacity(config.service_queue_capacity))
    }

    /// Depth of the command queue used by [`spawn`](Self::spawn)
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn store(&self) -> &PersonaStore {
        &self.store
    }

    pub fn bus(&self) -> &EventBus {
        self.store.bus()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Personas
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn create_persona(&self, record: PersonaRecord) -> PersonaResult<()> {
        self.store
            .consistent_write_access(|tx| tx.create_persona(record))
    }

    pub async fn query_persona(&self, id: &PersonaIdentifier) -> PersonaResult<Option<PersonaRecord>> {
        self.store.query_persona(id)
    }

    pub async fn query_personas(
        &self,
        predicate: impl FnMut(&PersonaRecord) -> bool,
    ) -> PersonaResult<Vec<PersonaRecord>> {
        self.store.query_personas(predicate)
    }

    pub async fn query_personas_with_private_key(&self) -> PersonaResult<Vec<PersonaRecord>> {
        self.store.query_personas_with_private_key()
    }

    pub async fn query_persona_by_profile(
        &self,
        profile: &ProfileIdentifier,
    ) -> PersonaResult<Option<PersonaRecord>> {
        self.store.query_persona_by_profile(profile)
    }

    pub async fn update_persona(
        &self,
        update: PersonaRecordUpdate,
        policy: MergePolicy,
    ) -> PersonaResult<PersonaRecord> {
        self.store
            .consistent_write_access(|tx| tx.update_persona(update, policy))
    }

    pub async fn create_or_update_persona(
        &self,
        update: PersonaRecordUpdate,
        policy: MergePolicy,
    ) -> PersonaResult<PersonaRecord> {
        self.store
            .consistent_write_access(|tx| tx.create_or_update_persona(update, policy))
    }

    pub async fn delete_persona(
        &self,
        id: &PersonaIdentifier,
        confirmation: DeleteConfirmation,
    ) -> PersonaResult<()> {
        self.store
            .consistent_write_access(|tx| tx.delete_persona(id, confirmation))
    }

    pub async fn safe_delete_persona(&self, id: &PersonaIdentifier) -> PersonaResult<bool> {
        self.store
            .consistent_write_access(|tx| tx.safe_delete_persona(id))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Profiles
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn create_profile(&self, record: ProfileRecord) -> PersonaResult<()> {
        self.store
            .consistent_write_access(|tx| tx.create_profile(record))
    }

    pub async fn query_profile(&self, id: &ProfileIdentifier) -> PersonaResult<Option<ProfileRecord>> {
        self.store.query_profile(id)
    }

    pub async fn query_profiles(
        &self,
        predicate: impl FnMut(&ProfileRecord) -> bool,
    ) -> PersonaResult<Vec<ProfileRecord>> {
        self.store.query_profiles(predicate)
    }

    pub async fn query_profiles_by_network(&self, network: &str) -> PersonaResult<Vec<ProfileRecord>> {
        self.store.query_profiles_by_network(network)
    }

    pub async fn update_profile(&self, update: ProfileRecordUpdate) -> PersonaResult<ProfileRecord> {
        self.store
            .consistent_write_access(|tx| tx.update_profile(update))
    }

    pub async fn create_or_update_profile(
        &self,
        update: ProfileRecordUpdate,
    ) -> PersonaResult<ProfileRecord> {
        self.store
            .consistent_write_access(|tx| tx.create_or_update_profile(update))
    }

    pub async fn delete_profile(&self, id: &ProfileIdentifier) -> PersonaResult<Option<ProfileRecord>> {
        self.store
            .consistent_write_access(|tx| tx.delete_profile(id))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Links and checks
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn attach_profile(
        &self,
        profile: &ProfileIdentifier,
        persona: &PersonaIdentifier,
        details: LinkedProfileDetails,
    ) -> PersonaResult<()> {
        self.store
            .consistent_write_access(|tx| tx.attach_profile(profile, persona, details))
    }

    pub async fn detach_profile(&self, profile: &ProfileIdentifier) -> PersonaResult<()> {
        self.store
            .consistent_write_access(|tx| tx.detach_profile(profile))
    }

    pub async fn diagnose(&self) -> PersonaResult<Vec<Diagnosis>> {
        self.store.diagnose()
    }

    pub async fn check_consistency(&self, mode: CheckMode) -> PersonaResult<ConsistencyReport> {
        self.store.check_consistency(mode)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Request handling
    // ═══════════════════════════════════════════════════════════════════════

    /// Run one request. Errors become [`PersonaResponse::Error`].
    pub async fn handle(&self, request: PersonaRequest) -> PersonaResponse {
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(e) => {
                debug!(error = %e, "Request failed");
                PersonaResponse::Error {
                    message: e.to_string(),
                }
            }
        }
    }

    async fn dispatch(&self, request: PersonaRequest) -> PersonaResult<PersonaResponse> {
        use PersonaRequest as R;
        use PersonaResponse as Out;

        Ok(match request {
            R::CreatePersona { record } => {
                self.create_persona(record).await?;
                Out::Done
            }
            R::QueryPersona { identifier } => Out::Persona(self.query_persona(&identifier).await?),
            R::QueryPersonas => Out::Personas(self.query_personas(|_| true).await?),
            R::QueryPersonasWithPrivateKey => {
                Out::Personas(self.query_personas_with_private_key().await?)
            }
            R::QueryPersonaByProfile { profile } => {
                Out::Persona(self.query_persona_by_profile(&profile).await?)
            }
            R::UpdatePersona { update, policy } => {
                Out::Persona(Some(self.update_persona(update, policy).await?))
            }
            R::CreateOrUpdatePersona { update, policy } => {
                Out::Persona(Some(self.create_or_update_persona(update, policy).await?))
            }
            R::DeletePersona {
                identifier,
                confirmation,
            } => {
                self.delete_persona(&identifier, confirmation).await?;
                Out::Done
            }
            R::SafeDeletePersona { identifier } => {
                Out::Deleted(self.safe_delete_persona(&identifier).await?)
            }
            R::CreateProfile { record } => {
                self.create_profile(record).await?;
                Out::Done
            }
            R::QueryProfile { identifier } => Out::Profile(self.query_profile(&identifier).await?),
            R::QueryProfiles { network: None } => Out::Profiles(self.query_profiles(|_| true).await?),
            R::QueryProfiles {
                network: Some(network),
            } => Out::Profiles(self.query_profiles_by_network(&network).await?),
            R::UpdateProfile { update } => Out::Profile(Some(self.update_profile(update).await?)),
            R::CreateOrUpdateProfile { update } => {
                Out::Profile(Some(self.create_or_update_profile(update).await?))
            }
            R::DeleteProfile { identifier } => Out::Profile(self.delete_profile(&identifier).await?),
            R::AttachProfile {
                profile,
                persona,
                details,
            } => {
                self.attach_profile(&profile, &persona, details).await?;
                Out::Done
            }
            R::DetachProfile { profile } => {
                self.detach_profile(&profile).await?;
                Out::Done
            }
            R::Diagnose => Out::Diagnoses(self.diagnose().await?),
            R::CheckConsistency { mode } => Out::Report(self.check_consistency(mode).await?),
        })
    }

    /// [`handle`](Self::handle) for transports that carry JSON text.
    pub async fn handle_json(&self, request: &str) -> String {
        let response = match serde_json::from_str::<PersonaRequest>(request) {
            Ok(request) => self.handle(request).await,
            Err(e) => PersonaResponse::Error {
                message: format!("Invalid request: {}", e),
            },
        };
        match serde_json::to_string(&response) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Failed to encode response");
                r#"{"result":"error","data":{"message":"failed to encode response"}}"#.to_string()
            }
        }
    }

    /// Start the command loop and an event dispatcher. Returns the handle
    /// callers use to send requests, and the loop's task.
    pub fn spawn(self) -> (ServiceHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<ServiceCommand>(self.queue_capacity);
        let dispatcher = self.bus().spawn_dispatcher();

        let task = tokio::spawn(async move {
            info!("Persona service started");
            while let Some(command) = rx.recv().await {
                match command {
                    ServiceCommand::Call { request, reply } => {
                        let response = self.handle(request).await;
                        // Caller may have stopped waiting
                        let _ = reply.send(response);
                    }
                    ServiceCommand::Shutdown => break,
                }
            }
            // Deliver whatever the last requests raised
            self.bus().dispatch_pending();
            dispatcher.abort();
            info!("Persona service stopped");
        });

        (ServiceHandle { tx }, task)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Command channel
// ═══════════════════════════════════════════════════════════════════════════

/// Message accepted by the service loop
pub enum ServiceCommand {
    Call {
        request: PersonaRequest,
        reply: oneshot::Sender<PersonaResponse>,
    },
    /// Stop after the commands already queued
    Shutdown,
}

// Manual Debug because oneshot::Sender does not implement Debug.
impl std::fmt::Debug for ServiceCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Call { request, .. } => f
                .debug_struct("Call")
                .field("request", request)
                .finish_non_exhaustive(),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Cloneable sender side of a running [`PersonaService`]
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    tx: mpsc::Sender<ServiceCommand>,
}

impl ServiceHandle {
    /// Send a request and wait for its response.
    pub async fn call(&self, request: PersonaRequest) -> PersonaResult<PersonaResponse> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(ServiceCommand::Call { request, reply })
            .await
            .map_err(|_| PersonaError::ServiceUnavailable("command loop has stopped".to_string()))?;
        response
            .await
            .map_err(|_| PersonaError::ServiceUnavailable("request was dropped".to_string()))
    }

    /// Ask the loop to stop once earlier commands are done.
    pub async fn shutdown(&self) -> PersonaResult<()> {
        self.tx
            .send(ServiceCommand::Shutdown)
            .await
            .map_err(|_| PersonaError::ServiceUnavailable("command loop has stopped".to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
