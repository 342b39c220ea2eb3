//! PersonaDB Core Library
//!
//! Local store for personas and the social-network profiles they own.
//!
//! ## Overview
//!
//! A persona is a cryptographic identity keyed by its EC public key. A
//! profile is one user account on one network. A profile can be linked to at
//! most one persona, and the link is recorded on both sides. Every write runs
//! in a transaction that checks this two-sided link before it commits, and
//! either repairs what it finds or rejects the write.
//!
//! ## Core Principles
//!
//! - **Typed identifiers**: every key has a canonical text form and parses
//!   back to the same typed value
//! - **Scoped transactions**: a transaction only touches the tables it asked for
//! - **Post-commit events**: change notifications are delivered after the
//!   write is durable, never for a rolled-back write
//!
//! ## Quick Start
//!
//! ```ignore
//! use personadb_core::{
//!     EventBus, LinkedProfileDetails, PersonaDbConfig, PersonaRecord, PersonaStore,
//!     ProfileIdentifier,
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PersonaStore::open(&PersonaDbConfig::in_dir("~/.personadb"), EventBus::new())?;
//!
//!     let persona = PersonaRecord::new(persona_id, public_key);
//!     store.create_persona(persona)?;
//!
//!     let profile = ProfileIdentifier::new("twitter.com", "alice")?;
//!     store.consistent_write_access(|tx| {
//!         tx.attach_profile(&profile, &persona_id, LinkedProfileDetails::default())
//!     })?;
//!
//!     let owner = store.query_persona_by_profile(&profile)?;
//!     println!("{:?}", owner.map(|p| p.identifier));
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod identifier;
pub mod service;
pub mod storage;
pub mod types;

// Re-exports
pub use config::PersonaDbConfig;
pub use error::{PersonaError, PersonaResult};
pub use events::{ChangeReason, EventBus, EventName, PersonaEvent, ProfileChange, SubscriptionId};
pub use identifier::{
    EcKeyIdentifier, GroupIdentifier, Identifier, IdentifierMap, IdentifierType,
    PersonaIdentifier, PostIdentifier, ProfileIdentifier, TypedIdentifier,
};
pub use service::{PersonaRequest, PersonaResponse, PersonaService, ServiceHandle};
pub use storage::{
    CheckMode, ConsistencyReport, DeleteConfirmation, Diagnosis, ObjectStore, PersonaStore,
    StoreAccess, Transaction,
};
pub use types::*;
