// Copyright 2026 Chartsync Contributors
// SPDX-License-Identifier: Apache-2.0

//! Chartsync: acquisition and normalization engine for a patient-records
//! portal overlay.
//!
//! The engine observes the portal's own calls, recovers a bearer credential,
//! tracks which subject is being viewed, and fetches every authorized data
//! type into a normalized `{ "records": [...] }` form.

pub mod clock;
pub mod config;
pub mod control;
pub mod credentials;
pub mod error;
pub mod events;
pub mod normalizer;
pub mod observer;
pub mod orchestrator;
pub mod page;
pub mod registry;
pub mod session;
pub mod snapshot;
pub mod store;
pub mod transport;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::HarvestConfig;
pub use control::{dispatch, ControlAck, ControlMessage};
pub use credentials::{CapturedCredential, CredentialExtractor, CredentialSource};
pub use error::{HarvestError, HarvestResult};
pub use events::{BatchCompletion, BatchStatus, EventBus, FetchOutcome, HarvestEvent, OutcomeStatus};
pub use normalizer::{normalize, NormalizedRecordSet, RecordView};
pub use observer::{HookRegistry, NetworkObserver, ObservationAdapter, OutboundRequest};
pub use orchestrator::{BatchPhase, Collaborators, FetchOrchestrator};
pub use page::{HostPage, StaticPage};
pub use registry::{DataType, DataTypeDescriptor, Registry};
pub use session::{compute_fingerprint, has_changed, Invalidation, SessionIdentity};
pub use snapshot::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore};
pub use store::RecordStore;
pub use transport::{ObservedTransport, PortalResponse, PortalTransport, ReqwestTransport};
