//! Cloud upload: worker loop, request body, transport and preconditions.

pub mod link;
pub mod net;
pub mod payload;
pub mod snapshot;
pub mod worker;

pub use link::{AlwaysOnline, LinkMonitor, MemInfoProbe, ResourceProbe, SharedLinkState};
pub use net::{HttpNetClient, NetClient, NetError, NetResponse};
pub use snapshot::{FailureKind, UploadDebugSnapshot};
pub use worker::{
    CycleOutcome, Readiness, SkipReason, StartError, UploadConfig, UploaderWorker, WorkerDeps,
    WorkerState,
};
