// ABOUTME: Multi-tenant ephemeral sandbox orchestration over a pluggable container engine
// ABOUTME: Template catalog, lifecycle state machine, exec sessions, file transfer and idle reaping

pub mod archive;
pub mod config;
pub mod engine;
pub mod error;
pub mod exec;
pub mod ids;
pub mod idle;
pub mod orchestrator;
pub mod registry;
pub mod state;
pub mod templates;
pub mod transfer;

pub use archive::{ArchiveCodec, ArchiveEntry, ArchiveError, EntryKind, TarCodec};
pub use config::OrchestratorConfig;
pub use engine::{
    CopyProgress, DockerEngine, EngineAdapter, EngineError, EngineHandle, ExecEvent, ExecRequest,
    ExecStream, MemoryEngine, OutputChunk, ProvisionOptions, StreamType,
};
pub use error::{Result, SandboxError};
pub use exec::{
    CollectedOutput, ExecSession, OutputEvent, OutputStream, SessionMultiplexer, SessionState,
};
pub use ids::{SandboxId, SessionId, TransferId};
pub use idle::IdleReaper;
pub use orchestrator::Orchestrator;
pub use registry::{Sandbox, SandboxRegistry, StateChange};
pub use state::SandboxState;
pub use templates::{PortProtocol, PortSpec, RuntimeTemplate, TemplateError, TemplateRegistry};
pub use transfer::{
    FilesystemGateway, ImportReport, TransferDirection, TransferJob, TransferStatus,
};
