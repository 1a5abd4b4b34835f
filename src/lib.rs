pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod handoff;
pub mod io_struct;
pub mod logging;
pub mod multimodal;
pub mod output;
pub mod server;
pub mod stage;
pub mod worker;

pub use config::{WorkerArgs, WorkerConfig, WorkerMode};
pub use engine::InferenceEngine;
pub use error::{WorkerError, WorkerResult};
pub use io_struct::{GenerationRequest, RequestEnvelope};
pub use multimodal::transfer::RemoteMemoryConnector;
pub use output::CanonicalOutput;
pub use worker::{WorkerHandler, build_handler};
