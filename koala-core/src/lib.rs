pub mod classifier;
pub mod collab;
pub mod config;
pub mod decoder;
pub mod error;
pub mod frame;
pub mod http_client;
pub mod model;
pub mod normalizer;
pub mod request;
pub mod stream;
pub mod submit;
pub mod telemetry;

pub use error::{CoreResult, KoalaError};
pub use submit::{Collaborators, GenerationHandle, Orchestrator, Submission, SubmissionError};
