/// Mining shares module
///
/// Handles share validation, duplicate detection and block submission

pub mod hasher;
pub mod processor;
pub mod validator;

pub use hasher::{HasherRegistry, ProofOfWorkHasher};
pub use processor::{process_submit, AcceptedShare};
pub use validator::{ShareRejection, Submission};
