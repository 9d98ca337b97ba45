#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Shared data model for `checkmill`: the wire envelope, the job/result
//! records and the option record threaded through the worker processes.

pub mod envelope;
pub mod job;
pub mod options;

pub use envelope::{Codec, EnvelopeError};
pub use job::{CheckResult, CheckType, InvalidJob, Job};
pub use options::Options;
