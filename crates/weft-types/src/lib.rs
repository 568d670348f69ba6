//! Foundation types for Weft.
//!
//! This crate provides the identifier, placement and status types shared by
//! every other Weft crate.
//!
//! # Key Types
//!
//! - [`ObjectId`]: opaque 128-bit store identifier embedding kind and class tags
//! - [`ObjectKind`]: the closed set of object kinds an identifier can name
//! - [`ObjectClass`]: store-defined placement class, resolved by name
//! - [`Status`]: request status: in progress, short-circuited, complete or failed
//! - [`FailureCode`]: the failure taxonomy recorded on a request
//! - [`TaskError`]: the result of a single engine task

pub mod class;
pub mod error;
pub mod object;
pub mod status;

pub use class::{ClassResolver, ObjectClass, ObjectFeatures};
pub use error::{TypeError, TypeResult};
pub use object::{ObjectId, ObjectKind};
pub use status::{FailureCode, Status, TaskError, TaskResult, REMOTE_FAILURE_THRESHOLD};
