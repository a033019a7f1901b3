//! OCI runtime implementations.
//!
//! Each runtime handles single-container operations; pod and instance
//! semantics live in the container backend on top of it.

pub mod youki;

pub use self::youki::YoukiRuntime;
