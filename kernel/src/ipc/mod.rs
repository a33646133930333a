//! Inter-process communication: synchronous messages and named
//! shared-memory segments.

pub mod message;
pub mod shared_memory;
