//! Proxy request surface
//!
//! Transport-neutral requests a front end hands to the core, and the
//! dispatcher that serves them. Wire protocols live outside this crate.

pub mod handler;
pub mod request;

pub use handler::{dispatch, handle};
pub use request::{ErrorReply, Operation, Request, Response, ResponseBody, SessionRef};
