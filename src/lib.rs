//! xbo rewrites a range of ia-32 machine code into an equivalent but harder to read instruction
//! stream, emitted as a new section of the image.
//!
//! the pipeline is decode -> control-flow model -> passes -> emit, driven through an
//! [`ObfuscationSession`](session::ObfuscationSession).
pub mod addr;
pub mod cfg;
pub mod cipher;
pub mod decoder;
pub mod emitter;
pub mod error;
pub mod image;
pub mod ledger;
pub mod liveness;
pub mod passes;
pub mod plan;
pub mod session;

#[cfg(test)]
mod emu;

pub use error::{Error, Result};
pub use plan::Plan;
pub use session::{ObfuscationSession, SessionConfig, SessionOutput};
