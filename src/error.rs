//! error taxonomy of the engine. every fallible step returns one of these; the session also keeps
//! the rendered message of the last failure for callers that only want a description.
use crate::addr::{AddrRange, OrigAddr};
use crate::cfg::BlockId;
use crate::ledger::{RelocTarget, Site};
use crate::session::SessionState;
use thiserror::Error;

/// the source image could not be loaded.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("failed to read image: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed image: {0}")]
    Malformed(String),
    #[error("unsupported image: {0}")]
    Unsupported(&'static str),
}

impl From<goblin::error::Error> for InitError {
    fn from(err: goblin::error::Error) -> Self {
        InitError::Malformed(err.to_string())
    }
}

/// the designated range is not a clean instruction stream.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid opcode at {0}")]
    InvalidOpcode(OrigAddr),
    #[error("instruction at {0} runs past the end of the range")]
    TruncatedInstruction(OrigAddr),
    #[error("unsupported instruction `{text}` at {at}")]
    Unsupported { at: OrigAddr, text: String },
    #[error("range {range} spans {expected} bytes but {actual} were supplied")]
    LengthMismatch {
        range: AddrRange,
        expected: usize,
        actual: usize,
    },
}

/// the control-flow model is missing something it cannot do without.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("no entry point can be established for {0}")]
    UnresolvedEntry(AddrRange),
    #[error("block {0} is referenced but not part of the graph")]
    DanglingBlock(BlockId),
    #[error("block {0} appears more than once in the layout")]
    DuplicateBlock(BlockId),
    #[error("block {0} has no instructions")]
    EmptyBlock(BlockId),
    #[error("block {0} transfers control before its last instruction")]
    EarlyExit(BlockId),
    #[error("block {0} disagrees with its last instruction about falling through")]
    FallthroughMismatch(BlockId),
    #[error("jump table slot {0} is not owned by exactly one vectorized jump")]
    OrphanSlot(u32),
}

/// a transformation could not keep its preservation invariant.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PassError {
    #[error("{pass}: no eligible {what}")]
    NoCandidate {
        pass: &'static str,
        what: &'static str,
    },
    #[error("{pass}: intensity {intensity} is outside 0..=100")]
    Intensity { pass: &'static str, intensity: u8 },
    #[error("{pass}: failed to encode replacement: {message}")]
    Encode {
        pass: &'static str,
        message: String,
    },
    #[error("{pass} left the graph inconsistent: {source}")]
    Inconsistent {
        pass: &'static str,
        #[source]
        source: ModelError,
    },
}

/// a reference could not be resolved at emission time.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelocationError {
    #[error("{site} refers to {target}, which was never placed")]
    DanglingTarget { site: Site, target: RelocTarget },
    #[error("{0} belongs to an owner that was never placed")]
    UnplacedSite(Site),
    #[error("{0} recorded more than once")]
    DuplicateSite(Site),
    #[error("{0} lies outside its owner or the emitted buffer")]
    SiteOutOfBounds(Site),
    #[error("{site} resolves to {target:#x}, outside the emitted buffer")]
    TargetOutOfBounds { site: Site, target: u32 },
    #[error("displacement {value} does not fit the 8-bit field of {site}")]
    Overflow { site: Site, value: i64 },
    #[error("block {0} falls through to a block that does not follow it")]
    BrokenFallthrough(BlockId),
    #[error("failed to encode {what}: {message}")]
    Encode { what: String, message: String },
    #[error("emitted code does not fit the 32-bit address space")]
    AddressSpace,
}

/// crate-level error.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Init(#[from] InitError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Pass(#[from] PassError),
    #[error(transparent)]
    Relocation(#[from] RelocationError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("range {0} is not inside an executable region of the image")]
    OutOfCode(AddrRange),
    #[error("range end {end} precedes its begin {begin}")]
    ReversedRange { begin: OrigAddr, end: OrigAddr },
    #[error("`{op}` is not valid while the session is {state}")]
    State {
        op: &'static str,
        state: SessionState,
    },
    #[error("section name `{0}` is longer than 8 bytes")]
    SectionName(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
