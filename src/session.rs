//! the obfuscation session: one image, one designated range at a time.
//!
//! ```text
//! Uninitialized --begin_set--> RangeSet --pass--> Transforming --end_set--> Sealed
//!                                  |                    |                     |
//!                                  +------end_set-------+---> Failed          |
//!                                                               \--begin_set--+--> RangeSet
//! ```
use crate::addr::{AddrRange, NewAddr, OrigAddr};
use crate::cfg::ControlFlowGraph;
use crate::decoder::decode;
use crate::emitter::emit;
use crate::error::{Error, PassError, Result};
use crate::image::{FlatImage, ImageSection, ImageView, PeImage};
use crate::ledger::RelocationLedger;
use crate::passes::{
    EncryptJcc, EquivalentVariation, LocalObf, NoJcc, OutOfOrder, Pass, VectorJmp,
};
use log::{debug, error, info, warn};
use rand::{rngs::StdRng, SeedableRng};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

/// length of the `jmp rel32` written over the start of the range.
pub const ENTRY_PATCH_LEN: usize = 5;

/// longest name a PE section header can hold.
pub const MAX_SECTION_NAME: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    RangeSet,
    Transforming,
    Sealed,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::RangeSet => "range set",
            SessionState::Transforming => "transforming",
            SessionState::Sealed => "sealed",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// drives every random decision; the same seed on the same input gives the same output.
    pub seed: u64,
    /// where the emitted section will be mapped. defaults to the image's next section address.
    pub load_address: Option<NewAddr>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            seed: 42,
            load_address: None,
        }
    }
}

/// `jmp rel32` to be written at `address` in the source image, sending the original entry of
/// the range to its rewritten copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPatch {
    pub address: OrigAddr,
    pub bytes: [u8; ENTRY_PATCH_LEN],
}

impl EntryPatch {
    fn new(address: OrigAddr, entry: NewAddr) -> Self {
        let next = address.get().wrapping_add(ENTRY_PATCH_LEN as u32);
        let rel = entry.get().wrapping_sub(next);
        let mut bytes = [0xe9, 0, 0, 0, 0];
        bytes[1..].copy_from_slice(&rel.to_le_bytes());
        EntryPatch { address, bytes }
    }
}

/// everything an image writer needs once a range is sealed.
#[derive(Debug, Clone)]
pub struct SessionOutput {
    pub buffer: Vec<u8>,
    pub base: NewAddr,
    /// address of the rewritten range entry.
    pub entry: NewAddr,
    pub ledger: RelocationLedger,
    /// `None` when patching the first bytes of the range would clobber a branch target.
    pub entry_patch: Option<EntryPatch>,
}

/// expands the user seed into a full `StdRng` key.
fn whiten(seed: u64) -> StdRng {
    let digest = Sha256::digest(seed.to_le_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    StdRng::from_seed(key)
}

pub struct ObfuscationSession {
    image: Box<dyn ImageView>,
    config: SessionConfig,
    state: SessionState,
    rng: StdRng,
    graph: Option<ControlFlowGraph>,
    /// addresses inside the range that something may jump to.
    landing: Vec<OrigAddr>,
    output: Option<SessionOutput>,
    last_error: Option<String>,
}

impl ObfuscationSession {
    /// opens a PE32 image.
    ///
    /// # example
    /// ```no_run
    /// use xbo::session::{ObfuscationSession, SessionConfig};
    ///
    /// let mut session = ObfuscationSession::init("target.exe", SessionConfig::default())?;
    /// session.begin_set(0x401000, 0x401080)?;
    /// session.no_jcc()?;
    /// session.out_of_order(50)?;
    /// session.end_set()?;
    /// let section = session.section(".obf")?;
    /// # Ok::<(), xbo::error::Error>(())
    /// ```
    pub fn init(path: impl AsRef<Path>, config: SessionConfig) -> Result<Self> {
        let image = PeImage::load(path.as_ref())?;
        info!(
            "loaded {} (image base {:#010x})",
            path.as_ref().display(),
            image.image_base()
        );
        Ok(Self::with_image(Box::new(image), config))
    }

    /// treats the file as raw code mapped at `base`.
    pub fn init_flat(path: impl AsRef<Path>, base: OrigAddr, config: SessionConfig) -> Result<Self> {
        let image = FlatImage::load(path.as_ref(), base)?;
        info!(
            "loaded {} as flat code at {}",
            path.as_ref().display(),
            base
        );
        Ok(Self::with_image(Box::new(image), config))
    }

    pub fn with_image(image: Box<dyn ImageView>, config: SessionConfig) -> Self {
        ObfuscationSession {
            image,
            config,
            state: SessionState::Uninitialized,
            rng: whiten(config.seed),
            graph: None,
            landing: Vec::new(),
            output: None,
            last_error: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// the current model, once a range is set.
    pub fn graph(&self) -> Option<&ControlFlowGraph> {
        self.graph.as_ref()
    }

    /// the source bytes of the current range.
    pub fn original_bytes(&self) -> Option<&[u8]> {
        let range = self.graph.as_ref()?.range();
        self.image.code_bytes(range)
    }

    /// description of the most recent failure.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn fail(&mut self, err: Error) -> Error {
        error!("{}", err);
        self.last_error = Some(err.to_string());
        err
    }

    fn expect_state(&mut self, op: &'static str, allowed: &[SessionState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            let state = self.state;
            Err(self.fail(Error::State { op, state }))
        }
    }

    /// designates `[begin, end)` and builds its control-flow model.
    ///
    /// # arguments
    /// * `begin` - address of the first instruction of the range.
    /// * `end` - address one past the last byte of the range.
    pub fn begin_set(&mut self, begin: u32, end: u32) -> Result<()> {
        self.expect_state(
            "begin_set",
            &[
                SessionState::Uninitialized,
                SessionState::Sealed,
                SessionState::Failed,
            ],
        )?;
        let (begin, end) = (OrigAddr::new(begin), OrigAddr::new(end));
        match self.load_range(begin, end) {
            Ok((graph, landing)) => {
                info!(
                    "range {}: {} blocks, {} instructions",
                    graph.range(),
                    graph.blocks().len(),
                    graph.insn_count()
                );
                self.graph = Some(graph);
                self.landing = landing;
                self.output = None;
                self.state = SessionState::RangeSet;
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    fn load_range(&self, begin: OrigAddr, end: OrigAddr) -> Result<(ControlFlowGraph, Vec<OrigAddr>)> {
        let range = AddrRange::new(begin, end).ok_or(Error::ReversedRange { begin, end })?;
        let bytes = self
            .image
            .code_bytes(range)
            .ok_or(Error::OutOfCode(range))?;
        let insns = decode(bytes, range)?;
        let graph = ControlFlowGraph::build(&insns, range)?;
        graph.validate()?;

        let mut landing: Vec<OrigAddr> = graph.blocks().iter().filter_map(|b| b.origin).collect();
        landing.extend(
            insns
                .iter()
                .filter_map(|i| i.branch.as_ref().map(|b| b.target))
                .filter(|t| range.contains(*t)),
        );
        landing.sort_unstable();
        landing.dedup();
        Ok((graph, landing))
    }

    /// runs `pass` on a copy of the graph and keeps the copy only if the pass succeeds and the
    /// result validates.
    ///
    /// # returns
    /// whether the pass changed anything.
    pub fn run_pass(&mut self, pass: &dyn Pass) -> Result<bool> {
        self.expect_state(
            pass.name(),
            &[SessionState::RangeSet, SessionState::Transforming],
        )?;
        let Some(current) = self.graph.as_ref() else {
            let state = self.state;
            return Err(self.fail(Error::State {
                op: pass.name(),
                state,
            }));
        };

        let mut candidate = current.clone();
        let outcome = pass
            .apply(&mut candidate, &mut self.rng)
            .map_err(Error::from)
            .and_then(|changed| {
                candidate.validate().map_err(|source| {
                    Error::Pass(PassError::Inconsistent {
                        pass: pass.name(),
                        source,
                    })
                })?;
                Ok(changed)
            });

        match outcome {
            Ok(changed) => {
                debug!(
                    "{} done: {} blocks, {} instructions, {} table slots",
                    pass.name(),
                    candidate.blocks().len(),
                    candidate.insn_count(),
                    candidate.table().len()
                );
                self.graph = Some(candidate);
                self.state = SessionState::Transforming;
                Ok(changed)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    pub fn no_jcc(&mut self) -> Result<bool> {
        self.run_pass(&NoJcc)
    }

    pub fn equivalent_variation(&mut self) -> Result<bool> {
        self.run_pass(&EquivalentVariation)
    }

    pub fn local_obf(&mut self) -> Result<bool> {
        self.run_pass(&LocalObf)
    }

    /// # arguments
    /// * `intensity` - 0..=100, share of blocks split and moved.
    pub fn out_of_order(&mut self, intensity: u8) -> Result<bool> {
        self.run_pass(&OutOfOrder::new(intensity))
    }

    pub fn vector_jmp(&mut self) -> Result<bool> {
        self.run_pass(&VectorJmp)
    }

    pub fn encrypt_jcc(&mut self) -> Result<bool> {
        self.run_pass(&EncryptJcc)
    }

    /// sets where the emitted section will be mapped. takes effect at the next `end_set`.
    pub fn set_load_address(&mut self, address: u32) {
        self.config.load_address = Some(NewAddr::new(address));
    }

    /// emits the current graph and seals the range.
    pub fn end_set(&mut self) -> Result<()> {
        self.expect_state(
            "end_set",
            &[SessionState::RangeSet, SessionState::Transforming],
        )?;
        let Some(graph) = self.graph.as_ref() else {
            let state = self.state;
            return Err(self.fail(Error::State {
                op: "end_set",
                state,
            }));
        };
        let base = self
            .config
            .load_address
            .unwrap_or_else(|| self.image.next_section_address());

        let emission = match emit(graph, base) {
            Ok(emission) => emission,
            Err(err) => {
                self.state = SessionState::Failed;
                return Err(self.fail(err.into()));
            }
        };

        let range = graph.range();
        let entry_patch = self.entry_patch(range, emission.entry);
        info!(
            "sealed {}: {} -> {} bytes at {}, entry {}",
            range,
            range.len(),
            emission.buffer.len(),
            base,
            emission.entry
        );
        self.output = Some(SessionOutput {
            buffer: emission.buffer,
            base,
            entry: emission.entry,
            ledger: emission.ledger,
            entry_patch,
        });
        self.state = SessionState::Sealed;
        Ok(())
    }

    fn entry_patch(&self, range: AddrRange, entry: NewAddr) -> Option<EntryPatch> {
        if (range.len() as usize) < ENTRY_PATCH_LEN {
            warn!(
                "{} is shorter than a jmp rel32, entry left unpatched",
                range
            );
            return None;
        }
        let begin = range.begin;
        let blocked = self.landing.iter().find(|addr| {
            addr.offset_from(begin)
                .is_some_and(|off| off > 0 && (off as usize) < ENTRY_PATCH_LEN)
        });
        if let Some(addr) = blocked {
            warn!(
                "{} is a branch target inside the first {} bytes of {}, entry left unpatched",
                addr, ENTRY_PATCH_LEN, range
            );
            return None;
        }
        Some(EntryPatch::new(begin, entry))
    }

    fn sealed(&mut self, op: &'static str) -> Result<&SessionOutput> {
        self.expect_state(op, &[SessionState::Sealed])?;
        match self.output {
            Some(ref output) => Ok(output),
            None => Err(Error::State {
                op,
                state: SessionState::Sealed,
            }),
        }
    }

    pub fn output(&mut self) -> Result<&SessionOutput> {
        self.sealed("output")
    }

    pub fn binary_buffer(&mut self) -> Result<&[u8]> {
        Ok(&self.sealed("binary_buffer")?.buffer)
    }

    pub fn size(&mut self) -> Result<usize> {
        Ok(self.sealed("size")?.buffer.len())
    }

    /// the sealed buffer as a section named `name`, placed at the load address.
    pub fn section(&mut self, name: &str) -> Result<ImageSection> {
        if name.len() > MAX_SECTION_NAME {
            return Err(self.fail(Error::SectionName(name.to_string())));
        }
        let output = self.sealed("section")?;
        Ok(ImageSection {
            name: name.to_string(),
            bytes: output.buffer.clone(),
            virtual_address: output.base,
        })
    }
}
