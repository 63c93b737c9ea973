//! replayable pass sequences.
//!
//! a plan is written as comma-separated steps, each optionally repeated with `*count`:
//!
//! ```text
//! no-jcc, variation*20, junk*5, order:50, vector, encrypt
//! ```
use crate::error::{Error, Result};
use crate::session::ObfuscationSession;
use log::{debug, warn};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    NoJcc,
    Variation,
    Junk,
    /// block reordering at the given intensity.
    Order(u8),
    Vector,
    Encrypt,
}

impl Step {
    fn run(self, session: &mut ObfuscationSession) -> Result<bool> {
        match self {
            Step::NoJcc => session.no_jcc(),
            Step::Variation => session.equivalent_variation(),
            Step::Junk => session.local_obf(),
            Step::Order(intensity) => session.out_of_order(intensity),
            Step::Vector => session.vector_jmp(),
            Step::Encrypt => session.encrypt_jcc(),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::NoJcc => f.write_str("no-jcc"),
            Step::Variation => f.write_str("variation"),
            Step::Junk => f.write_str("junk"),
            Step::Order(intensity) => write!(f, "order:{}", intensity),
            Step::Vector => f.write_str("vector"),
            Step::Encrypt => f.write_str("encrypt"),
        }
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("unknown step `{0}`")]
    UnknownStep(String),
    #[error("bad intensity in `{0}`, expected order:0..=100")]
    Intensity(String),
    #[error("bad repeat count in `{0}`")]
    Count(String),
    #[error("plan is empty")]
    Empty,
}

impl FromStr for Step {
    type Err = PlanError;

    fn from_str(s: &str) -> std::result::Result<Self, PlanError> {
        match s {
            "no-jcc" => Ok(Step::NoJcc),
            "variation" => Ok(Step::Variation),
            "junk" => Ok(Step::Junk),
            "vector" => Ok(Step::Vector),
            "encrypt" => Ok(Step::Encrypt),
            "order" => Ok(Step::Order(50)),
            _ => match s.strip_prefix("order:") {
                Some(n) => n
                    .parse::<u8>()
                    .ok()
                    .filter(|n| *n <= 100)
                    .map(Step::Order)
                    .ok_or_else(|| PlanError::Intensity(s.to_string())),
                None => Err(PlanError::UnknownStep(s.to_string())),
            },
        }
    }
}

/// an ordered list of pass invocations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    steps: Vec<Step>,
}

impl Plan {
    pub fn new(steps: Vec<Step>) -> Self {
        Plan { steps }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// runs every step in order.
    ///
    /// a step whose pass fails is logged and skipped, the session keeps the graph it had.
    /// anything else (a call in the wrong state) ends the run.
    ///
    /// # returns
    /// the number of steps that changed the graph.
    pub fn run(&self, session: &mut ObfuscationSession) -> Result<usize> {
        let mut changed = 0;
        for (i, step) in self.steps.iter().enumerate() {
            match step.run(session) {
                Ok(true) => changed += 1,
                Ok(false) => debug!("step {} ({}) changed nothing", i, step),
                Err(Error::Pass(err)) => warn!("step {} ({}) skipped: {}", i, step, err),
                Err(err) => return Err(err),
            }
        }
        Ok(changed)
    }
}

impl Default for Plan {
    /// the sequence the reference driver runs.
    fn default() -> Self {
        let mut steps = vec![Step::NoJcc];
        steps.extend([Step::Variation; 20]);
        steps.extend([Step::Junk; 5]);
        for _ in 0..5 {
            steps.push(Step::Order(50));
            steps.push(Step::Vector);
        }
        steps.extend([Step::Order(50); 3]);
        Plan { steps }
    }
}

impl FromStr for Plan {
    type Err = PlanError;

    fn from_str(s: &str) -> std::result::Result<Self, PlanError> {
        let mut steps = Vec::new();
        for item in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let (name, count) = match item.split_once('*') {
                Some((name, count)) => {
                    let count = count
                        .trim()
                        .parse::<usize>()
                        .map_err(|_| PlanError::Count(item.to_string()))?;
                    (name.trim(), count)
                }
                None => (item, 1),
            };
            let step: Step = name.parse()?;
            steps.extend(std::iter::repeat(step).take(count));
        }
        if steps.is_empty() {
            return Err(PlanError::Empty);
        }
        Ok(Plan { steps })
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // runs of the same step collapse into `step*count`
        let mut first = true;
        let mut i = 0;
        while i < self.steps.len() {
            let step = self.steps[i];
            let run = self.steps[i..].iter().take_while(|s| **s == step).count();
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            if run > 1 {
                write!(f, "{}*{}", step, run)?;
            } else {
                write!(f, "{}", step)?;
            }
            i += run;
        }
        Ok(())
    }
}
