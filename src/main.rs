use clap::{Parser, Subcommand, ValueEnum};
use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use xbo::addr::OrigAddr;
use xbo::{ObfuscationSession, Plan, SessionConfig};

#[derive(Parser)]
#[command(name = "xbo", about = "x86 Binary Obfuscator with block shuffling and branch encryption")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Obfuscate a range of x86 code
    Obfuscate {
        /// Input image (PE32, or raw code with --raw-base)
        #[arg(long, required = true)]
        file: PathBuf,
        /// First address of the range (hex)
        #[arg(long, value_parser = parse_address)]
        begin: u32,
        /// Address one past the end of the range (hex)
        #[arg(long, value_parser = parse_address)]
        end: u32,
        /// Treat the file as raw code mapped at this address (hex)
        #[arg(long, value_parser = parse_address)]
        raw_base: Option<u32>,
        /// Address the new section will be mapped at (hex)
        #[arg(long, value_parser = parse_address)]
        load_address: Option<u32>,
        /// Random seed for obfuscation
        #[arg(long, default_value = "42")]
        seed: u64,
        /// Passes to run, e.g. "no-jcc, variation*20, order:50, vector"
        #[arg(long, default_value_t = Plan::default())]
        plan: Plan,
        /// Name of the emitted section
        #[arg(long, default_value = ".obf")]
        section: String,
        /// Where the section bytes are written
        #[arg(long, default_value = "obfuscated.bin")]
        output: PathBuf,
        /// Verbosity level
        #[arg(long, value_enum, default_value_t = Verbosity::Normal)]
        verbosity: Verbosity,
    },
    /// Print the control-flow model of a range
    Cfg {
        /// Input image (PE32, or raw code with --raw-base)
        #[arg(long, required = true)]
        file: PathBuf,
        #[arg(long, value_parser = parse_address)]
        begin: u32,
        #[arg(long, value_parser = parse_address)]
        end: u32,
        #[arg(long, value_parser = parse_address)]
        raw_base: Option<u32>,
        /// Passes to run before printing
        #[arg(long)]
        plan: Option<Plan>,
        #[arg(long, default_value = "42")]
        seed: u64,
        #[arg(long, value_enum, default_value_t = Verbosity::Normal)]
        verbosity: Verbosity,
    },
}

#[derive(ValueEnum, Clone, Copy, PartialEq)]
enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

/// hex address, with or without `0x`.
fn parse_address(s: &str) -> Result<u32, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(digits, 16).map_err(|e| format!("invalid address `{}`: {}", s, e))
}

fn init_logging(verbosity: Verbosity) {
    match verbosity {
        Verbosity::Quiet => std::env::set_var("RUST_LOG", "error"),
        Verbosity::Normal => std::env::set_var("RUST_LOG", "info"),
        Verbosity::Verbose => std::env::set_var("RUST_LOG", "debug"),
    }
    env_logger::init();
}

fn open(file: &Path, raw_base: Option<u32>, seed: u64) -> anyhow::Result<ObfuscationSession> {
    let config = SessionConfig {
        seed,
        ..Default::default()
    };
    info!("Reading image from file: {:?}", file);
    let session = match raw_base {
        Some(base) => ObfuscationSession::init_flat(file, OrigAddr::new(base), config)?,
        None => ObfuscationSession::init(file, config)?,
    };
    Ok(session)
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Obfuscate {
            file,
            begin,
            end,
            raw_base,
            load_address,
            seed,
            plan,
            section,
            output,
            verbosity,
        } => {
            init_logging(verbosity);
            info!("Starting x86 Binary Obfuscator");

            let mut session = open(&file, raw_base, seed)?;
            if let Some(address) = load_address {
                session.set_load_address(address);
            }
            session.begin_set(begin, end)?;
            let original = session.original_bytes().map(<[u8]>::to_vec).unwrap_or_default();

            info!("Running plan: {}", plan);
            let changed = plan.run(&mut session)?;
            info!("{} of {} steps changed the code", changed, plan.steps().len());
            session.end_set()?;

            let sealed = session.output()?.clone();
            let image_section = session.section(&section)?;

            if verbosity == Verbosity::Verbose {
                debug!("Original code: {}", hex::encode(&original));
                debug!("Obfuscated code: {}", hex::encode(&sealed.buffer));
                debug!(
                    "Code length increase: {:.1}%",
                    ((sealed.buffer.len() as f64 / original.len().max(1) as f64) - 1.0) * 100.0
                );
                debug!(
                    "Output sha256: {}",
                    hex::encode(Sha256::digest(&sealed.buffer))
                );
                debug!("{} relocation sites resolved", sealed.ledger.entries().len());
            } else {
                info!(
                    "Obfuscation complete. Output length: {} bytes",
                    sealed.buffer.len()
                );
            }

            info!("Section {}, entry {}", image_section, sealed.entry);
            match sealed.entry_patch {
                Some(patch) => info!(
                    "Entry patch: write {} at {}",
                    hex::encode(patch.bytes),
                    patch.address
                ),
                None => warn!("No entry patch, the range is not reachable from its old entry"),
            }

            std::fs::write(&output, &image_section.bytes)?;
            info!("Obfuscated section saved to {:?}", output);
        }
        Commands::Cfg {
            file,
            begin,
            end,
            raw_base,
            plan,
            seed,
            verbosity,
        } => {
            init_logging(verbosity);
            let mut session = open(&file, raw_base, seed)?;
            session.begin_set(begin, end)?;
            if let Some(plan) = plan {
                plan.run(&mut session)?;
            }
            if let Some(graph) = session.graph() {
                println!("{}", graph);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use proptest::prelude::*;

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0x401000"), Ok(0x401000));
        assert_eq!(parse_address("401000"), Ok(0x401000));
        assert_eq!(parse_address("0XFFFFFFFF"), Ok(u32::MAX));
        assert!(parse_address("0x1_0000_0000").is_err());
        assert!(parse_address("zz").is_err());
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_obfuscate_arguments() {
        let cli = Cli::try_parse_from([
            "xbo",
            "obfuscate",
            "--file",
            "a.exe",
            "--begin",
            "0x401000",
            "--end",
            "0x401080",
            "--plan",
            "no-jcc,order:30*2",
        ])
        .unwrap();
        match cli.command {
            Commands::Obfuscate {
                begin,
                end,
                plan,
                seed,
                section,
                ..
            } => {
                assert_eq!((begin, end), (0x401000, 0x401080));
                assert_eq!(plan.steps().len(), 3);
                assert_eq!(seed, 42);
                assert_eq!(section, ".obf");
            }
            Commands::Cfg { .. } => panic!("parsed the wrong subcommand"),
        }
    }

    #[test]
    fn test_rejects_bad_plan() {
        assert!(Cli::try_parse_from([
            "xbo", "cfg", "--file", "a.exe", "--begin", "0", "--end", "10", "--plan", "shuffle",
        ])
        .is_err());
    }

    proptest! {
        #[test]
        fn fuzz_address_parsing_round_trips(addr in any::<u32>()) {
            prop_assert_eq!(parse_address(&format!("{:#x}", addr)), Ok(addr));
            prop_assert_eq!(parse_address(&format!("{:08x}", addr)), Ok(addr));
        }
    }
}
