//! `sm`: assemble, run and disassemble stack machine programs.
//!
//! Only argument parsing, logger setup and diagnostics live here; the
//! machine, assembler and listing come from `stack_machine`.

#![forbid(unsafe_code)]

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, anyhow, bail};
use clap::{ArgAction, Args, Parser, Subcommand};
use log::{debug, info};

use stack_machine::disassembler::write_listing;
use stack_machine::machine::DEFAULT_MEMORY_SIZE;
use stack_machine::{Assembler, AssemblerError, Machine, MachineConfig, Opcode, Tokenizer, Word};

/// Path meaning standard input.
const STDIN: &str = "-";
const IMAGE_EXTENSION: &str = "sm";
/// Image written when the source came from standard input.
const STDIN_IMAGE: &str = "out.sm";

#[derive(Debug, Parser)]
#[command(name = "sm", version, about = "Stack machine assembler, runner and disassembler", long_about = None)]
struct Opt {
    /// More log output (-v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short = 'q', long = "quiet", action = ArgAction::SetTrue, global = true)]
    quiet: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Clone, Copy, Args)]
struct MemoryOpt {
    /// Machine memory in words
    #[arg(long = "memory-size", value_name = "WORDS", default_value_t = DEFAULT_MEMORY_SIZE)]
    memory_size: usize,
}

impl MemoryOpt {
    fn config(self) -> Result<MachineConfig> {
        let config = MachineConfig::new(self.memory_size);
        config.validate().map_err(|err| anyhow!("{err}"))?;
        Ok(config)
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Assemble sources into images
    Compile {
        /// Source files (- for stdin)
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        /// Image path; defaults to the source with an `.sm` extension
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        memory: MemoryOpt,
    },

    /// Run images, reading one from stdin when none is given
    Run {
        images: Vec<PathBuf>,
        #[command(flatten)]
        memory: MemoryOpt,
    },

    /// Assemble and run sources without writing an image
    Go {
        #[arg(required = true)]
        sources: Vec<PathBuf>,
        #[command(flatten)]
        memory: MemoryOpt,
    },

    /// Print a listing of each image
    Disasm {
        #[arg(required = true)]
        images: Vec<PathBuf>,
        #[command(flatten)]
        memory: MemoryOpt,
    },

    /// Print the instruction table
    Opcodes,
}

fn init_logger(verbose: u8, quiet: bool) {
    let level = if quiet {
        "error"
    } else {
        match verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    // RUST_LOG still wins over the flags.
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .try_init();
}

fn main() -> ExitCode {
    if let Err(e) = real_main() {
        eprintln!("error: {e:#}");
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn real_main() -> Result<()> {
    let opt = Opt::parse();
    init_logger(opt.verbose, opt.quiet);
    debug!("{opt:?}");

    match opt.cmd {
        Command::Compile {
            inputs,
            output,
            memory,
        } => {
            if output.is_some() && inputs.len() > 1 {
                bail!("--output needs exactly one input");
            }
            let config = memory.config()?;
            for input in &inputs {
                let target = output.clone().unwrap_or_else(|| default_output(input));
                compile(input, &target, config)?;
            }
        }
        Command::Run { images, memory } => {
            let config = memory.config()?;
            if images.is_empty() {
                run_image(Path::new(STDIN), config)?;
            }
            for image in &images {
                run_image(image, config)?;
            }
        }
        Command::Go { sources, memory } => {
            let config = memory.config()?;
            for source in &sources {
                let mut machine = assemble(source, config)?;
                execute(&display_name(source), &mut machine)?;
            }
        }
        Command::Disasm { images, memory } => {
            let config = memory.config()?;
            let stdout = io::stdout();
            let mut out = stdout.lock();
            for image in &images {
                disasm(image, config, &mut out)?;
            }
        }
        Command::Opcodes => {
            write_opcodes(&mut io::stdout().lock()).context("writing opcode table")?;
        }
    }
    Ok(())
}

fn is_stdin(path: &Path) -> bool {
    path == Path::new(STDIN)
}

fn display_name(path: &Path) -> String {
    if is_stdin(path) {
        "<stdin>".to_owned()
    } else {
        path.display().to_string()
    }
}

fn default_output(input: &Path) -> PathBuf {
    if is_stdin(input) {
        PathBuf::from(STDIN_IMAGE)
    } else {
        input.with_extension(IMAGE_EXTENSION)
    }
}

fn read_input(path: &Path) -> Result<Vec<u8>> {
    if is_stdin(path) {
        let mut bytes = Vec::new();
        io::stdin()
            .read_to_end(&mut bytes)
            .context("reading stdin")?;
        return Ok(bytes);
    }
    fs::read(path).with_context(|| format!("reading {}", path.display()))
}

/// `file:line: message`, the way compilers report.
fn diagnostic(file: &str, err: &AssemblerError) -> anyhow::Error {
    match err.line_number() {
        Some(line) => anyhow!("{file}:{line}: {}", err.error_kind()),
        None => anyhow!("{file}: {}", err.error_kind()),
    }
}

fn assemble(path: &Path, config: MachineConfig) -> Result<Machine<'static>> {
    let name = display_name(path);
    let source = read_input(path)?;
    let machine = Machine::new(config).map_err(|err| anyhow!("{err}"))?;

    let mut assembler = Assembler::new(machine);
    assembler
        .assemble(&mut Tokenizer::new(source.as_slice()))
        .map_err(|err| diagnostic(&name, &err))?;
    info!(
        "{name}: {} words, {} labels",
        assembler.machine().program_len(),
        assembler.labels().len()
    );
    Ok(assembler.into_machine())
}

fn compile(input: &Path, output: &Path, config: MachineConfig) -> Result<()> {
    if input == output {
        bail!("refusing to overwrite source {}", input.display());
    }
    let machine = assemble(input, config)?;
    let mut file =
        fs::File::create(output).with_context(|| format!("creating {}", output.display()))?;
    let words = machine
        .save_image(&mut file)
        .map_err(|err| anyhow!("{}: {err}", output.display()))?;
    info!("wrote {words} words to {}", output.display());
    Ok(())
}

fn load(path: &Path, machine: &mut Machine<'_>) -> Result<()> {
    let name = display_name(path);
    let bytes = read_input(path)?;
    let words = machine
        .load_image_bytes(&bytes)
        .map_err(|err| anyhow!("{name}: {err}"))?;
    debug!("{name}: loaded {words} words");
    Ok(())
}

fn run_image(path: &Path, config: MachineConfig) -> Result<()> {
    let mut machine = Machine::new(config).map_err(|err| anyhow!("{err}"))?;
    load(path, &mut machine)?;
    execute(&display_name(path), &mut machine)
}

fn execute(name: &str, machine: &mut Machine<'_>) -> Result<()> {
    machine
        .run()
        .map_err(|err| anyhow!("{name}: at {:#x}: {err}", machine.position()))
}

fn disasm(path: &Path, config: MachineConfig, out: &mut impl Write) -> Result<()> {
    let mut machine =
        Machine::with_io(config, io::empty(), io::sink()).map_err(|err| anyhow!("{err}"))?;
    load(path, &mut machine)?;
    writeln!(out, "; File {}", display_name(path))?;
    write_listing(&machine, out).context("writing listing")?;
    Ok(())
}

fn write_opcodes(out: &mut impl Write) -> io::Result<()> {
    for op in Opcode::ALL {
        let operand = if op.has_operand() { " <word>" } else { "" };
        writeln!(out, "{:>3}  {op}{operand}", Word::from(op))?;
    }
    writeln!(out, "; halt: PUSH <address of JMP> JMP")
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;
    use stack_machine::AssemblerErrorKind;

    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Opt::command().debug_assert();
    }

    #[test]
    fn parses_global_flags_after_subcommand() {
        let opt = Opt::try_parse_from(["sm", "run", "-vv", "prog.sm"]).unwrap();
        assert_eq!(opt.verbose, 2);
        assert!(!opt.quiet);
        match opt.cmd {
            Command::Run { images, memory } => {
                assert_eq!(images, [PathBuf::from("prog.sm")]);
                assert_eq!(memory.memory_size, DEFAULT_MEMORY_SIZE);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn compile_requires_input() {
        assert!(Opt::try_parse_from(["sm", "compile"]).is_err());
        let opt = Opt::try_parse_from(["sm", "compile", "--memory-size", "64", "a.s"]).unwrap();
        match opt.cmd {
            Command::Compile { memory, .. } => assert_eq!(memory.memory_size, 64),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn memory_size_is_validated() {
        assert!(MemoryOpt { memory_size: 0 }.config().is_err());
        assert!(MemoryOpt { memory_size: 16 }.config().is_ok());
    }

    #[test]
    fn output_path_follows_input() {
        assert_eq!(default_output(Path::new("fib.s")), PathBuf::from("fib.sm"));
        assert_eq!(default_output(Path::new("dir/hello")), PathBuf::from("dir/hello.sm"));
        assert_eq!(default_output(Path::new("-")), PathBuf::from("out.sm"));
    }

    #[test]
    fn diagnostics_name_file_and_line() {
        let err = AssemblerError::WithLine {
            line: 7,
            kind: AssemblerErrorKind::UnresolvedLabel("LOOP".into()),
        };
        assert_eq!(
            diagnostic("fib.s", &err).to_string(),
            "fib.s:7: code label not found: LOOP"
        );
        let err = AssemblerError::Kind(AssemblerErrorKind::EmptyLabel);
        assert_eq!(diagnostic("<stdin>", &err).to_string(), "<stdin>: empty label");
    }

    #[test]
    fn opcode_table_lists_every_instruction() {
        let mut out = Vec::new();
        write_opcodes(&mut out).unwrap();
        let table = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), Opcode::ALL.len() + 1);
        assert_eq!(lines[0], "  0  NOP");
        assert_eq!(lines[13], " 13  PUSH <word>");
        assert_eq!(lines[23], " 23  COMPL");
    }
}
