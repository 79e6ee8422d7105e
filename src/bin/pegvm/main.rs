use std::{fs, path::Path, process};

use anyhow::Context;
use log::{error, info, LevelFilter};
use simplelog::{ColorChoice, Config, TerminalMode, TermLogger};

use pegvm::{
    vm::{Vm, VmConfig},
    Grammar,
};

mod host;

const USAGE: &str = "\
usage: pegvm [-v|--verbose] [-q|--quiet] [--ast] [--max-steps N] GRAMMAR [INPUT...]

Compiles GRAMMAR and prints its program. Each INPUT file is then parsed with it.
-q skips the listing; -v traces every instruction.";

fn main() -> anyhow::Result<()> {
    let mut args = pico_args::Arguments::from_env();

    if args.contains(["-h", "--help"]) {
        println!("{}", USAGE);
        return Ok(());
    }

    let verbose = args.contains(["-v", "--verbose"]);
    let quiet = args.contains(["-q", "--quiet"]);
    let level = if verbose {
        LevelFilter::Trace
    } else if quiet {
        LevelFilter::Warn
    } else {
        LevelFilter::Info
    };
    let show_ast = args.contains("--ast");
    let max_steps: Option<usize> = args.opt_value_from_str("--max-steps")?;

    TermLogger::init(
        level,
        Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )?;

    let root = std::env::current_dir()?;
    let grammar_path = match args.opt_free_from_str::<String>()? {
        Some(path) => root.join(path),
        None => {
            eprintln!("{}", USAGE);
            process::exit(2);
        }
    };

    let grammar = match read_grammar(&grammar_path)? {
        Some(grammar) => grammar,
        None => process::exit(1),
    };
    if show_ast {
        print!("{}", grammar);
    }

    let program = grammar
        .to_program()
        .with_context(|| format!("compiling {}", grammar_path.display()))?;
    if !quiet {
        print!("{}", program.disassemble());
    }
    info!("{}", program.stats());

    let config = VmConfig {
        max_steps,
        ..VmConfig::default()
    };
    let vm = Vm::with_config(&program, config)?;

    let mut all_matched = true;
    while let Some(input_stub) = args.opt_free_from_str::<String>()? {
        let path = root.join(input_stub);
        let input =
            fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;

        let outcome = vm.run(&input, &mut host::LoggingHost)?;
        if outcome.matched {
            println!(
                "{}: matched {} of {} bytes",
                path.display(),
                outcome.end,
                input.len()
            );
        } else {
            all_matched = false;
            match outcome.failure {
                Some(failure) => println!(
                    "{}: no match, {} (byte {})",
                    path.display(),
                    program.describe_failure(failure.addr),
                    failure.position
                ),
                None => println!("{}: no match", path.display()),
            }
        }
    }

    if !all_matched {
        process::exit(1);
    }
    Ok(())
}

/// Read a grammar file, printing a report and returning `None` if it doesn't parse.
fn read_grammar(path: &Path) -> anyhow::Result<Option<Grammar>> {
    let name = path.to_string_lossy().into_owned();
    let source =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;

    match Grammar::read(&source, name.clone()) {
        Ok(grammar) => Ok(Some(grammar)),
        Err(ono) => {
            error!("{} does not parse", name);
            ono.report()
                .eprint(ariadne::sources(std::iter::once((name, &source))))?;
            Ok(None)
        }
    }
}
