//! The qasmint interpreter driver.
//!
//! Compiles a program, wires stdin/stdout or file-backed I/O delegates,
//! runs it to completion, and reports faults with their source location.
//!
//! # Usage
//! ```text
//! qasmint -p program.qasm [-l limits.ini] [-i input.txt] [-o output.txt]
//! ```
//!
//! Exit code 0 when the program reaches `Finished`; 1 on any compile error,
//! fault, or termination.

use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::process;
use std::sync::Arc;

use qasm::compiler::compile;
use qasm::cpu::iobuf::{InputDelegate, OutputDelegate};
use qasm::cpu::{Cpu, CpuConfig, CpuState};
use qasm::limits::CpuLimits;
use qasm::utils::log::Logger;

const USAGE: &str = "\
QASM interpreter

USAGE:
    qasmint -p <program> [OPTIONS]

OPTIONS:
    -p, --program <path>    Assembly source to compile and run
    -l, --limits <path>     Limits INI file (defaults apply when omitted)
    -i, --input <path>      Redirect program input from a file (default: stdin)
    -o, --output <path>     Redirect program output into a file (default: stdout)
    -h, --help              Print this help message

EXIT CODES:
    0    the program finished
    1    compile error, runtime fault, or termination
";

struct Options {
    program: String,
    limits: Option<String>,
    input: Option<String>,
    output: Option<String>,
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut program = None;
    let mut limits = None;
    let mut input = None;
    let mut output = None;

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "-h" | "--help" => {
                print!("{USAGE}");
                process::exit(0);
            }
            "-p" | "--program" | "-l" | "--limits" | "-i" | "--input" | "-o" | "--output" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| format!("{flag} requires an argument"))?
                    .clone();
                match flag {
                    "-p" | "--program" => program = Some(value),
                    "-l" | "--limits" => limits = Some(value),
                    "-i" | "--input" => input = Some(value),
                    _ => output = Some(value),
                }
                i += 1;
            }
            other => return Err(format!("unexpected argument: {other}")),
        }
    }

    Ok(Options {
        program: program.ok_or("missing required -p <program>")?,
        limits,
        input,
        output,
    })
}

fn make_input(log: &Logger, path: Option<&str>) -> std::io::Result<InputDelegate> {
    match path {
        Some(path) => {
            log.info(&format!("redirecting input from: '{path}'"));
            let mut lines = BufReader::new(fs::File::open(path)?).lines();
            Ok(Box::new(move || lines.next().and_then(|line| line.ok())))
        }
        None => Ok(Box::new(|| {
            let mut line = String::new();
            match std::io::stdin().read_line(&mut line) {
                Ok(0) | Err(_) => None,
                Ok(_) => {
                    if line.ends_with('\n') {
                        line.pop();
                        if line.ends_with('\r') {
                            line.pop();
                        }
                    }
                    Some(line)
                }
            }
        })),
    }
}

fn make_output(log: &Logger, path: Option<&str>) -> std::io::Result<OutputDelegate> {
    match path {
        Some(path) => {
            log.info(&format!("redirecting output into: '{path}'"));
            let mut file = BufWriter::new(fs::File::create(path)?);
            Ok(Box::new(move |line: &str| {
                writeln!(file, "{line}").and_then(|_| file.flush()).is_ok()
            }))
        }
        None => Ok(Box::new(|line: &str| {
            println!("{line}");
            true
        })),
    }
}

fn main() {
    let log = Logger::new("qasmint");
    let args: Vec<String> = std::env::args().collect();

    let options = match parse_args(&args) {
        Ok(options) => options,
        Err(message) => {
            eprintln!("{message}\n");
            print!("{USAGE}");
            process::exit(1);
        }
    };

    let source = match fs::read_to_string(&options.program) {
        Ok(source) => source,
        Err(e) => {
            log.error(&format!("cannot read program '{}': {e}", options.program));
            process::exit(1);
        }
    };

    log.info(&format!("compiling program: '{}'", options.program));
    let program = match compile(&source) {
        Ok(program) => Arc::new(program),
        Err(e) => {
            log.error(&format!("compilation failed: {e}"));
            process::exit(1);
        }
    };
    log.info(&format!(
        "program has {} instructions",
        program.instruction_count()
    ));

    let limits = match &options.limits {
        Some(path) => {
            log.info(&format!("loading limits from: '{path}'"));
            let text = match fs::read_to_string(path) {
                Ok(text) => text,
                Err(e) => {
                    log.error(&format!("cannot read limits '{path}': {e}"));
                    process::exit(1);
                }
            };
            match CpuLimits::from_ini(&text) {
                Ok(limits) => limits,
                Err(e) => {
                    log.error(&format!("invalid limits: {e}"));
                    process::exit(1);
                }
            }
        }
        None => CpuLimits::default(),
    };

    let input = make_input(&log, options.input.as_deref()).unwrap_or_else(|e| {
        log.error(&format!("cannot open input: {e}"));
        process::exit(1);
    });
    let output = make_output(&log, options.output.as_deref()).unwrap_or_else(|e| {
        log.error(&format!("cannot open output: {e}"));
        process::exit(1);
    });

    let mut cpu = match Cpu::new(CpuConfig {
        limits,
        input: Some(input),
        output: Some(output),
    }) {
        Ok(cpu) => cpu,
        Err(e) => {
            log.error(&format!("invalid limits: {e}"));
            process::exit(1);
        }
    };
    cpu.load_program(Some(Arc::clone(&program)));

    loop {
        match cpu.run() {
            Ok(()) => match cpu.state() {
                CpuState::Interrupted => continue,
                CpuState::Finished => {
                    log.info(&format!("finished in {} steps", cpu.step_index()));
                    process::exit(0);
                }
                other => {
                    log.error(&format!("stopped in state {}", other.name()));
                    process::exit(1);
                }
            },
            Err(fault) => {
                log.error(&format!("{fault}"));
                log.error(&format!(
                    "function: '{}'",
                    program.function_name(cpu.function_index())
                ));
                log.error(&format!("source: {}", program.source_line(cpu.source_line() + 1)));
                log.error(&format!("line: {}", cpu.source_line() + 1));
                log.error(&format!("step: {}", cpu.step_index()));
                process::exit(1);
            }
        }
    }
}
