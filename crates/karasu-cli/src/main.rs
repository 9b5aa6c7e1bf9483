//! The `karasu` script runner.
//!
//! Usage:
//!
//! ```text
//! karasu script.kar            run a script file
//! karasu -c 'print("hi")'      run a one-liner
//! karasu --dis script.kar      disassemble instead of running
//! karasu                       run a script from stdin
//! ```

use std::{io::Read as _, process::ExitCode};

use karasu::{Vm, VmFlags};

struct Options {
    disassemble: bool,
    stress_gc: bool,
    command: Option<String>,
    file: Option<String>,
}

fn parse_options() -> Result<Options, String> {
    let mut options = Options {
        disassemble: false,
        stress_gc: false,
        command: None,
        file: None,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--dis" => options.disassemble = true,
            "--stress-gc" => options.stress_gc = true,
            "-c" => {
                let Some(code) = args.next() else {
                    return Err(String::from("-c requires an argument"));
                };
                options.command = Some(code);
            }
            "--help" | "-h" => {
                return Err(String::from(
                    "usage: karasu [--dis] [--stress-gc] [-c CODE] [file]",
                ));
            }
            other if other.starts_with('-') => {
                return Err(format!("unknown option: {other}"));
            }
            other => {
                if options.file.is_some() {
                    return Err(String::from("only one script file may be given"));
                }
                options.file = Some(other.to_string());
            }
        }
    }
    Ok(options)
}

fn main() -> ExitCode {
    let options = match parse_options() {
        Ok(options) => options,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::from(2);
        }
    };

    let flags = VmFlags {
        stress_gc: options.stress_gc,
        ..VmFlags::default()
    };
    let mut vm = Vm::new(flags);

    let (source, name) = if let Some(code) = &options.command {
        (code.clone(), String::from("<command>"))
    } else if let Some(file) = &options.file {
        match std::fs::read_to_string(file) {
            Ok(source) => {
                // Scripts import siblings from their own directory.
                if let Some(parent) = std::path::Path::new(file).parent() {
                    vm.add_module_path(parent.to_path_buf());
                }
                (source, file.clone())
            }
            Err(err) => {
                eprintln!("karasu: could not read {file}: {err}");
                return ExitCode::from(2);
            }
        }
    } else {
        let mut source = String::new();
        if std::io::stdin().read_to_string(&mut source).is_err() {
            eprintln!("karasu: could not read stdin");
            return ExitCode::from(2);
        }
        (source, String::from("<stdin>"))
    };

    if options.disassemble {
        return match vm.disassemble(&source, &name) {
            Ok(listing) => {
                print!("{listing}");
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprint!("{}", vm.format_traceback(&err));
                ExitCode::FAILURE
            }
        };
    }

    match vm.interpret(&source, &name) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprint!("{}", vm.format_traceback(&err));
            ExitCode::FAILURE
        }
    }
}
