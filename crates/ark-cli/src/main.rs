use std::{env, path::PathBuf, process::ExitCode};

use ark::{Options, Value, compile_file, eval, run_file};

const USAGE: &str = "\
usage: ark [options] <file.ark>
       ark -c <file.ark>      compile to <file.arkc> alongside the source
       ark -e \"<expr>\"        evaluate an expression and print its value

options:
  -d            increase the debug level (repeatable)
  -L <paths>    semicolon-separated library search paths
  -v            print the version and exit
  -h            print this help and exit";

enum Action {
    Run(PathBuf),
    Compile(PathBuf),
    Eval(String),
    Version,
    Help,
}

fn main() -> ExitCode {
    let mut options = Options::from_env();
    let mut action: Option<Action> = None;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => action = Some(Action::Help),
            "-v" | "--version" => action = Some(Action::Version),
            "-d" => options.debug += 1,
            "-L" => {
                let Some(paths) = args.next() else {
                    eprintln!("error: -L expects a path list");
                    return ExitCode::FAILURE;
                };
                options.lib_paths.extend(paths.split(';').map(PathBuf::from));
            }
            "-c" => {
                let Some(file) = args.next() else {
                    eprintln!("error: -c expects a file");
                    return ExitCode::FAILURE;
                };
                action = Some(Action::Compile(PathBuf::from(file)));
            }
            "-e" => {
                let Some(expr) = args.next() else {
                    eprintln!("error: -e expects an expression");
                    return ExitCode::FAILURE;
                };
                action = Some(Action::Eval(expr));
            }
            other if other.starts_with('-') => {
                eprintln!("error: unknown option {other}\n{USAGE}");
                return ExitCode::FAILURE;
            }
            file => action = Some(Action::Run(PathBuf::from(file))),
        }
    }

    match action {
        None | Some(Action::Help) => {
            println!("{USAGE}");
            ExitCode::SUCCESS
        }
        Some(Action::Version) => {
            println!("ark {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        Some(Action::Run(file)) => match run_file(&file, &options) {
            Ok(code) => u8::try_from(code).map_or(ExitCode::FAILURE, ExitCode::from),
            Err(err) => {
                eprintln!("{err}");
                ExitCode::FAILURE
            }
        },
        Some(Action::Compile(file)) => {
            let destination = file.with_extension("arkc");
            match compile_file(&file, &options) {
                Ok(bytes) => {
                    if let Err(err) = std::fs::write(&destination, bytes) {
                        eprintln!("error: can not write {}: {err}", destination.display());
                        return ExitCode::FAILURE;
                    }
                    if options.debug >= 1 {
                        eprintln!("compiled to {}", destination.display());
                    }
                    ExitCode::SUCCESS
                }
                Err(err) => {
                    eprintln!("{err}");
                    ExitCode::FAILURE
                }
            }
        }
        Some(Action::Eval(expr)) => match eval(&expr, "<eval>", &options) {
            Ok(Value::Nil) => ExitCode::SUCCESS,
            Ok(value) => {
                println!("{value}");
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("{err}");
                ExitCode::FAILURE
            }
        },
    }
}
