use std::fs;
use std::path::{Path, PathBuf};

use strata::{abi_report, clif_report, compile_file, load_program, run_file};
use strata_codegen::runtime::flush_stdout;
use strata_codegen::{BackendConfig, CodegenMode, OptimizationLevel, SizeArgPolicy};
use tracing_subscriber::EnvFilter;

fn main() {
    init_tracing();
    if let Err(message) = run() {
        eprintln!("{message}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("STRATA_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<(), String> {
    let args = std::env::args().collect::<Vec<_>>();
    let command = parse_cli(&args)?;

    match command {
        Command::Run {
            input,
            options,
            program_args,
        } => {
            let result = run_file(&input, &options.config(CodegenMode::Jit), &program_args)?;
            flush_stdout();
            if result.exit_code != 0 {
                std::process::exit(result.exit_code);
            }
            Ok(())
        }
        Command::Build {
            input,
            output,
            options,
        } => {
            let output = output.unwrap_or_else(|| default_build_output_path(&input));
            let result = compile_file(&input, &options.config(CodegenMode::Aot))?;
            if result.object.is_empty() {
                return Err("AOT backend produced no object bytes".to_string());
            }
            if let Some(parent) = output.parent()
                && !parent.as_os_str().is_empty()
            {
                fs::create_dir_all(parent)
                    .map_err(|err| format!("failed to create output directory: {err}"))?;
            }
            fs::write(&output, &result.object)
                .map_err(|err| format!("failed to write `{}`: {err}", output.display()))?;
            println!(
                "built object `{}` ({} bytes)",
                output.display(),
                result.object.len()
            );
            Ok(())
        }
        Command::Abi { input, options } => {
            let module = load_program(&input)?;
            println!("{}", abi_report(&module, &options.config(CodegenMode::Aot))?);
            Ok(())
        }
        Command::Clif { input, options } => {
            let module = load_program(&input)?;
            println!("{}", clif_report(&module, &options.config(CodegenMode::Aot))?);
            Ok(())
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct CliOptions {
    /// `None` keeps the build profile's default.
    census: Option<bool>,
    flares: bool,
    size_args: Option<SizeArgPolicy>,
    opt_level: Option<OptimizationLevel>,
}

impl CliOptions {
    fn config(&self, mode: CodegenMode) -> BackendConfig {
        let defaults = BackendConfig::default();
        BackendConfig {
            mode,
            census: self.census.unwrap_or(defaults.census),
            flares: self.flares,
            size_args: self.size_args.unwrap_or(defaults.size_args),
            opt_level: self.opt_level.unwrap_or(defaults.opt_level),
            ..defaults
        }
    }

    /// Consume the option at `args[idx]`, returning how many arguments it
    /// used, or `None` if it is not a backend option.
    fn parse_one(&mut self, args: &[String], idx: usize) -> Result<Option<usize>, String> {
        match args[idx].as_str() {
            "--census" => self.census = Some(true),
            "--no-census" => self.census = Some(false),
            "--flares" => self.flares = true,
            "-O0" => self.opt_level = Some(OptimizationLevel::None),
            "-O1" => self.opt_level = Some(OptimizationLevel::Default),
            "-O2" => self.opt_level = Some(OptimizationLevel::Aggressive),
            "--size-args" => {
                let value = args
                    .get(idx + 1)
                    .ok_or_else(|| "missing value for --size-args".to_string())?;
                self.size_args = Some(match value.as_str() {
                    "shared" => SizeArgPolicy::SharedOnly,
                    "dynamic" => SizeArgPolicy::AllDynamic,
                    other => {
                        return Err(format!(
                            "unknown size-arg policy `{other}` (expected `shared` or `dynamic`)"
                        ));
                    }
                });
                return Ok(Some(2));
            }
            _ => return Ok(None),
        }
        Ok(Some(1))
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Run {
        input: PathBuf,
        options: CliOptions,
        program_args: Vec<String>,
    },
    Build {
        input: PathBuf,
        output: Option<PathBuf>,
        options: CliOptions,
    },
    Abi {
        input: PathBuf,
        options: CliOptions,
    },
    Clif {
        input: PathBuf,
        options: CliOptions,
    },
}

fn parse_cli(args: &[String]) -> Result<Command, String> {
    if args.len() < 3 {
        return Err(usage());
    }
    let input = PathBuf::from(&args[2]);
    let mut options = CliOptions::default();
    let mut output = None;
    let mut program_args = Vec::new();
    let subcommand = args[1].as_str();
    if !matches!(subcommand, "run" | "build" | "abi" | "clif") {
        return Err(usage());
    }

    let mut idx = 3;
    while idx < args.len() {
        if let Some(consumed) = options.parse_one(args, idx)? {
            idx += consumed;
            continue;
        }
        match (subcommand, args[idx].as_str()) {
            ("run", "--") => {
                program_args = args[idx + 1..].to_vec();
                break;
            }
            ("build", "-o" | "--output") => {
                if idx + 1 >= args.len() {
                    return Err("missing value for --output".to_string());
                }
                output = Some(PathBuf::from(&args[idx + 1]));
                idx += 2;
            }
            (_, unknown) => {
                return Err(format!("unknown argument `{unknown}`\n{}", usage()));
            }
        }
    }

    Ok(match subcommand {
        "run" => Command::Run {
            input,
            options,
            program_args,
        },
        "build" => Command::Build {
            input,
            output,
            options,
        },
        "abi" => Command::Abi { input, options },
        _ => Command::Clif { input, options },
    })
}

fn usage() -> String {
    [
        "usage:",
        "  strata run <program.json> [options] [-- args...]",
        "  strata build <program.json> [options] [-o output.o]",
        "  strata abi <program.json> [options]",
        "  strata clif <program.json> [options]",
        "options:",
        "  --census | --no-census   track heap objects and assert none leak",
        "  --flares                 trace extern calls at run time",
        "  --size-args shared|dynamic",
        "  -O0 | -O1 | -O2",
    ]
    .join("\n")
}

fn default_build_output_path(input: &Path) -> PathBuf {
    input.with_extension("o")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("strata")
            .chain(args.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn parse_run_with_options_and_program_args() {
        let command = parse_cli(&argv(&[
            "run",
            "main.json",
            "--census",
            "--size-args",
            "dynamic",
            "-O0",
            "--",
            "--census",
            "x",
        ]))
        .expect("cli parse should succeed");
        assert_eq!(
            command,
            Command::Run {
                input: PathBuf::from("main.json"),
                options: CliOptions {
                    census: Some(true),
                    flares: false,
                    size_args: Some(SizeArgPolicy::AllDynamic),
                    opt_level: Some(OptimizationLevel::None),
                },
                program_args: vec!["--census".to_string(), "x".to_string()],
            }
        );
    }

    #[test]
    fn parse_build_with_output() {
        let command = parse_cli(&argv(&["build", "main.json", "-o", "out/main.o", "--flares"]))
            .expect("cli parse should succeed");
        assert_eq!(
            command,
            Command::Build {
                input: PathBuf::from("main.json"),
                output: Some(PathBuf::from("out/main.o")),
                options: CliOptions {
                    flares: true,
                    ..CliOptions::default()
                },
            }
        );
    }

    #[test]
    fn output_flag_is_build_only() {
        let err = parse_cli(&argv(&["abi", "main.json", "-o", "x.o"])).expect_err("abi has no -o");
        assert!(err.starts_with("unknown argument `-o`"), "{err}");
    }

    #[test]
    fn bad_size_arg_policy_is_reported() {
        let err = parse_cli(&argv(&["run", "main.json", "--size-args", "all"]))
            .expect_err("unknown policy");
        assert!(err.contains("`all`"), "{err}");
    }

    #[test]
    fn unknown_subcommand_prints_usage() {
        let err = parse_cli(&argv(&["emit", "main.json"])).expect_err("unknown subcommand");
        assert!(err.starts_with("usage:"));
    }

    #[test]
    fn census_flag_overrides_profile_default() {
        let options = CliOptions {
            census: Some(false),
            ..CliOptions::default()
        };
        let config = options.config(CodegenMode::Jit);
        assert!(!config.census);
        assert_eq!(config.size_args, SizeArgPolicy::SharedOnly);
        assert_eq!(config.mode, CodegenMode::Jit);
    }

    #[test]
    fn default_build_output_path_swaps_extension() {
        assert_eq!(
            default_build_output_path(Path::new("demos/hello.json")),
            PathBuf::from("demos/hello.o")
        );
    }
}
