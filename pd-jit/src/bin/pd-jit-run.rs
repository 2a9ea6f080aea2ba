use std::io;

use jit::config::{ENV_CODE_SIZE, parse_size};
use jit::{JitConfig, Value, Vm, VmResult, VmStatus, assemble, global, logging};
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct CliConfig {
    source: Option<String>,
    no_jit: bool,
    compare: bool,
    jit_dump: bool,
    hot_threshold: Option<u32>,
    code_size: Option<usize>,
    help: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init()?;
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_cli_args(&args).map_err(io::Error::other)?;
    if cli.help {
        print_usage();
        return Ok(());
    }
    let Some(source_path) = cli.source.as_deref() else {
        print_usage();
        return Err(io::Error::other("missing source path").into());
    };

    let source = std::fs::read_to_string(source_path)?;
    let program = assemble(&source)?;

    let mut config = JitConfig::from_env()?;
    if cli.no_jit {
        config.enabled = false;
    }
    if let Some(threshold) = cli.hot_threshold {
        config.hot_threshold = threshold;
    }
    if let Some(code_size) = cli.code_size {
        config.code_size = code_size;
    }
    if let Err(err) = global::init(config) {
        warn!(error = %err, "jit unavailable, interpreting");
    }

    let mut vm = Vm::new(program.clone());
    let (status, stack) = run_to_completion(&mut vm);
    print_outcome(&status, &stack);

    if cli.jit_dump {
        print!("{}", vm.dump_jit_info());
    }

    if cli.compare {
        let mut interpreted = Vm::new(program);
        interpreted.set_jit(None);
        let (expected_status, expected_stack) = run_to_completion(&mut interpreted);
        if expected_status != status || expected_stack != stack {
            println!("mismatch against interpreter:");
            print_outcome(&expected_status, &expected_stack);
            global::shutdown();
            return Err(io::Error::other("jit and interpreter disagree").into());
        }
        println!("interpreter agrees");
    }

    global::shutdown();
    status?;
    Ok(())
}

fn run_to_completion(vm: &mut Vm) -> (VmResult<VmStatus>, Vec<Value>) {
    let status = vm.run();
    (status, vm.stack().to_vec())
}

fn print_outcome(status: &VmResult<VmStatus>, stack: &[Value]) {
    match status {
        Ok(VmStatus::Halted) => println!("vm halted"),
        Err(err) => println!("vm error: {err}"),
    }
    println!("stack: {stack:?}");
}

fn parse_cli_args(args: &[String]) -> Result<CliConfig, String> {
    let mut cfg = CliConfig::default();
    let mut index = 0usize;
    while index < args.len() {
        match args[index].as_str() {
            "-h" | "--help" => {
                cfg.help = true;
                index += 1;
            }
            "--no-jit" => {
                cfg.no_jit = true;
                index += 1;
            }
            "--compare" => {
                cfg.compare = true;
                index += 1;
            }
            "--jit-dump" => {
                cfg.jit_dump = true;
                index += 1;
            }
            "--hot-threshold" => {
                let raw = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --hot-threshold".to_string())?;
                let value = raw
                    .parse::<u32>()
                    .ok()
                    .filter(|value| *value > 0)
                    .ok_or_else(|| format!("invalid --hot-threshold value '{raw}'"))?;
                cfg.hot_threshold = Some(value);
                index += 2;
            }
            "--code-size" => {
                let raw = args
                    .get(index + 1)
                    .ok_or_else(|| "missing value for --code-size".to_string())?;
                let value = parse_size(ENV_CODE_SIZE, raw).map_err(|err| err.to_string())?;
                cfg.code_size = Some(value);
                index += 2;
            }
            flag if flag.starts_with('-') => return Err(format!("unknown flag '{flag}'")),
            path => {
                if cfg.source.is_some() {
                    return Err(format!("unexpected argument '{path}'"));
                }
                cfg.source = Some(path.to_string());
                index += 1;
            }
        }
    }
    Ok(cfg)
}

fn print_usage() {
    println!("Usage:");
    println!("  pd-jit-run [options] <source.pdasm>");
    println!();
    println!("Options:");
    println!("  --no-jit               interpret only");
    println!("  --compare              also run interpreted and check both agree");
    println!("  --jit-dump             print segments and gate statistics after the run");
    println!("  --hot-threshold <n>    executions of a block before it is translated");
    println!("  --code-size <bytes>    native code reservation, e.g. 64k or 128m");
    println!("  -h, --help             show this message");
    println!();
    println!("Environment: PD_JIT, PD_JIT_CODE_SIZE, PD_JIT_HOT_THRESHOLD, PD_JIT_MAX_SEGMENT, RUST_LOG");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_flags_and_source() {
        let cfg = parse_cli_args(&args(&[
            "--compare",
            "--hot-threshold",
            "3",
            "--code-size",
            "64k",
            "demo.pdasm",
        ]))
        .expect("parse");
        assert!(cfg.compare);
        assert_eq!(cfg.hot_threshold, Some(3));
        assert_eq!(cfg.code_size, Some(64 * 1024));
        assert_eq!(cfg.source.as_deref(), Some("demo.pdasm"));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(parse_cli_args(&args(&["--hot-threshold", "0"])).is_err());
        assert!(parse_cli_args(&args(&["--code-size"])).is_err());
        assert!(parse_cli_args(&args(&["--bogus"])).is_err());
        assert!(parse_cli_args(&args(&["a.pdasm", "b.pdasm"])).is_err());
    }

    #[test]
    fn program_outcome_is_comparable() {
        let program: jit::Program = assemble("ldc 2\nldc 3\nadd\nret\n").expect("assemble");
        let mut vm = Vm::new(program);
        vm.set_jit(None);
        let (status, stack) = run_to_completion(&mut vm);
        assert_eq!(status, Ok(VmStatus::Halted));
        assert_eq!(stack, vec![Value::Int(5)]);
    }
}
