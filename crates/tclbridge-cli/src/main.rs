use std::io::BufRead;
use std::process;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use tclbridge::{BridgeError, CloseOutcome, CommandLineLauncher, Session, SessionConfig};

const USAGE: &str = "\
Usage: tclbridge [options] [<command>...]

Arguments:
  <command>            Tcl command to evaluate; '-' reads one command per line from stdin

Options:
  --tool <program>     Tool to launch [default: tclsh]
  --arg <arg>          Tool argument, repeatable; '{script}' marks the companion script
  --timeout-ms <ms>    Per-call timeout [default: none]
  --hello              Print the handshake as JSON
  --keep-open          Detach instead of quitting and wait for the tool to exit";

#[derive(Debug, Default, PartialEq)]
struct Options {
    tool: Option<String>,
    tool_args: Vec<String>,
    timeout: Option<Duration>,
    hello: bool,
    keep_open: bool,
    commands: Vec<String>,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let options = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    init_tracing();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            process::exit(1);
        }
    };

    match runtime.block_on(run(options)) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            process::exit(1);
        }
    }
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut options = Options::default();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--tool" => {
                i += 1;
                options.tool = Some(args.get(i).ok_or("--tool requires a value")?.clone());
            }
            "--arg" => {
                i += 1;
                options
                    .tool_args
                    .push(args.get(i).ok_or("--arg requires a value")?.clone());
            }
            "--timeout-ms" => {
                i += 1;
                let raw = args.get(i).ok_or("--timeout-ms requires a value")?;
                let ms: u64 = raw
                    .parse()
                    .map_err(|_| format!("invalid --timeout-ms value: {raw}"))?;
                options.timeout = Some(Duration::from_millis(ms));
            }
            "--hello" => options.hello = true,
            "--keep-open" => options.keep_open = true,
            "--help" | "-h" => return Err(String::new()),
            "-" => options.commands.push("-".to_string()),
            arg if arg.starts_with("--") => return Err(format!("unknown flag: {arg}")),
            arg => options.commands.push(arg.to_string()),
        }
        i += 1;
    }

    if options.commands.is_empty() && !options.hello && !options.keep_open {
        return Err("nothing to do: give a command, --hello or --keep-open".to_string());
    }
    Ok(options)
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("TCLBRIDGE_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("info") => "info",
            Ok("error") => "error",
            _ => "warn",
        };
        EnvFilter::new(format!(
            "tclbridge={level},tclbridge_cli={level}",
            level = base_level
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn expand_commands(commands: Vec<String>) -> anyhow::Result<Vec<String>> {
    let mut out = Vec::with_capacity(commands.len());
    for command in commands {
        if command == "-" {
            for line in std::io::stdin().lock().lines() {
                let line = line.context("failed to read commands from stdin")?;
                if !line.trim().is_empty() {
                    out.push(line);
                }
            }
        } else {
            out.push(command);
        }
    }
    Ok(out)
}

/// Returns the process exit code.
async fn run(options: Options) -> anyhow::Result<i32> {
    let mut launcher = match &options.tool {
        Some(tool) => CommandLineLauncher::new(tool),
        None => CommandLineLauncher::tclsh(),
    };
    launcher = launcher.args(options.tool_args.iter().cloned());

    let mut config = SessionConfig::new(launcher).with_env_overrides();
    if options.timeout.is_some() {
        config = config.with_call_timeout(options.timeout);
    }

    let commands = expand_commands(options.commands)?;
    let mut session = Session::open(config)
        .await
        .context("failed to start the tool")?;

    if options.hello
        && let Some(hello) = session.hello()
    {
        println!("{}", serde_json::to_string_pretty(hello)?);
    }

    let mut code = 0;
    for command in commands {
        match session.call(command).await {
            Ok(result) => {
                if !result.as_str().is_empty() {
                    println!("{result}");
                }
            }
            Err(BridgeError::RemoteEvaluation { message, .. }) => {
                eprintln!("{message}");
                code = 1;
            }
            Err(e) => return Err(e).context("bridge failed"),
        }
    }

    match session.close(!options.keep_open).await? {
        CloseOutcome::Exited(status) => {
            tracing::debug!(%status, "Tool exited");
        }
        CloseOutcome::Detached(mut child) => {
            let status = child.wait().await.context("failed to wait for the tool")?;
            if code == 0 {
                code = status.code().unwrap_or(1);
            }
        }
    }
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("tclbridge")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parses_tool_and_commands() {
        let options = parse_args(&args(&[
            "--tool",
            "vivado",
            "--arg",
            "-mode",
            "--arg",
            "batch",
            "--arg",
            "-source",
            "--arg",
            "{script}",
            "--timeout-ms",
            "1500",
            "puts hi",
            "expr 1 + 1",
        ]))
        .unwrap();
        assert_eq!(options.tool.as_deref(), Some("vivado"));
        assert_eq!(options.tool_args, ["-mode", "batch", "-source", "{script}"]);
        assert_eq!(options.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(options.commands, ["puts hi", "expr 1 + 1"]);
        assert!(!options.hello);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_args(&args(&[])).is_err());
        assert!(parse_args(&args(&["--tool"])).is_err());
        assert!(parse_args(&args(&["--timeout-ms", "soon", "x"])).is_err());
        assert_eq!(
            parse_args(&args(&["--bogus", "x"])).unwrap_err(),
            "unknown flag: --bogus"
        );
        assert_eq!(parse_args(&args(&["--help"])).unwrap_err(), "");
    }

    #[test]
    fn hello_alone_is_enough() {
        let options = parse_args(&args(&["--hello"])).unwrap();
        assert!(options.hello);
        assert!(options.commands.is_empty());
    }
}
