//! Minimal Tcl-like interpreter serving the bridge protocol.
//!
//! Used as the remote tool in tests when no real `tclsh` is around. It
//! understands a handful of commands and keeps opaque "box" values whose
//! string form is always `box`, so a box can only be handed back to
//! `unwrap_box` through its result reference.
//!
//! Commands: `expr a op b`, `create_box text`, `unwrap_box box`,
//! `invert_case text`, `echo words...`, `set name ?value?`, `sleep ms`,
//! `exit ?code?`.

use std::collections::HashMap;
use std::fmt;
use std::io::BufRead;
use std::process::ExitCode;
use std::time::Duration;

use async_trait::async_trait;
use tracing_subscriber::EnvFilter;

use tclbridge::bridge::protocol::Hello;
use tclbridge::reference::parse_result_expr;
use tclbridge::{Evaluator, RemoteEndpoint, ResultStore};

const COMMANDS: &[&str] = &[
    "expr",
    "create_box",
    "unwrap_box",
    "invert_case",
    "echo",
    "set",
    "sleep",
    "exit",
];

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Text(String),
    Box { id: u64, content: String },
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Box { .. } => f.write_str("box"),
        }
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

#[derive(Debug, PartialEq)]
enum Token {
    /// `{...}`: taken literally.
    Braced(String),
    /// Bare or quoted word after backslash processing. `var` marks a word
    /// that started with an unescaped `$`.
    Plain { text: String, var: bool },
}

fn backslash(c: char) -> char {
    match c {
        'n' => '\n',
        't' => '\t',
        'r' => '\r',
        '\n' => ' ',
        other => other,
    }
}

fn split_words(script: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = script.chars().collect();
    let mut i = 0;
    let mut words = Vec::new();

    while i < chars.len() {
        if chars[i].is_whitespace() {
            i += 1;
            continue;
        }
        match chars[i] {
            '{' => {
                let mut depth = 1;
                let mut text = String::new();
                i += 1;
                loop {
                    let Some(&c) = chars.get(i) else {
                        return Err("missing close-brace".to_string());
                    };
                    i += 1;
                    match c {
                        '\\' => {
                            text.push(c);
                            if let Some(&next) = chars.get(i) {
                                text.push(next);
                                i += 1;
                            }
                        }
                        '{' => {
                            depth += 1;
                            text.push(c);
                        }
                        '}' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                            text.push(c);
                        }
                        _ => text.push(c),
                    }
                }
                if chars.get(i).is_some_and(|c| !c.is_whitespace()) {
                    return Err("extra characters after close-brace".to_string());
                }
                words.push(Token::Braced(text));
            }
            '"' => {
                let mut text = String::new();
                i += 1;
                loop {
                    let Some(&c) = chars.get(i) else {
                        return Err("missing \"".to_string());
                    };
                    i += 1;
                    match c {
                        '"' => break,
                        '\\' => {
                            if let Some(&next) = chars.get(i) {
                                text.push(backslash(next));
                                i += 1;
                            }
                        }
                        _ => text.push(c),
                    }
                }
                words.push(Token::Plain { text, var: false });
            }
            _ => {
                let var = chars[i] == '$';
                let mut text = String::new();
                while let Some(&c) = chars.get(i) {
                    if c.is_whitespace() {
                        break;
                    }
                    i += 1;
                    if c == '\\' {
                        if let Some(&next) = chars.get(i) {
                            text.push(backslash(next));
                            i += 1;
                        }
                    } else {
                        text.push(c);
                    }
                }
                words.push(Token::Plain { text, var });
            }
        }
    }
    Ok(words)
}

fn number(word: &Value) -> Result<f64, String> {
    let text = word.to_string();
    text.trim()
        .parse::<f64>()
        .map_err(|_| format!("expected number but got \"{text}\""))
}

fn expr(args: &[Value]) -> Result<Value, String> {
    let joined = args.iter().map(Value::to_string).collect::<Vec<_>>().join(" ");
    let tokens: Vec<&str> = joined.split_whitespace().collect();
    let (a, op, b) = match tokens.as_slice() {
        [single] => return Ok(Value::Text((*single).to_string())),
        [a, op, b] => (*a, *op, *b),
        _ => {
            return Err(format!(
                "syntax error in expression \"{joined}\": missing operand"
            ));
        }
    };

    if let (Ok(x), Ok(y)) = (a.parse::<i64>(), b.parse::<i64>()) {
        let result = match op {
            "+" => x.checked_add(y),
            "-" => x.checked_sub(y),
            "*" => x.checked_mul(y),
            "/" if y == 0 => return Err("divide by zero".to_string()),
            "/" => Some(x.div_euclid(y)),
            _ => return Err(format!("invalid operator \"{op}\"")),
        };
        return result
            .map(|v| Value::Text(v.to_string()))
            .ok_or_else(|| "integer overflow".to_string());
    }

    let x = number(&Value::Text(a.to_string()))?;
    let y = number(&Value::Text(b.to_string()))?;
    let result = match op {
        "+" => x + y,
        "-" => x - y,
        "*" => x * y,
        "/" => x / y,
        _ => return Err(format!("invalid operator \"{op}\"")),
    };
    Ok(Value::Text(format!("{result:?}")))
}

fn invert_case(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_uppercase() {
                c.to_lowercase().collect::<String>()
            } else {
                c.to_uppercase().collect::<String>()
            }
        })
        .collect()
}

fn wrong_args(usage: &str) -> String {
    format!("wrong # args: should be \"{usage}\"")
}

#[derive(Default)]
struct Loopback {
    globals: HashMap<String, Value>,
    next_box: u64,
}

impl Loopback {
    fn resolve(&self, token: Token, results: &ResultStore<Value>) -> Result<Value, String> {
        match token {
            Token::Braced(text) => Ok(Value::Text(text)),
            Token::Plain { text, var: false } => Ok(Value::Text(text)),
            Token::Plain { text, var: true } => {
                if let Some(idx) = parse_result_expr(&text) {
                    return results
                        .get(idx)
                        .cloned()
                        .ok_or_else(|| format!("can't read \"{text}\": no such element in array"));
                }
                let name = text.trim_start_matches('$').trim_start_matches("::");
                self.globals
                    .get(name)
                    .cloned()
                    .ok_or_else(|| format!("can't read \"{name}\": no such variable"))
            }
        }
    }
}

#[async_trait]
impl Evaluator for Loopback {
    type Value = Value;

    fn hello(&self) -> Hello {
        let nameofexecutable = std::env::current_exe()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        Hello {
            patchlevel: format!("loopback-{}", env!("CARGO_PKG_VERSION")),
            commands: COMMANDS.iter().map(|c| c.to_string()).collect(),
            globals: self.globals.keys().cloned().collect(),
            nameofexecutable,
        }
    }

    async fn eval(&mut self, command: &str, results: &ResultStore<Value>) -> Result<Value, String> {
        let mut words = Vec::new();
        for token in split_words(command)? {
            words.push(self.resolve(token, results)?);
        }
        let Some((name, args)) = words.split_first() else {
            return Ok(Value::Text(String::new()));
        };

        match name.to_string().as_str() {
            "expr" => expr(args),
            "create_box" => match args {
                [content] => {
                    let id = self.next_box;
                    self.next_box += 1;
                    Ok(Value::Box {
                        id,
                        content: content.to_string(),
                    })
                }
                _ => Err(wrong_args("create_box content")),
            },
            "unwrap_box" => match args {
                [Value::Box { id, content }] => {
                    tracing::debug!(box_id = id, "Unwrapping box");
                    Ok(Value::Text(content.clone()))
                }
                [other] => Err(format!("expected box but got \"{other}\"")),
                _ => Err(wrong_args("unwrap_box box")),
            },
            "invert_case" => match args {
                [text] => Ok(Value::Text(invert_case(&text.to_string()))),
                _ => Err(wrong_args("invert_case string")),
            },
            "echo" => Ok(Value::Text(
                args.iter().map(Value::to_string).collect::<Vec<_>>().join(" "),
            )),
            "set" => match args {
                [name] => {
                    let name = name.to_string();
                    self.globals
                        .get(&name)
                        .cloned()
                        .ok_or_else(|| format!("can't read \"{name}\": no such variable"))
                }
                [name, value] => {
                    self.globals.insert(name.to_string(), value.clone());
                    Ok(value.clone())
                }
                _ => Err(wrong_args("set varName ?newValue?")),
            },
            "sleep" => match args {
                [ms] => {
                    let ms = ms
                        .to_string()
                        .parse::<u64>()
                        .map_err(|_| format!("expected integer but got \"{ms}\""))?;
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(Value::Text(String::new()))
                }
                _ => Err(wrong_args("sleep ms")),
            },
            "exit" => {
                let code = match args {
                    [] => 0,
                    [code] => code
                        .to_string()
                        .parse::<i32>()
                        .map_err(|_| format!("expected integer but got \"{code}\""))?,
                    _ => return Err(wrong_args("exit ?returnCode?")),
                };
                std::process::exit(code)
            }
            other => Err(format!("invalid command name \"{other}\"")),
        }
    }
}

fn init_tracing() {
    let default = if std::env::var("TCLBRIDGE_DEBUG").is_ok_and(|v| v == "1") {
        "debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Line loop on stdin once the controller has detached.
async fn repl(mut interp: Loopback) {
    let results = ResultStore::new();
    let stdin = std::io::stdin();
    for line in stdin.lock().lines().map_while(Result::ok) {
        match interp.eval(&line, &results).await {
            Ok(value) => {
                let text = value.to_string();
                if !text.is_empty() {
                    println!("{text}");
                }
            }
            Err(message) => eprintln!("{message}"),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let endpoint = match RemoteEndpoint::from_env() {
        Ok(endpoint) => endpoint,
        Err(e) => {
            tracing::error!(error = %e, "Not started by a bridge controller");
            return ExitCode::FAILURE;
        }
    };

    match endpoint.serve(Loopback::default()).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            tracing::debug!("Detached, reading commands from stdin");
            repl(Loopback::default()).await;
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Bridge failed");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_split_like_tcl() {
        let words = split_words("echo {a b} c\\ d \"e f\" $x").unwrap();
        assert_eq!(
            words,
            [
                Token::Plain { text: "echo".into(), var: false },
                Token::Braced("a b".into()),
                Token::Plain { text: "c d".into(), var: false },
                Token::Plain { text: "e f".into(), var: false },
                Token::Plain { text: "$x".into(), var: true },
            ]
        );
    }

    #[test]
    fn braces_nest_and_keep_backslashes() {
        let words = split_words("echo {{hello} {world}} {a\\}b}").unwrap();
        assert_eq!(words[1], Token::Braced("{hello} {world}".into()));
        assert_eq!(words[2], Token::Braced("a\\}b".into()));
        assert!(split_words("echo {open").is_err());
    }

    #[test]
    fn escaped_dollar_is_not_a_variable() {
        let words = split_words("echo \\$x").unwrap();
        assert_eq!(words[1], Token::Plain { text: "$x".into(), var: false });
    }

    #[test]
    fn expr_arithmetic() {
        let t = |s: &str| Value::Text(s.into());
        assert_eq!(expr(&[t("3"), t("*"), t("5")]).unwrap(), t("15"));
        assert_eq!(expr(&[t("3 * 5")]).unwrap(), t("15"));
        assert_eq!(expr(&[t("1.5"), t("+"), t("1")]).unwrap(), t("2.5"));
        assert!(
            expr(&[t("1"), t("+")])
                .unwrap_err()
                .contains("missing operand")
        );
        assert_eq!(expr(&[t("1"), t("/"), t("0")]).unwrap_err(), "divide by zero");
    }

    #[test]
    fn invert_case_swaps() {
        assert_eq!(invert_case("Hello World"), "hELLO wORLD");
    }

    #[tokio::test]
    async fn boxes_survive_only_by_reference() {
        let mut interp = Loopback::default();
        let mut results = ResultStore::new();

        let boxed = interp.eval("create_box secret", &results).await.unwrap();
        assert_eq!(boxed.to_string(), "box");
        let idx = results.push(boxed);

        let by_ref = interp
            .eval(&format!("unwrap_box $::tclbridge::results({idx})"), &results)
            .await
            .unwrap();
        assert_eq!(by_ref, Value::Text("secret".into()));

        let by_string = interp.eval("unwrap_box {box}", &results).await.unwrap_err();
        assert!(by_string.contains("expected box"));
    }

    #[tokio::test]
    async fn unknown_command() {
        let mut interp = Loopback::default();
        let err = interp.eval("bogus 1", &ResultStore::new()).await.unwrap_err();
        assert_eq!(err, "invalid command name \"bogus\"");
    }
}
