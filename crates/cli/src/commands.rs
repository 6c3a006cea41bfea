use std::time::Duration;

use mender_core::sandbox::ConsoleArg;

/// One line of operator input.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplCommand {
    Throw(String),
    Reject(String),
    Log(Vec<ConsoleArg>),
    Warn(Vec<ConsoleArg>),
    Error(Vec<ConsoleArg>),
    Fetch { method: String, url: String },
    Xhr { method: String, url: String },
    Load(Duration),
    Op(String),
    Edit { path: String, content: String },
    Open(String),
    Files,
    Stats,
    Status,
    Reset,
    History,
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  throw <message>          uncaught error in the sandbox
  reject <message>         unhandled promise rejection
  log|warn|error <args>    console call (JSON args are passed as objects)
  fetch <url> [method]     high-level request
  xhr <method> <url>       low-level request
  load <ms>                finish page load after <ms>
  op <text>                record the last operation
  edit <path> <content>    overwrite a file as the user (and open it)
  open <path>              mark the file open in the editor
  files | stats | status | history | reset | help | quit";

pub fn parse(line: &str) -> Result<ReplCommand, String> {
    let line = line.trim();
    let (head, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    let need = |what: &str| -> Result<String, String> {
        if rest.is_empty() {
            Err(format!("{head}: missing {what}"))
        } else {
            Ok(rest.to_string())
        }
    };

    Ok(match head {
        "throw" => ReplCommand::Throw(need("message")?),
        "reject" => ReplCommand::Reject(need("message")?),
        "log" => ReplCommand::Log(console_args(rest)),
        "warn" => ReplCommand::Warn(console_args(rest)),
        "error" => ReplCommand::Error(console_args(rest)),
        "fetch" => {
            let mut parts = rest.split_whitespace();
            let url = parts.next().ok_or("fetch: missing url")?.to_string();
            let method = parts.next().unwrap_or("GET").to_uppercase();
            ReplCommand::Fetch { method, url }
        }
        "xhr" => {
            let mut parts = rest.split_whitespace();
            let (Some(method), Some(url)) = (parts.next(), parts.next()) else {
                return Err("xhr: usage xhr <method> <url>".into());
            };
            ReplCommand::Xhr {
                method: method.to_uppercase(),
                url: url.to_string(),
            }
        }
        "load" => {
            let ms: u64 = need("milliseconds")?
                .parse()
                .map_err(|_| "load: expected milliseconds".to_string())?;
            ReplCommand::Load(Duration::from_millis(ms))
        }
        "op" => ReplCommand::Op(need("description")?),
        "edit" => {
            let Some((path, content)) = rest.split_once(char::is_whitespace) else {
                return Err("edit: usage edit <path> <content>".into());
            };
            ReplCommand::Edit {
                path: path.to_string(),
                content: content.trim_start().replace("\\n", "\n"),
            }
        }
        "open" => ReplCommand::Open(need("path")?),
        "files" => ReplCommand::Files,
        "stats" => ReplCommand::Stats,
        "status" => ReplCommand::Status,
        "reset" => ReplCommand::Reset,
        "history" => ReplCommand::History,
        "help" | "?" => ReplCommand::Help,
        "quit" | "exit" | "/q" => ReplCommand::Quit,
        other => return Err(format!("unknown command: {other} (try help)")),
    })
}

/// A JSON object/array argument stays structured, anything else is text.
fn console_args(rest: &str) -> Vec<ConsoleArg> {
    if rest.is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<serde_json::Value>(rest) {
        Ok(v @ (serde_json::Value::Object(_) | serde_json::Value::Array(_))) => vec![ConsoleArg::from(v)],
        _ => vec![ConsoleArg::from(rest)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sandbox_commands() {
        assert_eq!(parse("throw a is undefined"), Ok(ReplCommand::Throw("a is undefined".into())));
        assert_eq!(
            parse("fetch http://x/api post"),
            Ok(ReplCommand::Fetch {
                method: "POST".into(),
                url: "http://x/api".into()
            })
        );
        assert_eq!(parse("load 4500"), Ok(ReplCommand::Load(Duration::from_millis(4500))));
        assert_eq!(
            parse("edit src/a.js one\\ntwo"),
            Ok(ReplCommand::Edit {
                path: "src/a.js".into(),
                content: "one\ntwo".into()
            })
        );
        assert_eq!(parse("open src/a.js"), Ok(ReplCommand::Open("src/a.js".into())));
        assert!(parse("open").is_err());
    }

    #[test]
    fn console_objects_stay_structured() {
        let Ok(ReplCommand::Error(args)) = parse(r#"error {"code": 7}"#) else {
            panic!("expected error command");
        };
        assert!(matches!(args[0], ConsoleArg::Object(_)));
        let Ok(ReplCommand::Warn(args)) = parse("warn plain text") else {
            panic!("expected warn command");
        };
        assert_eq!(args, vec![ConsoleArg::Str("plain text".into())]);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse("throw").is_err());
        assert!(parse("load soon").is_err());
        assert!(parse("xhr GET").is_err());
        assert!(parse("dance").is_err());
    }
}
