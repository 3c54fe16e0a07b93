//! tlsproxyctl - command line client for the tlsproxy control socket

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::env;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use tlsproxy::config::{conf_dir_from_env, Config};

#[derive(Debug, PartialEq)]
enum Command {
    Help,
    Version,
    Reload,
    ProcList,
    ProcStart(String),
    ProcStop(String),
    ProcRestart(String),
}

/// One request/response exchange per connection
struct ControlClient {
    path: PathBuf,
}

impl ControlClient {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn request(&self, name: &str, data: Value) -> Result<Value> {
        let mut stream = UnixStream::connect(&self.path)
            .with_context(|| format!("Cannot connect to {} (is tlsproxy running?)", self.path.display()))?;

        let line = json!({ "name": name, "data": data }).to_string();
        stream.write_all(line.as_bytes())?;
        stream.write_all(b"\n")?;
        stream.flush()?;

        let mut reader = BufReader::new(stream);
        let mut response = String::new();
        if reader.read_line(&mut response)? == 0 {
            bail!("Connection closed by tlsproxy");
        }

        let value: Value = serde_json::from_str(response.trim()).context("Invalid response from tlsproxy")?;
        if let Some(error) = value.get("error").and_then(Value::as_str) {
            bail!("{}", error);
        }
        Ok(value)
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    let command = parse_command(args.get(1..).unwrap_or(&[]));
    if command == Command::Help {
        print_help();
        return Ok(());
    }

    let client = ControlClient::new(socket_path()?);

    match command {
        Command::Help => print_help(),
        Command::Version => {
            let response = client.request("version", json!({}))?;
            println!("tlsproxyctl {}", env!("CARGO_PKG_VERSION"));
            println!(
                "tlsproxy    {}",
                response.get("version").and_then(Value::as_str).unwrap_or("unknown")
            );
        }
        Command::Reload => {
            let response = client.request("reload", json!({}))?;
            print_reload(&response);
        }
        Command::ProcList => print!("{}", render_processes(&client.request("proc-list", json!({}))?)),
        Command::ProcStart(id) => print!("{}", process_command(&client, "proc-start", &id)?),
        Command::ProcStop(id) => print!("{}", process_command(&client, "proc-stop", &id)?),
        Command::ProcRestart(id) => print!("{}", process_command(&client, "proc-restart", &id)?),
    }

    Ok(())
}

fn socket_path() -> Result<PathBuf> {
    let conf_dir = conf_dir_from_env();
    let config = Config::load(&conf_dir)
        .with_context(|| format!("Failed to load configuration from {}", conf_dir.display()))?;
    Ok(config.socket_path())
}

fn parse_command(args: &[String]) -> Command {
    if args.is_empty() {
        return Command::Help;
    }

    let id = || args.get(1).cloned().unwrap_or_default();

    match args[0].as_str() {
        "help" | "--help" | "-h" => Command::Help,
        "version" | "--version" | "-v" => Command::Version,
        "reload" => Command::Reload,
        "proc-list" | "ps" => Command::ProcList,
        "proc-start" | "start" => Command::ProcStart(id()),
        "proc-stop" | "stop" => Command::ProcStop(id()),
        "proc-restart" | "restart" => Command::ProcRestart(id()),
        _ => Command::Help,
    }
}

fn print_reload(response: &Value) {
    let count = |key: &str| response.get(key).and_then(Value::as_u64).unwrap_or(0);
    println!(
        "Reloaded: {} hosts added, {} skipped, {} processes added, {} skipped",
        count("hosts_added"),
        count("hosts_skipped"),
        count("processes_added"),
        count("processes_skipped")
    );
    if let Some(errors) = response.get("errors").and_then(Value::as_array) {
        for error in errors.iter().filter_map(Value::as_str) {
            println!("  ! {}", error);
        }
    }
}

/// Run a process operation, then fetch the process table it changed
fn process_command(client: &ControlClient, name: &str, id: &str) -> Result<String> {
    client.request(name, json!({ "id": id }))?;
    Ok(render_processes(&client.request("proc-list", json!({}))?))
}

fn render_processes(response: &Value) -> String {
    let processes = response.as_array().map(Vec::as_slice).unwrap_or(&[]);
    if processes.is_empty() {
        return "No processes configured\n".to_string();
    }

    let mut out = format!("  {:24} {:10} {}\n", "ID", "STATE", "RESTARTS");
    out.push_str("  ──────────────────────────────────────────────\n");
    for process in processes {
        out.push_str(&format!(
            "  {:24} {:10} {}\n",
            process.get("id").and_then(Value::as_str).unwrap_or("-"),
            process.get("state").and_then(Value::as_str).unwrap_or("-"),
            process.get("restarts").and_then(Value::as_u64).unwrap_or(0)
        ));
    }
    out
}

fn print_help() {
    println!(r#"
tlsproxyctl - control a running tlsproxy daemon

USAGE:
    tlsproxyctl <command> [id]

COMMANDS:
    reload                   Add hosts and processes from new site files
    proc-list                List supervised processes
    proc-start <id>          Start a stopped process
    proc-stop <id>           Stop a running process
    proc-restart <id>        Restart a process

    help                     Show this help
    version                  Show client and daemon versions

ENVIRONMENT:
    PROXY_CONF               Configuration directory (default: {})
"#, tlsproxy::config::DEFAULT_CONF_DIR);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command(&[]), Command::Help);
        assert_eq!(parse_command(&args(&["reload"])), Command::Reload);
        assert_eq!(parse_command(&args(&["ps"])), Command::ProcList);
        assert_eq!(
            parse_command(&args(&["proc-restart", "api"])),
            Command::ProcRestart("api".to_string())
        );
        assert_eq!(parse_command(&args(&["proc-stop"])), Command::ProcStop(String::new()));
        assert_eq!(parse_command(&args(&["bogus"])), Command::Help);
    }

    #[test]
    fn test_render_processes() {
        let table = render_processes(&json!([
            { "id": "api", "state": "running", "restarts": 2 },
            { "id": "worker", "state": "stopped", "restarts": 0 },
        ]));
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("STATE"));
        assert!(lines[2].starts_with("  api") && lines[2].contains("running") && lines[2].ends_with('2'));
        assert!(lines[3].contains("worker") && lines[3].contains("stopped"));

        assert_eq!(render_processes(&json!([])), "No processes configured\n");
    }

    /// Answer each connection with the next canned reply, recording request names
    fn fake_daemon(path: &std::path::Path, replies: Vec<Value>) -> std::thread::JoinHandle<Vec<String>> {
        let listener = std::os::unix::net::UnixListener::bind(path).unwrap();
        std::thread::spawn(move || {
            let mut names = Vec::new();
            for reply in replies {
                let (stream, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                let request: Value = serde_json::from_str(&line).unwrap();
                names.push(request["name"].as_str().unwrap().to_string());
                writeln!(&stream, "{}", reply).unwrap();
            }
            names
        })
    }

    #[test]
    fn test_process_command_shows_updated_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let daemon = fake_daemon(
            &path,
            vec![
                json!({}),
                json!([{ "id": "api", "state": "stopped", "restarts": 0 }]),
            ],
        );

        let client = ControlClient::new(path.clone());
        let output = process_command(&client, "proc-stop", "api").unwrap();
        assert!(output.contains("api") && output.contains("stopped"));
        assert_eq!(daemon.join().unwrap(), vec!["proc-stop", "proc-list"]);
    }

    #[test]
    fn test_process_command_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl.sock");
        let daemon = fake_daemon(&path, vec![json!({ "error": "process nope doesn't exist" })]);

        let client = ControlClient::new(path);
        let err = process_command(&client, "proc-start", "nope").unwrap_err();
        assert_eq!(err.to_string(), "process nope doesn't exist");
        assert_eq!(daemon.join().unwrap(), vec!["proc-start"]);
    }
}
