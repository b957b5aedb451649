//! Process execution
//!
//! Runs a single command line with a fully resolved environment and
//! working directory. The command line is split with quote awareness,
//! `${NAME}` placeholders are merged into each token, and on Windows a
//! `cmd /C` indirection is prepended.
//!
//! Stdout and stderr are drained by two reader threads so neither pipe
//! can block the other while the calling thread waits on process exit.
//! A process that exits 0 but wrote to stderr is not a failure: some
//! tools misuse stderr for progress output, so those bytes are folded
//! into stdout and reported at debug level only.

use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use thiserror::Error;
use tracing::debug;

use super::env::{Envar, EnvError};

/// Errors from command execution
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("no command provided")]
    Empty,

    #[error("unbalanced quote in command: {0}")]
    UnbalancedQuote(String),

    #[error(transparent)]
    Env(#[from] EnvError),

    #[error("cannot start command '{cmd}': {source}")]
    Spawn {
        cmd: String,
        source: std::io::Error,
    },

    #[error("I/O error while running '{cmd}': {source}")]
    Io {
        cmd: String,
        source: std::io::Error,
    },

    #[error("command failed: '{cmd}' ({category}){}", format_stderr(.stderr))]
    Failed {
        cmd: String,
        category: String,
        stderr: String,
    },
}

fn format_stderr(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        String::new()
    } else {
        format!("\n{}", stderr.trim_end())
    }
}

/// Execute a command, streaming its output to this process's stdout and
/// stderr (or inheriting the terminal in interactive mode).
pub fn execute(
    cmd: &str,
    dir: &Path,
    env: &mut Envar,
    interactive: bool,
) -> Result<(), ExecError> {
    run(cmd, dir, env, interactive, true).map(|_| ())
}

/// Execute a command and return its captured stdout.
pub fn execute_with_output(
    cmd: &str,
    dir: &Path,
    env: &mut Envar,
    interactive: bool,
) -> Result<String, ExecError> {
    run(cmd, dir, env, interactive, false)
}

fn run(
    cmd: &str,
    dir: &Path,
    env: &mut Envar,
    interactive: bool,
    stream: bool,
) -> Result<String, ExecError> {
    if cmd.trim().is_empty() {
        return Err(ExecError::Empty);
    }
    let mut tokens = split_command(cmd)?;
    if cfg!(windows) {
        let mut prefixed = vec!["cmd".to_string(), "/C".to_string()];
        prefixed.append(&mut tokens);
        tokens = prefixed;
    }
    // merge ${NAME} placeholders into each token before execution
    let mut merged = Vec::with_capacity(tokens.len());
    for token in &tokens {
        merged.push(env.merge_placeholders(token, interactive)?);
    }

    let mut command = Command::new(&merged[0]);
    command.args(&merged[1..]).current_dir(dir);
    // the full environment is passed, parent variables included
    command.env_clear().envs(env.iter());

    debug!(command = %cmd, dir = %dir.display(), "executing");

    if interactive && stream {
        // hand the terminal to the child
        let status = command.status().map_err(|source| ExecError::Spawn {
            cmd: cmd.to_string(),
            source,
        })?;
        return match exit_category(&status) {
            None => Ok(String::new()),
            Some(category) => Err(ExecError::Failed {
                cmd: cmd.to_string(),
                category,
                stderr: String::new(),
            }),
        };
    }

    command.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = command.spawn().map_err(|source| ExecError::Spawn {
        cmd: cmd.to_string(),
        source,
    })?;

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");

    // one reader thread per pipe so neither can block the other
    let out_handle = spawn_reader(stdout, stream, false);
    let err_handle = spawn_reader(stderr, stream, true);

    let status = child.wait().map_err(|source| ExecError::Io {
        cmd: cmd.to_string(),
        source,
    })?;
    let mut captured_out = out_handle.join().unwrap_or_default();
    let captured_err = err_handle.join().unwrap_or_default();

    match exit_category(&status) {
        None => {
            if !captured_err.is_empty() {
                // exit 0 with stderr output: treat as misdirected stdout
                debug!(
                    command = %cmd,
                    "command succeeded but wrote to stderr; folding it into stdout"
                );
                captured_out.push_str(&captured_err);
            }
            Ok(captured_out)
        }
        Some(category) => Err(ExecError::Failed {
            cmd: cmd.to_string(),
            category,
            stderr: captured_err,
        }),
    }
}

/// Drain a pipe line by line, optionally echoing, returning the bytes.
fn spawn_reader<R>(pipe: R, echo: bool, to_stderr: bool) -> thread::JoinHandle<String>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut reader = BufReader::new(pipe);
        let mut collected = String::new();
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    if echo {
                        if to_stderr {
                            eprint!("{}", line);
                        } else {
                            print!("{}", line);
                        }
                    }
                    collected.push_str(&line);
                }
            }
        }
        collected
    })
}

/// Map an exit status to a human readable category, `None` on success.
fn exit_category(status: &std::process::ExitStatus) -> Option<String> {
    if status.success() {
        return None;
    }
    Some(match status.code() {
        Some(1) => "exit code 1 - general error".to_string(),
        Some(2) => "exit code 2 - misuse of shell built-ins".to_string(),
        Some(126) => "exit code 126 - command invoked cannot execute".to_string(),
        Some(127) => "exit code 127 - command not found".to_string(),
        Some(128) => "exit code 128 - invalid argument to exit".to_string(),
        Some(130) => "exit code 130 - script terminated by CTRL-C".to_string(),
        Some(code) if code > 128 => {
            format!("exit code {} - terminated by signal {}", code, code - 128)
        }
        Some(code) => format!("exit code {}", code),
        None => "terminated by signal".to_string(),
    })
}

/// Split a command line into tokens, honoring single and double quotes.
/// No shell expansion happens here; `${NAME}` merging is a separate,
/// explicit step.
fn split_command(cmd: &str) -> Result<Vec<String>, ExecError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;

    for c in cmd.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_token = true;
                }
                c if c.is_whitespace() => {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                _ => {
                    current.push(c);
                    in_token = true;
                }
            },
        }
    }
    if quote.is_some() {
        return Err(ExecError::UnbalancedQuote(cmd.to_string()));
    }
    if in_token {
        tokens.push(current);
    }
    if tokens.is_empty() {
        return Err(ExecError::Empty);
    }
    Ok(tokens)
}
