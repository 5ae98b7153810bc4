//! CLI argument parsing and startup utilities
//!
//! Handles command-line argument parsing, usage text, and the
//! `--profile` startup trace.

use std::env;
use std::process;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{bail, Result};

/// Parsed command-line arguments
#[derive(Clone, Debug)]
pub struct Args {
    /// Path of the source terminal device (mandatory positional)
    pub source: String,
    /// Endpoint count override, if given on the command line
    pub count: Option<usize>,
    /// Default endpoint override, if given on the command line
    pub default_endpoint: Option<usize>,
    /// Sticky-selection override (`--sticky` / `--no-sticky`)
    pub sticky: Option<bool>,
    /// Persist the resolved count/default/sticky values as the new
    /// config-file defaults
    pub save_defaults: bool,
    /// Print a startup trace to stderr
    pub profile: bool,
}

/// Outcome of parsing: either run with arguments or show help.
#[derive(Clone, Debug)]
pub enum Command {
    Run(Args),
    Help,
}

/// Parse command-line arguments, exiting on bad input or `--help`.
pub fn parse_args() -> Args {
    match parse_from(env::args().skip(1)) {
        Ok(Command::Run(args)) => args,
        Ok(Command::Help) => {
            println!("{}", usage());
            process::exit(0);
        }
        Err(err) => {
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("{}", usage());
            process::exit(1);
        }
    }
}

fn parse_from(args: impl Iterator<Item = String>) -> Result<Command> {
    let mut positionals: Vec<String> = Vec::new();
    let mut sticky = None;
    let mut save_defaults = false;
    let mut profile = false;

    for arg in args {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Command::Help),
            "--sticky" => sticky = Some(true),
            "--no-sticky" => sticky = Some(false),
            "--save-defaults" => save_defaults = true,
            "--profile" => profile = true,
            _ if arg.starts_with('-') => bail!("unknown option: {arg}"),
            _ => positionals.push(arg),
        }
    }

    if positionals.is_empty() {
        bail!("missing source device path");
    }
    if positionals.len() > 3 {
        bail!("unexpected argument: {}", positionals[3]);
    }

    let mut positionals = positionals.into_iter();
    let source = positionals.next().unwrap_or_default();
    let count = positionals
        .next()
        .map(|v| parse_number(&v, "endpoint count"))
        .transpose()?;
    let default_endpoint = positionals
        .next()
        .map(|v| parse_number(&v, "default endpoint"))
        .transpose()?;

    Ok(Command::Run(Args {
        source,
        count,
        default_endpoint,
        sticky,
        save_defaults,
        profile,
    }))
}

fn parse_number(value: &str, what: &str) -> Result<usize> {
    match value.parse::<usize>() {
        Ok(n) => Ok(n),
        Err(_) => bail!("invalid {what}: {value}"),
    }
}

pub fn usage() -> String {
    "\
Usage: ptmux [OPTIONS] DEVICE [COUNT] [DEFAULT]

Multiplexes the terminal device DEVICE across COUNT pseudoterminal
endpoints. A source byte below COUNT selects the endpoint that receives
the next byte; all other bytes are routed data. Endpoint output is merged
back onto DEVICE unmodified. The allocated endpoint paths are printed to
stdout, one per line, before forwarding starts.

Arguments:
  DEVICE     source terminal device path
  COUNT      number of endpoints to allocate (default 2)
  DEFAULT    endpoint used when no selector is pending (default 0)

Options:
      --sticky          keep a selection until the next selector byte
      --no-sticky       revert to the default endpoint after each routed byte
      --save-defaults   persist COUNT, DEFAULT, and stickiness to
                        ~/.ptmux/config.toml for future runs
      --profile         print a startup trace to stderr
  -h, --help            print this help"
        .to_string()
}

/// Startup trace for measuring setup cost.
/// Enabled with --profile. Dumps to stderr before the forwarding loop
/// starts (stdout is reserved for the endpoint path report).
#[derive(Clone)]
pub struct DebugTimer {
    enabled: bool,
    start: Instant,
    logs: Arc<Mutex<Vec<String>>>,
}

impl DebugTimer {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            start: Instant::now(),
            logs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn log(&self, msg: &str) {
        if !self.enabled {
            return;
        }
        let mut guard = self.logs.lock().unwrap_or_else(|p| p.into_inner());
        guard.push(format!(
            "+{:>6}ms  {}",
            self.start.elapsed().as_millis(),
            msg
        ));
    }

    pub fn dump(&self) {
        if !self.enabled {
            return;
        }
        let lines = self.logs.lock().unwrap_or_else(|p| p.into_inner()).clone();
        if lines.is_empty() {
            return;
        }
        eprintln!("Startup trace:");
        for line in &lines {
            eprintln!("  {}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Command> {
        parse_from(args.iter().map(|s| s.to_string()))
    }

    fn parse_run(args: &[&str]) -> Args {
        match parse(args).unwrap() {
            Command::Run(args) => args,
            Command::Help => panic!("expected Run, got Help"),
        }
    }

    #[test]
    fn test_device_only() {
        let args = parse_run(&["/dev/ttyUSB0"]);
        assert_eq!(args.source, "/dev/ttyUSB0");
        assert_eq!(args.count, None);
        assert_eq!(args.default_endpoint, None);
        assert_eq!(args.sticky, None);
        assert!(!args.profile);
    }

    #[test]
    fn test_all_positionals() {
        let args = parse_run(&["/dev/ttyS0", "4", "1"]);
        assert_eq!(args.source, "/dev/ttyS0");
        assert_eq!(args.count, Some(4));
        assert_eq!(args.default_endpoint, Some(1));
    }

    #[test]
    fn test_flags() {
        let args = parse_run(&["--sticky", "--profile", "/dev/ttyS0"]);
        assert_eq!(args.sticky, Some(true));
        assert!(args.profile);

        let args = parse_run(&["/dev/ttyS0", "--no-sticky"]);
        assert_eq!(args.sticky, Some(false));
    }

    #[test]
    fn test_save_defaults_flag() {
        let args = parse_run(&["/dev/ttyS0"]);
        assert!(!args.save_defaults);

        let args = parse_run(&["--save-defaults", "/dev/ttyS0", "4"]);
        assert!(args.save_defaults);
    }

    #[test]
    fn test_help() {
        assert!(matches!(parse(&["--help"]).unwrap(), Command::Help));
        assert!(matches!(parse(&["-h", "/dev/ttyS0"]).unwrap(), Command::Help));
    }

    #[test]
    fn test_missing_device_is_an_error() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["--sticky"]).is_err());
    }

    #[test]
    fn test_unknown_option_is_an_error() {
        assert!(parse(&["--frobnicate", "/dev/ttyS0"]).is_err());
    }

    #[test]
    fn test_non_numeric_count_is_an_error() {
        let err = parse(&["/dev/ttyS0", "two"]).unwrap_err();
        assert!(err.to_string().contains("endpoint count"));
    }

    #[test]
    fn test_extra_positional_is_an_error() {
        assert!(parse(&["/dev/ttyS0", "2", "0", "surplus"]).is_err());
    }
}
