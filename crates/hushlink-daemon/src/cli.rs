//! Command-line argument parsing.
//!
//! The daemon takes a handful of flags; everything else lives in the
//! data directory. Parsing is by hand — the surface is small enough
//! that an argument-parser dependency would outweigh it.

use std::path::PathBuf;

/// Parsed command-line arguments.
///
/// `--login` / `--interface` / `--port` only matter on first run:
/// they initialize `identity.json` when it does not exist yet.
pub struct CliArgs {
    /// `--data-dir <PATH>` — state directory (default `.`).
    pub data_dir: Option<PathBuf>,
    /// `--multicast <ADDR:PORT>` — beacon group override.
    pub multicast: Option<String>,
    /// `--no-beacon` — disable multicast discovery.
    pub no_beacon: bool,
    /// `--login <NAME>` — identity bootstrap.
    pub login: Option<String>,
    /// `--interface <IP>` — identity bootstrap.
    pub interface: Option<String>,
    /// `--port <PORT>` — identity bootstrap.
    pub port: Option<u16>,
}

impl CliArgs {
    /// Parses from `std::env::args`.
    pub fn parse_from_env() -> Self {
        let args: Vec<String> = std::env::args().collect();
        Self::parse(&args[1..])
    }

    /// Parses from a slice of arguments (without the program name).
    pub fn parse(args: &[String]) -> Self {
        let mut cli = Self {
            data_dir: None,
            multicast: None,
            no_beacon: false,
            login: None,
            interface: None,
            port: None,
        };

        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--data-dir" => {
                    i += 1;
                    cli.data_dir = args.get(i).map(PathBuf::from);
                }
                "--multicast" => {
                    i += 1;
                    cli.multicast = args.get(i).cloned();
                }
                "--no-beacon" => {
                    cli.no_beacon = true;
                }
                "--login" => {
                    i += 1;
                    cli.login = args.get(i).cloned();
                }
                "--interface" => {
                    i += 1;
                    cli.interface = args.get(i).cloned();
                }
                "--port" => {
                    i += 1;
                    cli.port = args.get(i).and_then(|s| s.parse().ok());
                }
                other => {
                    tracing::warn!(flag = other, "ignoring unknown flag");
                }
            }
            i += 1;
        }

        cli
    }
}
