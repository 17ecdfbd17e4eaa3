mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;
use ipcloop_channel::ChannelConfig;
use ipcloop_frame::DEFAULT_MAX_FRAME_SIZE;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "ipcloop", version, about = "Framed IPC channel CLI")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(
        long,
        value_name = "LEVEL",
        default_value = "info",
        env = "IPCLOOP_LOG_LEVEL",
        global = true
    )]
    log_level: LogLevel,

    /// Largest frame accepted or sent, header included, in bytes.
    #[arg(
        long,
        value_name = "BYTES",
        default_value_t = DEFAULT_MAX_FRAME_SIZE,
        env = "IPCLOOP_MAX_FRAME_SIZE",
        global = true
    )]
    max_frame_size: usize,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let config = ChannelConfig {
        max_frame_size: cli.max_frame_size,
        ..ChannelConfig::default()
    };
    let result = cmd::run(cli.command, format, config);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_send_subcommand() {
        let cli = Cli::try_parse_from([
            "ipcloop",
            "send",
            "/tmp/test.sock",
            "--type",
            "app.note",
            "--data",
            "hello",
        ])
        .expect("send args should parse");

        assert!(matches!(cli.command, Command::Send(_)));
        assert_eq!(cli.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
    }

    #[test]
    fn rejects_conflicting_payload_args() {
        let err = Cli::try_parse_from([
            "ipcloop",
            "send",
            "/tmp/test.sock",
            "--json",
            "{\"x\":1}",
            "--data",
            "hello",
        ])
        .expect_err("conflicting args should fail");

        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn parses_listen_with_global_flags() {
        let cli = Cli::try_parse_from([
            "ipcloop",
            "listen",
            "/tmp/test.sock",
            "--count",
            "2",
            "--max-frame-size",
            "4096",
            "--log-level",
            "debug",
        ])
        .expect("listen args should parse");

        assert!(matches!(cli.command, Command::Listen(ref args) if args.count == Some(2)));
        assert_eq!(cli.max_frame_size, 4096);
    }
}
