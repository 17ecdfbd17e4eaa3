use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use ipcloop_frame::Message;
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct MessageOutput<'a> {
    schema_id: &'a str,
    seq: usize,
    type_name: &'a str,
    body_size: usize,
    body: String,
    timestamp: String,
}

/// Print one received message. `seq` counts messages since the listener started.
pub fn print_message(msg: &Message, seq: usize, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let out = MessageOutput {
                schema_id: "https://schemas.3leaps.dev/ipcloop/cli/v1/message-received.schema.json",
                seq,
                type_name: msg.type_name(),
                body_size: msg.body().len(),
                body: body_preview(msg),
                timestamp: now_unix_seconds(),
            };
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["SEQ", "TYPE", "SIZE", "BODY"])
                .add_row(vec![
                    seq.to_string(),
                    msg.type_name().to_string(),
                    msg.body().len().to_string(),
                    body_preview(msg),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "#{seq} type={} size={} body={}",
                msg.type_name(),
                msg.body().len(),
                body_preview(msg)
            );
        }
        OutputFormat::Raw => {
            print_raw(msg.body().as_ref());
        }
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

/// Human-readable body: decoded text for string messages, UTF-8 text when
/// possible, otherwise a size marker.
fn body_preview(msg: &Message) -> String {
    if let Ok(text) = msg.decode::<String>() {
        return text;
    }
    match std::str::from_utf8(msg.body()) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", msg.body().len()),
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
