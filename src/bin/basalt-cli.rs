//! Interactive client for the Basalt server
//!
//! Speaks the length-prefixed JSON protocol over a blocking socket.
//! Commands: begin, commit, rollback, show tables, show data <t>,
//! analyze <t>, defragment <t>, help, exit; anything else is sent as SQL
//! once it ends with `;`. A statement answered with `queued_for_retry`
//! blocks until the server pushes the follow-up `retried` response.

use std::io::{self, BufRead, Read, Write};
use std::net::TcpStream;
use std::process::ExitCode;

use serde_json::{json, Value};

fn send_frame(stream: &mut TcpStream, body: &Value) -> io::Result<()> {
    let bytes = serde_json::to_vec(body)?;
    stream.write_all(&(bytes.len() as u32).to_be_bytes())?;
    stream.write_all(&bytes)?;
    stream.flush()
}

fn recv_frame(stream: &mut TcpStream) -> io::Result<Value> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header)?;
    let len = u32::from_be_bytes(header) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body)?;
    serde_json::from_slice(&body).map_err(io::Error::from)
}

fn print_rows(rows: &Value) {
    let columns: Vec<String> = rows["columns"]
        .as_array()
        .map(|cols| {
            cols.iter()
                .map(|c| c.as_str().unwrap_or("?").to_string())
                .collect()
        })
        .unwrap_or_default();
    let data = rows["data"].as_array().cloned().unwrap_or_default();

    let cell = |v: &Value| -> String {
        match v {
            Value::Null => "NULL".to_string(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    };

    let mut widths: Vec<usize> = columns.iter().map(|c| c.len()).collect();
    for row in &data {
        if let Some(values) = row.as_array() {
            for (i, v) in values.iter().enumerate() {
                if i < widths.len() {
                    widths[i] = widths[i].max(cell(v).len());
                }
            }
        }
    }

    let header: Vec<String> = columns
        .iter()
        .zip(&widths)
        .map(|(c, w)| format!("{:<width$}", c, width = w))
        .collect();
    println!("{}", header.join(" | "));
    println!("{}", widths.iter().map(|w| "-".repeat(*w)).collect::<Vec<_>>().join("-+-"));
    for row in &data {
        if let Some(values) = row.as_array() {
            let line: Vec<String> = values
                .iter()
                .zip(&widths)
                .map(|(v, w)| format!("{:<width$}", cell(v), width = w))
                .collect();
            println!("{}", line.join(" | "));
        }
    }
    println!("{} row(s)", data.len());
}

fn print_response(response: &Value) {
    if response["retried"].as_bool() == Some(true) {
        println!("(retried follow-up)");
    }
    if response["success"].as_bool() == Some(true) {
        if let Some(rows) = response.get("rows").filter(|r| !r.is_null()) {
            print_rows(rows);
        } else if let Some(n) = response["affected_rows"].as_u64() {
            println!("OK, {} row(s) affected", n);
        } else if let Some(msg) = response["message"].as_str() {
            println!("OK: {}", msg);
        } else {
            println!("OK");
        }
    } else {
        let err = response["error"].as_str().unwrap_or("unknown error");
        if response["queued_for_retry"].as_bool() == Some(true) {
            println!("waiting: {} (queued for automatic retry)", err);
        } else {
            println!("error: {}", err);
        }
    }
}

/// Send a request and print responses, following up on queued retries.
fn round_trip(stream: &mut TcpStream, request: Value) -> io::Result<Value> {
    send_frame(stream, &request)?;
    let mut response = recv_frame(stream)?;
    print_response(&response);
    while response["queued_for_retry"].as_bool() == Some(true) {
        response = recv_frame(stream)?;
        print_response(&response);
    }
    Ok(response)
}

fn print_help() {
    println!("Commands:");
    println!("  begin              start a transaction");
    println!("  commit             commit the current transaction");
    println!("  rollback           roll back the current transaction");
    println!("  show tables        list tables");
    println!("  show data <t>      dump a table");
    println!("  analyze <t>        table statistics");
    println!("  defragment <t>     compact a table");
    println!("  help               this help");
    println!("  exit               quit");
    println!("  <sql>;             execute a SQL statement");
}

fn run() -> io::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let mut addr = "127.0.0.1:5432".to_string();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" | "-a" => {
                if i + 1 < args.len() {
                    addr = args[i + 1].clone();
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    addr = format!("127.0.0.1:{}", args[i + 1]);
                    i += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }

    let mut stream = TcpStream::connect(&addr)?;
    stream.set_nodelay(true)?;
    println!("connected to basalt at {}", addr);
    println!("type 'help' for commands, 'exit' to quit");

    let stdin = io::stdin();
    let mut txid: Option<u64> = None;
    let mut pending_sql = String::new();

    loop {
        if pending_sql.is_empty() {
            match txid {
                Some(t) => print!("basalt[txn {}]> ", t),
                None => print!("basalt> "),
            }
        } else {
            print!("   ...> ");
        }
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break; // EOF
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if pending_sql.is_empty() {
            let lowered = trimmed.to_ascii_lowercase();
            match lowered.as_str() {
                "exit" | "quit" => break,
                "help" => {
                    print_help();
                    continue;
                }
                "begin" => {
                    let response = round_trip(&mut stream, json!({"type": "begin"}))?;
                    txid = response["transaction_id"].as_u64();
                    continue;
                }
                "commit" => match txid.take() {
                    Some(t) => {
                        round_trip(&mut stream, json!({"type": "commit", "transaction_id": t}))?;
                        continue;
                    }
                    None => {
                        println!("error: no open transaction");
                        continue;
                    }
                },
                "rollback" => match txid.take() {
                    Some(t) => {
                        round_trip(
                            &mut stream,
                            json!({"type": "rollback", "transaction_id": t}),
                        )?;
                        continue;
                    }
                    None => {
                        println!("error: no open transaction");
                        continue;
                    }
                },
                _ => {}
            }
            if let Some(table) = lowered.strip_prefix("analyze ") {
                round_trip(
                    &mut stream,
                    json!({"type": "analyze", "table_name": table.trim()}),
                )?;
                continue;
            }
            if let Some(table) = lowered.strip_prefix("defragment ") {
                round_trip(
                    &mut stream,
                    json!({"type": "defragment", "table_name": table.trim()}),
                )?;
                continue;
            }
            if lowered == "show tables" || lowered.starts_with("show data ") {
                let mut request = json!({"type": "execute", "query": trimmed});
                if let Some(t) = txid {
                    request["transaction_id"] = json!(t);
                }
                round_trip(&mut stream, request)?;
                continue;
            }
        }

        // Accumulate SQL until the statement terminator.
        pending_sql.push_str(trimmed);
        pending_sql.push(' ');
        if !trimmed.ends_with(';') {
            continue;
        }
        let sql = std::mem::take(&mut pending_sql);
        let mut request = json!({"type": "execute", "query": sql.trim()});
        if let Some(t) = txid {
            request["transaction_id"] = json!(t);
        }
        round_trip(&mut stream, request)?;
    }

    println!("bye");
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("fatal: {}", e);
            ExitCode::FAILURE
        }
    }
}
