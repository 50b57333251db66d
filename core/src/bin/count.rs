/*
 * count.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Staffetta, an IMAP client core.
 *
 * Staffetta is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Staffetta is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Staffetta.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Open INBOX and print its message count.
//!
//! Usage: `count <config.xml>`. `RUST_LOG=trace` shows the wire exchange.

use std::path::PathBuf;
use std::process::ExitCode;

use staffetta_core::config::ImapConfig;
use staffetta_core::protocol::imap::{Connection, ImapError};

async fn run(config: &ImapConfig) -> Result<u32, ImapError> {
    let connection = Connection::connect(config).await?;
    if let Some(credentials) = &config.credentials {
        connection.authenticate(credentials).await?;
    }
    let inbox = connection.open_mailbox("INBOX").await?;
    connection.logout().await?;
    Ok(inbox.message_count())
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let path = match std::env::args_os().nth(1) {
        Some(p) => PathBuf::from(p),
        None => {
            eprintln!("usage: count <config.xml>");
            return ExitCode::from(2);
        }
    };
    let config = match ImapConfig::load(&path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(2);
        }
    };
    let status = match run(&config).await {
        Ok(count) => {
            println!("{} messages", count);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    };
    println!("Connection ended");
    status
}
