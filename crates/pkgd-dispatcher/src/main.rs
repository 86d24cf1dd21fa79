//! Stub backend dispatcher.
//!
//! Serves one request from its argv, then one tab-delimited request per
//! stdin line, writing newline-framed responses to stdout. The literal line
//! `exit` (or EOF on stdin) ends the loop. Diagnostics go to stderr, which
//! the daemon leaves attached to its own.

mod request;

use anyhow::Result;
use request::Request;
use std::io::{self, BufRead, Write};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    if !args.is_empty() {
        serve(&Request::from_fields(&args), &mut out)?;
    }

    for line in io::stdin().lock().lines() {
        let line = line?;
        if line == "exit" {
            tracing::debug!("dispatcher asked to exit");
            break;
        }
        serve(&Request::from_line(&line), &mut out)?;
    }
    Ok(())
}

/// Write the response and flush: the daemon frames on newlines, so a
/// buffered partial response would stall it.
fn serve(request: &Request, out: &mut impl Write) -> Result<()> {
    tracing::debug!(?request, "serving request");
    for line in request.respond() {
        writeln!(out, "{line}")?;
    }
    out.flush()?;
    Ok(())
}
