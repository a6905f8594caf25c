//! Minimal SCP engine.
//!
//! Serves `scp -t` (sink, client uploads) and `scp -f` (source, client
//! downloads) for single files over the session channel, against the
//! user's virtual file system. Recursive mode is refused with a protocol
//! error; timestamp messages are acknowledged and ignored.

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info};

use sandpiper_core::OpenParams;

use crate::commands::CommandSession;
use crate::error::{Error, Result};

const SCP_OK: u8 = 0x00;
const SCP_FATAL: u8 = 0x02;

const COPY_BUFFER: usize = 64 * 1024;

#[derive(Debug, Default, PartialEq, Eq)]
struct ScpOptions {
    sink: bool,
    source: bool,
    recursive: bool,
    preserve: bool,
    dirs_only: bool,
    target: String,
}

fn parse_args(args: &[String]) -> Result<ScpOptions> {
    let mut options = ScpOptions::default();
    let mut target = None;
    for arg in args {
        if let Some(flags) = arg.strip_prefix('-') {
            for flag in flags.chars() {
                match flag {
                    't' => options.sink = true,
                    'f' => options.source = true,
                    'r' => options.recursive = true,
                    'p' => options.preserve = true,
                    'd' => options.dirs_only = true,
                    'v' | 'q' => {}
                    other => {
                        return Err(Error::Command(format!("scp: unsupported option -{other}")))
                    }
                }
            }
        } else {
            target = Some(arg.clone());
        }
    }
    options.target = target.ok_or_else(|| Error::Command("scp: missing target".to_string()))?;
    if options.sink == options.source {
        return Err(Error::Command(
            "scp: exactly one of -t and -f is required".to_string(),
        ));
    }
    if options.recursive {
        return Err(Error::Command(
            "scp: recursive mode is not supported".to_string(),
        ));
    }
    Ok(options)
}

/// Parse a `Cmmmm <size> <name>` control line (the leading `C` is
/// already consumed).
fn parse_copy_header(line: &str) -> Result<(u32, u64, String)> {
    let mut fields = line.trim_end().splitn(3, ' ');
    let mode = fields
        .next()
        .and_then(|m| u32::from_str_radix(m, 8).ok())
        .ok_or_else(|| Error::Command(format!("scp: invalid mode in {line:?}")))?;
    let size = fields
        .next()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| Error::Command(format!("scp: invalid size in {line:?}")))?;
    let name = fields
        .next()
        .filter(|n| !n.is_empty() && !n.contains('/'))
        .ok_or_else(|| Error::Command(format!("scp: invalid name in {line:?}")))?;
    Ok((mode, size, name.to_string()))
}

/// Run an scp command to completion.
pub async fn execute(args: &[String], session: &mut CommandSession) -> Result<()> {
    let options = match parse_args(args) {
        Ok(options) => options,
        Err(e) => {
            // protocol errors travel in-band
            let mut writer = session.channel.make_writer();
            let _ = writer
                .write_all(&error_message(&e.to_string()))
                .await;
            return Err(e);
        }
    };
    info!(
        connection_id = %session.connection_id,
        username = %session.username,
        target = %options.target,
        mode = if options.sink { "sink" } else { "source" },
        "scp transfer starting"
    );
    let result = if options.sink {
        run_sink(&options, session).await
    } else {
        run_source(&options, session).await
    };
    if let Err(e) = &result {
        let mut writer = session.channel.make_writer();
        let _ = writer.write_all(&error_message(&e.to_string())).await;
    }
    result
}

fn error_message(message: &str) -> Vec<u8> {
    let mut out = vec![SCP_FATAL];
    out.extend_from_slice(b"scp: ");
    out.extend_from_slice(message.as_bytes());
    out.push(b'\n');
    out
}

/// Receive files from the client.
async fn run_sink(options: &ScpOptions, session: &mut CommandSession) -> Result<()> {
    let target_is_dir = session
        .vfs
        .metadata(&options.target)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    if options.dirs_only && !target_is_dir {
        return Err(Error::Command(format!(
            "scp: {}: not a directory",
            options.target
        )));
    }

    let mut writer = session.channel.make_writer();
    let mut reader = BufReader::new(session.channel.make_reader());
    writer.write_all(&[SCP_OK]).await?;
    writer.flush().await?;

    loop {
        let mut control = Vec::new();
        let n = reader.read_until(b'\n', &mut control).await?;
        if n == 0 {
            break;
        }
        match control[0] {
            b'C' => {
                let line = String::from_utf8_lossy(&control[1..]).to_string();
                let (_mode, size, name) = parse_copy_header(&line)?;
                let path = if target_is_dir {
                    format!("{}/{}", options.target.trim_end_matches('/'), name)
                } else {
                    options.target.clone()
                };
                debug!(path = %path, size, "scp sink receiving file");
                let mut file = session
                    .vfs
                    .open(
                        &path,
                        OpenParams {
                            write: true,
                            create: true,
                            truncate: true,
                            ..Default::default()
                        },
                    )
                    .await?;
                writer.write_all(&[SCP_OK]).await?;
                writer.flush().await?;

                let mut remaining = size;
                let mut buffer = vec![0u8; COPY_BUFFER];
                while remaining > 0 {
                    let want = remaining.min(buffer.len() as u64) as usize;
                    let got = reader.read(&mut buffer[..want]).await?;
                    if got == 0 {
                        return Err(Error::Command("scp: premature end of stream".to_string()));
                    }
                    file.write_all(&buffer[..got]).await?;
                    remaining -= got as u64;
                }
                file.flush().await?;

                let mut trailer = [0u8; 1];
                reader.read_exact(&mut trailer).await?;
                if trailer[0] != SCP_OK {
                    return Err(Error::Command("scp: transfer failed".to_string()));
                }
                writer.write_all(&[SCP_OK]).await?;
                writer.flush().await?;
            }
            b'T' => {
                // timestamps are not applied, but the message is part of
                // the -p flow and must be acknowledged
                writer.write_all(&[SCP_OK]).await?;
                writer.flush().await?;
            }
            b'E' => {
                writer.write_all(&[SCP_OK]).await?;
                writer.flush().await?;
            }
            b'D' => {
                return Err(Error::Command(
                    "scp: directory transfers require recursive mode".to_string(),
                ));
            }
            0x01 | 0x02 => {
                let message = String::from_utf8_lossy(&control[1..]).trim().to_string();
                return Err(Error::Command(format!("scp: remote error: {message}")));
            }
            other => {
                return Err(Error::Command(format!(
                    "scp: unexpected control byte {other:#04x}"
                )));
            }
        }
    }
    Ok(())
}

/// Send a file to the client.
async fn run_source(options: &ScpOptions, session: &mut CommandSession) -> Result<()> {
    let metadata = session.vfs.metadata(&options.target).await?;
    if metadata.is_dir() {
        return Err(Error::Command(format!(
            "scp: {}: is a directory, recursive mode is not supported",
            options.target
        )));
    }
    let size = metadata.len();
    let mode = file_mode(&metadata);
    let name = options
        .target
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .unwrap_or("file")
        .to_string();

    let mut file = session
        .vfs
        .open(
            &options.target,
            OpenParams {
                read: true,
                ..Default::default()
            },
        )
        .await?;

    let mut writer = session.channel.make_writer();
    let mut reader = BufReader::new(session.channel.make_reader());

    expect_ack(&mut reader).await?;
    let header = format!("C{mode:04o} {size} {name}\n");
    debug!(header = %header.trim(), "scp source sending file");
    writer.write_all(header.as_bytes()).await?;
    writer.flush().await?;
    expect_ack(&mut reader).await?;

    let mut buffer = vec![0u8; COPY_BUFFER];
    let mut sent: u64 = 0;
    while sent < size {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            return Err(Error::Command("scp: file truncated during read".to_string()));
        }
        writer.write_all(&buffer[..n]).await?;
        sent += n as u64;
    }
    writer.write_all(&[SCP_OK]).await?;
    writer.flush().await?;
    expect_ack(&mut reader).await?;
    Ok(())
}

async fn expect_ack<R>(reader: &mut R) -> Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut ack = [0u8; 1];
    reader.read_exact(&mut ack).await?;
    if ack[0] == SCP_OK {
        Ok(())
    } else {
        Err(Error::Command(format!(
            "scp: client rejected transfer, code {:#04x}",
            ack[0]
        )))
    }
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o777
}

#[cfg(not(unix))]
fn file_mode(_metadata: &std::fs::Metadata) -> u32 {
    0o644
}
