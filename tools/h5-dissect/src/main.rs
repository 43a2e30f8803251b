//! Three-wire UART link dissector for raw captures.

mod dissect;

use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use clap::Parser;
use dissect::Dissected;
use rtk_attach::h5::FrameCodec;
use std::path::PathBuf;
use tokio_util::codec::Decoder;

/// Decode and describe every frame in a captured byte stream
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Capture file: raw bytes, or hex text with --hex-input
    input: PathBuf,

    /// Show payload hex for each frame
    #[arg(short = 'x', long)]
    hex: bool,

    /// Input is whitespace-separated hex text; '#' starts a comment
    #[arg(long)]
    hex_input: bool,

    /// Enable debug logging
    #[arg(short = 'd', long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("h5_dissect=debug".parse()?)
                    .add_directive("rtk_attach=trace".parse()?),
            )
            .init();
    }

    let raw = std::fs::read(&args.input)
        .with_context(|| format!("Failed to read capture file: {:?}", args.input))?;

    let bytes = if args.hex_input {
        let text = String::from_utf8(raw).context("Hex capture is not UTF-8")?;
        parse_hex(&text)?
    } else {
        raw
    };
    tracing::debug!(bytes = bytes.len(), "Capture loaded");

    let (entries, trailing) = dissect_all(&bytes)?;
    for entry in &entries {
        println!("{}", dissect::format(entry, args.hex));
    }
    if trailing {
        println!("(capture ends inside a frame)");
    }

    Ok(())
}

/// Run the whole capture through the link decoder.
///
/// Returns every frame and malformed frame in order, and whether the capture
/// ended part way through a frame.
fn dissect_all(capture: &[u8]) -> Result<(Vec<Dissected>, bool)> {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from(capture);
    let mut entries = Vec::new();

    while let Some(item) = codec.decode(&mut buf)? {
        let index = entries.len() + 1;
        entries.push(match item {
            Ok(frame) => Dissected::Frame { index, frame },
            Err(error) => Dissected::Malformed { index, error },
        });
    }

    Ok((entries, codec.in_frame()))
}

fn parse_hex(text: &str) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    for line in text.lines() {
        let line = line.split('#').next().unwrap_or_default();
        for token in line.split_whitespace() {
            let digits = token.trim_start_matches("0x").trim_start_matches("0X");
            if digits.len() != 2 {
                bail!("Not a hex byte: {token:?}");
            }
            let byte = u8::from_str_radix(digits, 16)
                .with_context(|| format!("Not a hex byte: {token:?}"))?;
            bytes.push(byte);
        }
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_text_with_comments() {
        let text = "c0 00 01 03 00  # reset\n0x03 0x0c 00 0d c0\n";
        assert_eq!(
            parse_hex(text).unwrap(),
            vec![0xc0, 0x00, 0x01, 0x03, 0x00, 0x03, 0x0c, 0x00, 0x0d, 0xc0]
        );
    }

    #[test]
    fn bad_hex_token_is_an_error() {
        assert!(parse_hex("c0 zz").is_err());
        assert!(parse_hex("c00").is_err());
    }

    #[test]
    fn malformed_frame_does_not_stop_dissection() {
        let capture = [
            0xc0, 0x00, 0x04, 0x00, 0x00, 0x04, 0x55, // no end delimiter
            0xc0, 0x00, 0x01, 0x03, 0x00, 0x03, 0x0c, 0x00, 0x0d, 0xc0, // reset
            0xc0, 0x00, 0x04, // truncated
        ];

        let (entries, trailing) = dissect_all(&capture).unwrap();

        assert_eq!(entries.len(), 2);
        assert!(matches!(entries[0], Dissected::Malformed { index: 1, .. }));
        assert!(matches!(entries[1], Dissected::Frame { index: 2, .. }));
        assert!(trailing);
    }
}
