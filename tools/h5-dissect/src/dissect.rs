//! Interpretation of decoded frames.

use rtk_attach::h5::{Frame, FramingError, PacketType};
use rtk_attach::hci::{opcode_name, CommandComplete, CommandPacket, EVT_COMMAND_COMPLETE};
use rtk_attach::tracing::HexBytes;

/// One entry of the dissection, in capture order.
#[derive(Debug)]
pub enum Dissected {
    Frame { index: usize, frame: Frame },
    Malformed { index: usize, error: FramingError },
}

/// Format one entry as a single line.
pub fn format(entry: &Dissected, show_hex: bool) -> String {
    match entry {
        Dissected::Malformed { index, error } => format!("#{index:04} malformed: {error}"),
        Dissected::Frame { index, frame } => {
            let checksum = if frame.checksum_valid() { "ok" } else { "BAD" };
            let mut line = format!(
                "#{index:04} seq={} ack={} {:<8} chk={:<3} {}",
                frame.seq(),
                frame.ack(),
                packet_type_name(frame.packet_type()),
                checksum,
                describe(frame)
            );
            if show_hex {
                line.push_str(&format!("\n      [{}]", HexBytes(frame.payload())));
            }
            line
        }
    }
}

fn packet_type_name(packet_type: PacketType) -> String {
    match packet_type {
        PacketType::Command => "CMD".into(),
        PacketType::AclData => "ACL".into(),
        PacketType::ScoData => "SCO".into(),
        PacketType::Event => "EVT".into(),
        PacketType::Vendor => "VENDOR".into(),
        PacketType::Other(value) => format!("0x{value:x}"),
    }
}

fn describe(frame: &Frame) -> String {
    let payload = frame.payload();
    match frame.packet_type() {
        PacketType::Command => match CommandPacket::parse(payload) {
            Some(cmd) => format!(
                "{} params=[{}]",
                opcode_name(cmd.opcode),
                HexBytes(&cmd.params)
            ),
            None => format!("truncated command ({} bytes)", payload.len()),
        },
        PacketType::Event => match payload.first() {
            Some(&EVT_COMMAND_COMPLETE) => {
                match CommandComplete::parse(payload, frame.checksum_valid()) {
                    Some(cc) => format!(
                        "Command Complete {} status=0x{:02x} return=[{}]",
                        opcode_name(cc.opcode),
                        cc.status,
                        HexBytes(&cc.return_params)
                    ),
                    None => "truncated command complete".into(),
                }
            }
            Some(code) => format!("event 0x{code:02x} ({} bytes)", payload.len()),
            None => "empty event".into(),
        },
        _ => format!("{} bytes", payload.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frame(packet_type: PacketType, payload: &'static [u8]) -> Dissected {
        Dissected::Frame {
            index: 1,
            frame: Frame::new(0, 0, packet_type, Bytes::from_static(payload)).unwrap(),
        }
    }

    #[test]
    fn command_line() {
        let line = format(&frame(PacketType::Command, &[0x03, 0x0c, 0x00]), false);
        assert_eq!(line, "#0001 seq=0 ack=0 CMD      chk=ok  Reset params=[]");
    }

    #[test]
    fn command_complete_line() {
        let line = format(
            &frame(PacketType::Event, &[0x0e, 0x04, 0x01, 0x17, 0xfc, 0x00]),
            false,
        );
        assert!(line.ends_with("Command Complete Vendor Baud Rate status=0x00 return=[]"));
    }

    #[test]
    fn hex_on_second_line() {
        let line = format(&frame(PacketType::Event, &[0x13, 0x00]), true);
        assert!(line.contains("event 0x13 (2 bytes)"));
        assert!(line.ends_with("\n      [13 00]"));
    }

    #[test]
    fn malformed_line() {
        let entry = Dissected::Malformed {
            index: 7,
            error: FramingError::MissingEndDelimiter { found: 0x55 },
        };
        assert_eq!(
            format(&entry, false),
            "#0007 malformed: expected end delimiter, found 0x55"
        );
    }
}
