use super::HEADER_LEN;

/// XOR of every byte in `data`.
pub fn xor(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, byte| acc ^ byte)
}

/// Checksum carried by a frame: the header bytes folded together with the
/// payload bytes.
pub fn frame_checksum(header: &[u8; HEADER_LEN], payload: &[u8]) -> u8 {
    xor(header) ^ xor(payload)
}
