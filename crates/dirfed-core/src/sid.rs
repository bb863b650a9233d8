//! Windows-style security identifier codec shared by domain-directory backends

/// Revision byte, sub-authority count byte, 6-byte authority.
const SID_HEADER_LEN: usize = 8;

/// Converts a binary security identifier into its `S-R-A-S1-S2-...` string form.
///
/// Layout: revision (1 byte), sub-authority count (1 byte), identifier
/// authority (6 bytes, big-endian), then `count` little-endian u32
/// sub-authorities. Returns `None` for truncated input.
pub fn format_binary_sid(bytes: &[u8]) -> Option<String> {
    if bytes.len() < SID_HEADER_LEN {
        return None;
    }

    let revision = bytes[0];
    let count = bytes[1] as usize;
    if bytes.len() < SID_HEADER_LEN + count * 4 {
        return None;
    }

    let authority = bytes[2..SID_HEADER_LEN]
        .iter()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));

    let mut out = format!("S-{}-{}", revision, authority);
    for chunk in bytes[SID_HEADER_LEN..SID_HEADER_LEN + count * 4].chunks_exact(4) {
        let sub = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        out.push('-');
        out.push_str(&sub.to_string());
    }

    Some(out)
}

/// Syntactic check used as the SID-lookup pre-filter by AD-style providers.
pub fn looks_like_windows_sid(sid: &str) -> bool {
    sid.starts_with("S-1-") || sid.starts_with("S-2-")
}
