//! The 64-bit command hash recorded in the build log and compared on later
//! runs to detect command changes.

use std::hash::Hasher;

const UNIT_SEPARATOR: u8 = 0x1F;

/// Hash a final command line, folding in response-file content when the edge
/// declares one (a changed response file must dirty the edge even when the
/// command line itself is unchanged).
///
/// Uses the std SipHash with its fixed default keys: the value is persisted,
/// so it must be stable across processes.
pub fn hash_command(cmdline: &str, rspfile_content: Option<&str>) -> u64 {
    let mut h = std::collections::hash_map::DefaultHasher::new();
    h.write(cmdline.as_bytes());
    h.write_u8(UNIT_SEPARATOR);
    if let Some(content) = rspfile_content {
        h.write(content.as_bytes());
        h.write_u8(UNIT_SEPARATOR);
    }
    h.finish()
}
