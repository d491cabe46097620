//! Standalone executables: a host binary with an artifact appended behind
//! framing markers. At startup the binary scans backwards from
//! end-of-file for the end marker and loads the embedded artifact;
//! without markers it expects an artifact path on its command line.

use std::fs;
use std::path::Path;

use crate::error::ArtifactError;

pub const DATA_START: &[u8] = b"__DROEBC_DATA_START__";
pub const DATA_END: &[u8] = b"__DROEBC_DATA_END__";

/// Append `artifact` to a copy of `host_binary` at `output`:
/// start marker, u64-LE length, artifact bytes, end marker.
pub fn embed(host_binary: &Path, artifact: &[u8], output: &Path) -> Result<(), ArtifactError> {
    let mut data = fs::read(host_binary)?;
    data.extend_from_slice(DATA_START);
    data.extend_from_slice(&(artifact.len() as u64).to_le_bytes());
    data.extend_from_slice(artifact);
    data.extend_from_slice(DATA_END);
    fs::write(output, data)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut permissions = fs::metadata(output)?.permissions();
        permissions.set_mode(0o755);
        fs::set_permissions(output, permissions)?;
    }

    Ok(())
}

/// Extract an embedded artifact from executable bytes, if present.
/// Markers are searched from the end so the marker constants inside the
/// host binary itself cannot produce false positives.
pub fn extract(exe: &[u8]) -> Result<Option<Vec<u8>>, ArtifactError> {
    let Some(end_at) = rfind(exe, DATA_END) else {
        return Ok(None);
    };
    let Some(start_at) = rfind(&exe[..end_at], DATA_START) else {
        return Ok(None);
    };

    let length_at = start_at + DATA_START.len();
    let data_at = length_at + 8;
    if data_at > end_at {
        return Err(ArtifactError::Truncated("embedded length field is cut off"));
    }
    let mut length_bytes = [0u8; 8];
    length_bytes.copy_from_slice(&exe[length_at..data_at]);
    let length = u64::from_le_bytes(length_bytes) as usize;

    if data_at.checked_add(length) != Some(end_at) {
        return Err(ArtifactError::Truncated(
            "embedded length does not match the framed data",
        ));
    }
    Ok(Some(exe[data_at..end_at].to_vec()))
}

/// Extract from the running executable.
pub fn extract_from_current_exe() -> Result<Option<Vec<u8>>, ArtifactError> {
    let exe_path = std::env::current_exe()?;
    let exe = fs::read(exe_path)?;
    extract(&exe)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .rposition(|window| window == needle)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn frame(host: &[u8], artifact: &[u8]) -> Vec<u8> {
        let mut out = host.to_vec();
        out.extend_from_slice(DATA_START);
        out.extend_from_slice(&(artifact.len() as u64).to_le_bytes());
        out.extend_from_slice(artifact);
        out.extend_from_slice(DATA_END);
        out
    }

    #[test]
    fn round_trip_through_framing() {
        let framed = frame(b"HOSTBINARY", b"artifact-bytes");
        let extracted = extract(&framed).unwrap().unwrap();
        assert_eq!(extracted, b"artifact-bytes");
    }

    #[test]
    fn plain_binary_has_no_artifact() {
        assert!(extract(b"just a normal executable").unwrap().is_none());
    }

    #[test]
    fn marker_inside_host_does_not_confuse_the_scan() {
        // The host binary itself contains the markers (as this crate's
        // own binary does); the last frame wins.
        let mut host = b"prefix".to_vec();
        host.extend_from_slice(DATA_START);
        host.extend_from_slice(DATA_END);
        let framed = frame(&host, b"real");
        assert_eq!(extract(&framed).unwrap().unwrap(), b"real");
    }

    #[test]
    fn corrupt_length_is_rejected() {
        let mut framed = frame(b"HOST", b"abcdef");
        // Flip a byte of the little-endian length field.
        let length_at = b"HOST".len() + DATA_START.len();
        framed[length_at] ^= 0xFF;
        assert!(matches!(
            extract(&framed),
            Err(ArtifactError::Truncated(_))
        ));
    }
}
