//! Small filesystem helpers shared by the file-backed stores.

use fleet_core::FleetResult;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::path::Path;
use uuid::Uuid;

/// Bytes that stay literal in a file stem: `[A-Za-z0-9._-]`.
const STEM: &AsciiSet = &NON_ALPHANUMERIC.remove(b'.').remove(b'_').remove(b'-');

/// Encode an identifier as a portable file stem.
///
/// Characters outside `[A-Za-z0-9._-]` are percent-encoded byte by byte, so
/// ids such as `wf-1:conv-9:1700000000` survive on every filesystem.
pub fn file_stem(id: &str) -> String {
    utf8_percent_encode(id, STEM).to_string()
}

/// Inverse of [`file_stem`]. Returns `None` for stems [`file_stem`] could not
/// have produced.
pub fn decode_file_stem(stem: &str) -> Option<String> {
    let id = percent_decode_str(stem).decode_utf8().ok()?.into_owned();
    (file_stem(&id) == stem).then_some(id)
}

/// Write `contents` to `path` via a temp file in the same directory and a rename.
///
/// Readers observe either the old file or the new one, never a partial write.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> FleetResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{name}.{}.tmp", Uuid::new_v4().simple()));

    tokio::fs::write(&tmp, contents).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_file_stem_encodes_colons() {
        assert_eq!(file_stem("wf-1:conv_2:17"), "wf-1%3Aconv_2%3A17");
        assert_eq!(file_stem("plain.id"), "plain.id");
        assert_eq!(file_stem("a/b"), "a%2Fb");
    }

    #[test]
    fn test_decode_inverts_encode() {
        for id in ["wf-1:conv:1", "héllo wörld", "x%y", ""] {
            assert_eq!(decode_file_stem(&file_stem(id)).unwrap(), id);
        }
        assert!(decode_file_stem("bad%Z").is_none());
        assert!(decode_file_stem("a:b").is_none());
        assert!(decode_file_stem("%FF").is_none());
    }

    #[tokio::test]
    async fn test_write_atomic_replaces_contents() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("a.json");
        write_atomic(&path, b"one").await.unwrap();
        write_atomic(&path, b"two").await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "two");

        let mut entries = tokio::fs::read_dir(tmp.path()).await.unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 1);
    }
}
