//! Tarball extraction for base images and server-side packages

use std::io::Read;
use std::path::{Component, Path};

/// Returns true if the given bytes start with the gzip magic number (0x1f 0x8b).
pub(crate) fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

/// Safely extract a tar archive, rejecting path traversal and absolute paths.
///
/// Iterates entries manually and validates each path before extraction:
/// - Rejects absolute paths
/// - Rejects entries containing `..` components
/// - Rejects symlinks whose relative target climbs out of the destination
/// - Never writes through a symlink that resolves outside the destination
fn safe_unpack<R: Read>(archive: &mut tar::Archive<R>, dest: &Path) -> Result<(), String> {
    for entry in archive.entries().map_err(|e| e.to_string())? {
        let mut entry = entry.map_err(|e| e.to_string())?;
        let path = entry.path().map_err(|e| e.to_string())?.into_owned();

        if path.is_absolute() {
            return Err(format!("archive contains absolute path: {}", path.display()));
        }
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(format!("archive contains path traversal: {}", path.display()));
        }

        if entry.header().entry_type().is_symlink() {
            if let Ok(Some(target)) = entry.link_name() {
                let escapes = target
                    .components()
                    .any(|c| matches!(c, Component::ParentDir));
                if escapes {
                    return Err(format!(
                        "archive contains symlink escape: {} -> {}",
                        path.display(),
                        target.display()
                    ));
                }
            }
        }

        // unpack_in refuses to write through a symlinked parent that leads
        // outside dest, so an earlier link entry cannot be used as a tunnel.
        entry
            .unpack_in(dest)
            .map_err(|e| format!("failed to unpack {}: {}", path.display(), e))?;
    }
    Ok(())
}

/// Extract a (possibly gzip-compressed) tarball on disk into `dest`.
pub(crate) fn unpack_file(archive: &Path, dest: &Path) -> Result<(), String> {
    let mut file = std::fs::File::open(archive)
        .map_err(|e| format!("failed to open {}: {}", archive.display(), e))?;
    let mut magic = [0u8; 2];
    let read = file.read(&mut magic).map_err(|e| e.to_string())?;
    let file = std::fs::File::open(archive).map_err(|e| e.to_string())?;

    std::fs::create_dir_all(dest).map_err(|e| e.to_string())?;
    if is_gzip(&magic[..read]) {
        safe_unpack(&mut tar::Archive::new(flate2::read::GzDecoder::new(file)), dest)
    } else {
        safe_unpack(&mut tar::Archive::new(file), dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::tarball;

    /// Hand-build a single-entry tar so paths the builder refuses can be tested.
    fn build_raw_tar_with_path(path: &str, content: &[u8]) -> Vec<u8> {
        let mut header = [0u8; 512];
        header[..path.len()].copy_from_slice(path.as_bytes());
        header[100..108].copy_from_slice(b"0000644\0");
        header[108..116].copy_from_slice(b"0000000\0");
        header[116..124].copy_from_slice(b"0000000\0");
        let size = format!("{:011o}\0", content.len());
        header[124..136].copy_from_slice(size.as_bytes());
        header[136..148].copy_from_slice(b"00000000000\0");
        header[156] = b'0';
        header[257..263].copy_from_slice(b"ustar\0");
        header[263..265].copy_from_slice(b"00");
        header[148..156].copy_from_slice(b"        ");
        let checksum: u32 = header.iter().map(|b| u32::from(*b)).sum();
        let checksum = format!("{:06o}\0 ", checksum);
        header[148..156].copy_from_slice(checksum.as_bytes());

        let mut out = header.to_vec();
        out.extend_from_slice(content);
        out.resize(512 + content.len().div_ceil(512) * 512, 0);
        out.extend_from_slice(&[0u8; 1024]);
        out
    }

    #[test]
    fn test_detect_gzip() {
        assert!(is_gzip(&[0x1f, 0x8b, 0x08, 0x00]));
        assert!(!is_gzip(b"ustar"));
        assert!(!is_gzip(&[0x1f]));
    }

    #[test]
    fn test_unpack_gzip_and_plain() {
        let tmp = tempfile::tempdir().unwrap();
        let files = [("ssp/test.0", "the five boxing wizards jumped quickly")];

        let gz = tmp.path().join("a.tar.gz");
        std::fs::write(&gz, tarball(&files, true)).unwrap();
        unpack_file(&gz, &tmp.path().join("out_gz")).unwrap();
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("out_gz/ssp/test.0")).unwrap(),
            "the five boxing wizards jumped quickly"
        );

        let plain = tmp.path().join("a.tar");
        std::fs::write(&plain, tarball(&files, false)).unwrap();
        unpack_file(&plain, &tmp.path().join("out_plain")).unwrap();
        assert!(tmp.path().join("out_plain/ssp/test.0").exists());
    }

    #[test]
    fn test_unpack_rejects_path_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("evil.tar");
        std::fs::write(&archive, build_raw_tar_with_path("../escape.txt", b"x")).unwrap();

        let err = unpack_file(&archive, &tmp.path().join("out")).unwrap_err();
        assert!(err.contains("path traversal"), "{err}");
        assert!(!tmp.path().join("escape.txt").exists());
    }

    #[test]
    fn test_unpack_rejects_absolute_path() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = tmp.path().join("evil.tar");
        std::fs::write(&archive, build_raw_tar_with_path("/etc/evil", b"x")).unwrap();

        let err = unpack_file(&archive, &tmp.path().join("out")).unwrap_err();
        assert!(err.contains("absolute path"), "{err}");
    }

    #[test]
    fn test_unpack_refuses_to_write_through_outside_symlink() {
        let tmp = tempfile::tempdir().unwrap();
        let outside = tmp.path().join("outside");
        std::fs::create_dir_all(&outside).unwrap();

        let mut builder = tar::Builder::new(Vec::new());
        let mut link = tar::Header::new_gnu();
        link.set_entry_type(tar::EntryType::Symlink);
        link.set_size(0);
        link.set_mode(0o777);
        builder
            .append_link(&mut link, "base_09/rootfs/evil", &outside)
            .unwrap();
        let payload = b"owned";
        let mut file = tar::Header::new_gnu();
        file.set_size(payload.len() as u64);
        file.set_mode(0o644);
        builder
            .append_data(&mut file, "base_09/rootfs/evil/pwned", &payload[..])
            .unwrap();
        let archive = tmp.path().join("evil.tar");
        std::fs::write(&archive, builder.into_inner().unwrap()).unwrap();

        assert!(unpack_file(&archive, &tmp.path().join("out")).is_err());
        assert!(!outside.join("pwned").exists());
    }

    #[test]
    fn test_unpack_keeps_symlinks_inside_dest() {
        let tmp = tempfile::tempdir().unwrap();
        let mut builder = tar::Builder::new(Vec::new());
        let mut link = tar::Header::new_gnu();
        link.set_entry_type(tar::EntryType::Symlink);
        link.set_size(0);
        link.set_mode(0o777);
        builder.append_link(&mut link, "rootfs/lib", "usr/lib").unwrap();
        let archive = tmp.path().join("links.tar");
        std::fs::write(&archive, builder.into_inner().unwrap()).unwrap();

        unpack_file(&archive, &tmp.path().join("out")).unwrap();
        assert_eq!(
            std::fs::read_link(tmp.path().join("out/rootfs/lib")).unwrap(),
            std::path::PathBuf::from("usr/lib")
        );
    }

    #[test]
    fn test_unpack_missing_archive() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(unpack_file(&tmp.path().join("missing.tar"), tmp.path()).is_err());
    }
}
