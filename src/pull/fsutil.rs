use std::path::{Path, PathBuf};

use filetime::FileTime;

/// Prefix for in-progress assembly files. The dotted name keeps the temp
/// out of normal listings until it is renamed into place.
pub const TEMP_PREFIX: &str = ".synctmp.";

/// Derives the temp path for a destination: a hidden sibling in the same
/// directory, so the final rename stays on one device.
pub fn temp_name(dest: &Path) -> PathBuf {
    let file_name = dest
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unnamed");
    match dest.parent() {
        Some(parent) => parent.join(format!("{TEMP_PREFIX}{file_name}")),
        None => PathBuf::from(format!("{TEMP_PREFIX}{file_name}")),
    }
}

/// Renames `from` onto `to`, replacing an existing destination. On
/// platforms where rename does not replace, the destination is removed
/// and the rename retried once.
pub async fn rename_overwrite(from: &Path, to: &Path) -> std::io::Result<()> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(first) => {
            if tokio::fs::try_exists(to).await.unwrap_or(false) {
                tokio::fs::remove_file(to).await?;
                tokio::fs::rename(from, to).await
            } else {
                Err(first)
            }
        }
    }
}

/// Sets both access and modification time to `secs` (unix seconds).
pub fn set_mtime(path: &Path, secs: i64) -> std::io::Result<()> {
    let t = FileTime::from_unix_time(secs, 0);
    filetime::set_file_times(path, t, t)
}

/// Unix modification time of existing metadata.
pub fn mtime_of(md: &std::fs::Metadata) -> i64 {
    FileTime::from_last_modification_time(md).unix_seconds()
}

#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o777))
}

#[cfg(not(unix))]
pub fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
pub fn mode_of(md: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    md.permissions().mode() & 0o777
}

#[cfg(not(unix))]
pub fn mode_of(_md: &std::fs::Metadata) -> u32 {
    0o777
}

/// Compares the nine permission bits that the puller manages.
pub fn modes_equal(a: u32, b: u32) -> bool {
    a & 0o777 == b & 0o777
}

/// Lifts write protection before a delete or archive of the destination.
pub fn make_writable(path: &Path) -> std::io::Result<()> {
    set_mode(path, 0o666)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        p.push(format!("rust-sync-fsutil-{tag}-{nanos}"));
        p
    }

    #[test]
    fn temp_name_is_hidden_sibling() {
        let t = temp_name(Path::new("repo/sub/data.bin"));
        assert_eq!(t, Path::new("repo/sub/.synctmp.data.bin"));

        let bare = temp_name(Path::new("data.bin"));
        assert_eq!(bare, Path::new(".synctmp.data.bin"));
    }

    #[tokio::test]
    async fn rename_overwrite_replaces_existing_destination() {
        let root = temp_dir("rename");
        tokio::fs::create_dir_all(&root).await.expect("mkdir");
        let from = root.join("from");
        let to = root.join("to");
        tokio::fs::write(&from, b"new").await.expect("write from");
        tokio::fs::write(&to, b"old").await.expect("write to");

        rename_overwrite(&from, &to).await.expect("rename");
        assert_eq!(tokio::fs::read(&to).await.expect("read"), b"new");
        assert!(!from.exists());

        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn set_mtime_roundtrips() {
        let root = temp_dir("mtime");
        std::fs::create_dir_all(&root).expect("mkdir");
        let p = root.join("f");
        std::fs::write(&p, b"x").expect("write");

        set_mtime(&p, 1_400_000_000).expect("set mtime");
        let md = std::fs::metadata(&p).expect("stat");
        assert_eq!(mtime_of(&md), 1_400_000_000);

        let _ = std::fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn set_mode_applies_low_nine_bits() {
        let root = temp_dir("mode");
        std::fs::create_dir_all(&root).expect("mkdir");
        let p = root.join("f");
        std::fs::write(&p, b"x").expect("write");

        set_mode(&p, 0o4755).expect("chmod");
        let md = std::fs::metadata(&p).expect("stat");
        assert_eq!(mode_of(&md), 0o755);
        assert!(modes_equal(mode_of(&md), 0o755));

        let _ = std::fs::remove_dir_all(root);
    }
}
