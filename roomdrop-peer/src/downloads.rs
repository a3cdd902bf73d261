//! Writing received files to disk.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use roomdrop_core::transfer::sanitize_file_name;
use roomdrop_core::ReceivedFile;

/// Write `file` into `dir` under its (sanitized) announced name. An existing file is
/// never overwritten; a ` (n)` suffix is added before the extension instead.
pub async fn save(dir: &Path, file: &ReceivedFile) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let name = sanitize_file_name(&file.meta.name);
    let mut n = 0u32;
    loop {
        let path = dir.join(numbered(&name, n));
        let open = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await;
        match open {
            Ok(mut out) => {
                out.write_all(&file.data).await?;
                return Ok(path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(e),
        }
    }
}

fn numbered(name: &str, n: u32) -> String {
    if n == 0 {
        return name.to_string();
    }
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{} ({}){}", &name[..dot], n, &name[dot..]),
        _ => format!("{} ({})", name, n),
    }
}
