use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;

/// Writes a verified piece to `output`.
///
/// When `output` is an existing directory the piece lands in
/// `<output>/<basename>.<index>.bin`, otherwise `output` is the file path.
pub async fn save_piece(output: &Path, basename: &str, index: u32, bytes: &[u8]) -> io::Result<PathBuf> {
    let path = match fs::metadata(output).await {
        Ok(meta) if meta.is_dir() => output.join(format!("{}.{}.bin", basename, index)),
        _ => output.to_path_buf(),
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await?;
    }
    fs::write(&path, bytes).await?;
    Ok(path)
}
