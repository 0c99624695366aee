use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Returned instead of an error when a version has not produced output yet.
pub const NO_LOGS: &str = "(no logs)";

fn split_lines_from_tail(buf: &[u8], max_lines: usize, partial_head: bool) -> Vec<String> {
    // Best-effort UTF-8: a tail cut may land mid-character.
    let text = String::from_utf8_lossy(buf);
    let mut out: Vec<String> = text.lines().map(|l| l.to_string()).collect();

    // The first line is partial when the read started mid-line.
    if partial_head && out.len() > 1 {
        out.remove(0);
    }

    if out.len() > max_lines {
        out.drain(0..(out.len() - max_lines));
    }
    out
}

/// Reads roughly the last `max_lines` lines of `path`.
///
/// Only the final `max_lines * bytes_per_line` bytes are read, so very long
/// lines may yield fewer lines than asked for. `max_lines == 0` returns the
/// whole file.
pub async fn read_tail(
    path: &Path,
    max_lines: usize,
    bytes_per_line: usize,
) -> std::io::Result<String> {
    let mut f = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(NO_LOGS.to_string()),
        Err(e) => return Err(e),
    };

    let size = f.metadata().await?.len();
    if max_lines == 0 {
        let mut buf = Vec::with_capacity(size as usize);
        f.read_to_end(&mut buf).await?;
        return Ok(String::from_utf8_lossy(&buf).into_owned());
    }

    let budget = (max_lines as u64).saturating_mul(bytes_per_line.max(1) as u64);
    let cursor = size.saturating_sub(budget);
    f.seek(std::io::SeekFrom::Start(cursor)).await?;

    let mut buf = Vec::with_capacity((size - cursor) as usize);
    f.read_to_end(&mut buf).await?;

    let mut prev = [0u8; 1];
    let partial_head = cursor > 0 && {
        f.seek(std::io::SeekFrom::Start(cursor - 1)).await?;
        f.read_exact(&mut prev).await?;
        prev[0] != b'\n'
    };

    let lines = split_lines_from_tail(&buf, max_lines, partial_head);
    let mut out = lines.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    Ok(out)
}

/// Appends a `[shipyard] ...` marker line to a process log.
pub async fn append_marker(path: &Path, line: &str) -> std::io::Result<()> {
    let mut f = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    let stamp = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    f.write_all(format!("[shipyard] {stamp} {line}\n").as_bytes())
        .await?;
    f.flush().await
}
