//! Log file tailing shared by project and Caddy logs

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

const CHUNK_SIZE: u64 = 8 * 1024;

/// Read the last `lines` lines of a file
///
/// The file is read backwards in fixed-size chunks, so tailing a large log
/// only touches its end.
pub fn tail_lines(path: &Path, lines: usize) -> io::Result<Vec<String>> {
    if lines == 0 {
        return Ok(Vec::new());
    }

    let mut file = File::open(path)?;
    let mut pos = file.metadata()?.len();
    let mut buf: Vec<u8> = Vec::new();

    while pos > 0 {
        let read = CHUNK_SIZE.min(pos);
        pos -= read;
        file.seek(SeekFrom::Start(pos))?;

        let mut chunk = vec![0u8; read as usize];
        file.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&buf);
        buf = chunk;

        // one newline more than requested means the oldest kept line is complete
        if buf.iter().filter(|&&b| b == b'\n').count() > lines {
            break;
        }
    }

    let text = String::from_utf8_lossy(&buf);
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].iter().map(|l| l.to_string()).collect())
}
