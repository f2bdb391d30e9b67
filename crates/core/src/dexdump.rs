//! Streaming method counter for disassembly dumps of compiled dex units.
//!
//! A dump can run to hundreds of megabytes, so it is read in bounded chunks
//! and only the text up to the end of the last complete class block is ever
//! discarded between reads. Both declared and invoked methods count toward
//! the dex method ceiling, de-duplicated by full signature.

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use dexcloak_utils::errors::DumpError;

/// Hard ceiling on method references in a single dex file.
pub const DEX_METHOD_CEILING: usize = 65536;

/// Default read size: 2 MiB for the buffer, with the carry window staying in
/// the same ballpark.
pub const DEFAULT_CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Counts distinct method signatures in the dump at `path`.
pub fn count_methods_in_dump(path: &Path) -> Result<usize, DumpError> {
    let file = File::open(path).map_err(|source| DumpError::Open {
        path: path.display().to_string(),
        source,
    })?;
    count_methods(file, DEFAULT_CHUNK_SIZE)
}

/// Remaining method budget for the unit described by the dump at `path`.
pub fn method_budget(path: &Path) -> Result<usize, DumpError> {
    Ok(DEX_METHOD_CEILING.saturating_sub(count_methods_in_dump(path)?))
}

/// Counts distinct method signatures, reading `chunk_size` bytes at a time.
///
/// The chunk size is a parameter so tests can force class blocks to straddle
/// a read boundary.
pub fn count_methods<R: Read>(mut reader: R, chunk_size: usize) -> Result<usize, DumpError> {
    let mut unique = HashSet::new();
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut window = String::new();
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        append_utf8(&mut window, &mut pending, &buf[..n]);
        // Read on until the window holds at least one complete class block;
        // a tail with no further block has nothing left worth counting.
        while find_class_block(&window, 0).is_none() {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                return Ok(unique.len());
            }
            append_utf8(&mut window, &mut pending, &buf[..n]);
        }
        let consumed = scan_complete_blocks(&window, &mut unique);
        window.drain(..consumed);
    }
    Ok(unique.len())
}

/// Appends bytes to `window`, carrying any trailing partial UTF-8 sequence
/// in `pending` until the rest of it arrives.
fn append_utf8(window: &mut String, pending: &mut Vec<u8>, bytes: &[u8]) {
    pending.extend_from_slice(bytes);
    match std::str::from_utf8(pending) {
        Ok(s) => {
            window.push_str(s);
            pending.clear();
        }
        Err(e) => {
            let valid = e.valid_up_to();
            window.push_str(std::str::from_utf8(&pending[..valid]).unwrap_or(""));
            pending.drain(..valid);
        }
    }
}

/// Finds the next complete class block at or after `from`: `Class #<n>`
/// through the closing parenthesis after `source_file_idx`.
fn find_class_block(window: &str, from: usize) -> Option<(usize, usize)> {
    let start = from + window[from..].find("Class #")?;
    let idx = start + window[start..].find("source_file_idx")?;
    let end = idx + window[idx..].find(')')? + 1;
    Some((start, end))
}

/// Scans every complete class block in `window` and returns the offset just
/// past the last one, which is how much of the window may be discarded.
fn scan_complete_blocks(window: &str, unique: &mut HashSet<String>) -> usize {
    let mut consumed = 0;
    while let Some((start, end)) = find_class_block(window, consumed) {
        scan_class_block(&window[start..end], unique);
        consumed = end;
    }
    consumed
}

/// Collects method signatures from one class block.
///
/// Fields sections are skipped: only the `Direct methods` and `Virtual
/// methods` tables hold entries that count. Declared methods appear as
/// `(in Lcls;)` / `name : '<x>'` / `type : '<sig>'` triples; external
/// references appear inside `invoke-…` instruction lines.
fn scan_class_block(block: &str, unique: &mut HashSet<String>) {
    let mut methods = String::new();
    let mut tail = block;
    if let Some(i) = block.find("Direct methods") {
        tail = &block[i..];
        let upto = tail.find("Virtual methods").unwrap_or(tail.len());
        methods.push_str(&tail[..upto]);
    }
    if let Some(i) = tail.find("Virtual methods") {
        methods.push_str(&tail[i..]);
    }

    let mut class_ctx: Option<String> = None;
    let mut name_ctx: Option<String> = None;
    for line in methods.lines() {
        let t = line.trim_start();
        if let Some(i) = t.find("(in L") {
            if let Some(end) = t[i + 4..].find(')') {
                class_ctx = Some(t[i + 4..i + 4 + end].to_string());
                name_ctx = None;
            }
        } else if t.starts_with("name") {
            name_ctx = quoted(t);
        } else if t.starts_with("type") {
            if let (Some(class), Some(name), Some(ty)) =
                (class_ctx.as_deref(), name_ctx.as_deref(), quoted(t))
            {
                unique.insert(format!("{class}->{name}{ty}"));
            }
        } else if let Some(i) = t.find("invoke-") {
            if let Some(signature) = parse_invoke_reference(&t[i..]) {
                unique.insert(signature);
            }
        }
    }
}

/// Extracts `'…'`-quoted content.
fn quoted(s: &str) -> Option<String> {
    let open = s.find('\'')?;
    let close = open + 1 + s[open + 1..].find('\'')?;
    Some(s[open + 1..close].to_string())
}

/// Parses `invoke-… Lcls;.name:(sig)ret` out of a dump instruction line.
fn parse_invoke_reference(s: &str) -> Option<String> {
    let lpos = s
        .find(", L")
        .map(|p| p + 2)
        .or_else(|| s.find(" L").map(|p| p + 1))?;
    let rest = &s[lpos..];
    let semi = rest.find(';')?;
    let class = &rest[..=semi];
    let rest = rest[semi + 1..].strip_prefix('.')?;
    let colon = rest.find(':')?;
    let name = &rest[..colon];
    let ty = rest[colon + 1..].split_whitespace().next()?;
    Some(format!("{class}->{name}{ty}"))
}
