use crate::strings::{ExtractedString, StringEncoding};

fn is_printable(byte: u8) -> bool {
    matches!(byte, b'\t' | 0x20..=0x7E)
}

/// Scan `data` for printable runs of at least `min_len` characters in both
/// single-byte and UTF-16LE form. Results are ordered by byte offset.
pub fn scan_strings(data: &[u8], min_len: usize) -> Vec<ExtractedString> {
    let min_len = min_len.max(1);
    let mut out = scan_ascii_runs(data, min_len);
    out.append(&mut scan_utf16le_runs(data, min_len));
    out.sort_by(|a, b| a.offset.cmp(&b.offset).then(a.encoding.cmp(&b.encoding)));
    out
}

fn scan_ascii_runs(data: &[u8], min_len: usize) -> Vec<ExtractedString> {
    let mut strings = Vec::new();
    let mut i = 0usize;

    while i < data.len() {
        if !is_printable(data[i]) {
            i += 1;
            continue;
        }

        let start = i;
        while i < data.len() && is_printable(data[i]) {
            i += 1;
        }

        if i - start >= min_len {
            strings.push(ExtractedString {
                offset: start as u64,
                encoding: StringEncoding::Ascii,
                text: String::from_utf8_lossy(&data[start..i]).into_owned(),
            });
        }
    }

    strings
}

/// Both alignments are scanned; a wide string may start on an odd offset.
fn scan_utf16le_runs(data: &[u8], min_len: usize) -> Vec<ExtractedString> {
    let mut strings = Vec::new();

    for start_offset in 0..2usize {
        let mut i = start_offset;
        while i + 1 < data.len() {
            if !(is_printable(data[i]) && data[i + 1] == 0) {
                i += 2;
                continue;
            }

            let run_start = i;
            let mut text = Vec::new();
            let mut j = i;
            while j + 1 < data.len() && is_printable(data[j]) && data[j + 1] == 0 {
                text.push(data[j]);
                j += 2;
            }

            if text.len() >= min_len {
                strings.push(ExtractedString {
                    offset: run_start as u64,
                    encoding: StringEncoding::Utf16Le,
                    text: String::from_utf8_lossy(&text).into_owned(),
                });
            }
            i = j + 2;
        }
    }

    strings
}
