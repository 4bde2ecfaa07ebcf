//! Torn-write repair for the rejection log
//!
//! The log is a single JSON object whose `events` array the writer keeps
//! appending to. A reader racing the writer sees a prefix of the document.
//! The repair keeps every complete entry of the array, drops whatever
//! follows the last one, and closes the array and the object.

/// Depth of an entry boundary inside `{"events": [ ... ]}`
const ENTRY_DEPTH: [u8; 2] = [b'{', b'['];

/// Close a truncated rejection log after its last complete entry
///
/// Returns `None` when the text is not a truncated document (it is either
/// complete, structurally broken, or cut before the events array opened).
#[must_use]
pub fn repair_truncated(content: &str) -> Option<String> {
    let bytes = content.as_bytes();
    let mut stack: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    let mut cut = None;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }

        match b {
            b'"' => in_string = true,
            b'{' | b'[' => {
                stack.push(b);
                if stack == ENTRY_DEPTH {
                    cut = Some(i + 1);
                }
            },
            b'}' | b']' => {
                let open = if b == b'}' { b'{' } else { b'[' };
                if stack.pop() != Some(open) {
                    return None;
                }
                if stack == ENTRY_DEPTH {
                    cut = Some(i + 1);
                }
            },
            _ => {},
        }
    }

    // Balanced means the document is complete; a strict parse already had its chance
    if stack.is_empty() && !in_string {
        return None;
    }

    let head = content[..cut?]
        .trim_end()
        .trim_end_matches(',')
        .trim_end();
    Some(format!("{head}\n  ]\n}}"))
}
