//! JSON extraction from model output.
//!
//! Model replies mix prose, markdown fences and JSON. Agents scan them for
//! tool calls and the final report object.
//!
//! # Example
//!
//! ```
//! use swe_conductor::utils::json_extraction::extract_json_objects;
//!
//! let response = "Done. {\"summary\": \"ok\", \"findings\": []}";
//! let objects = extract_json_objects(response);
//! assert_eq!(objects[0]["summary"], "ok");
//! ```

use serde_json::Value;

/// Index of the brace closing the object that starts at `s[0]`.
///
/// String literals and escape sequences are skipped.
pub fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, c) in s.char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => escape_next = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

/// Every top-level JSON object in `content`, in order of appearance.
///
/// Objects nested inside another extracted object are not reported again.
pub fn extract_json_objects(content: &str) -> Vec<Value> {
    let mut objects = Vec::new();
    let mut cursor = 0;

    while let Some(offset) = content[cursor..].find('{') {
        let start = cursor + offset;
        let rest = &content[start..];
        match find_matching_brace(rest) {
            Some(end) => match serde_json::from_str::<Value>(&rest[..=end]) {
                Ok(value) => {
                    objects.push(value);
                    cursor = start + end + 1;
                }
                Err(_) => cursor = start + 1,
            },
            None => cursor = start + 1,
        }
    }

    objects
}
