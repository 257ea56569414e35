//! Multi-line prompt input from standard input.

use std::io::{self, BufRead};

/// Read lines until two consecutive blank lines or end of input.
///
/// Trailing newlines are trimmed from the result; inner blank lines are kept.
pub fn read_prompt<R: BufRead>(reader: R) -> io::Result<String> {
    let mut prompt = String::new();
    let mut last_blank = false;

    for line in reader.lines() {
        let line = line?;
        let blank = line.is_empty();
        prompt.push_str(&line);
        prompt.push('\n');
        if blank && last_blank {
            break;
        }
        last_blank = blank;
    }

    let trimmed = prompt.trim_end_matches(['\n', '\r']).len();
    prompt.truncate(trimmed);
    Ok(prompt)
}
