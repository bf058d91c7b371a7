//! Lenient parsing of `modpoll` register dumps.
//!
//! A single poll prints one line per register, e.g. `[500]: 1`, mixed with
//! banner and protocol lines. Only lines of that shape contribute values;
//! everything else is skipped without error.

/// Extract register values from master tool output, in line order.
pub fn extract_register_values(output: &str) -> Vec<i64> {
    output.lines().filter_map(parse_register_line).collect()
}

/// Parse one `[<register>]: <value>` line.
fn parse_register_line(line: &str) -> Option<i64> {
    let line = line.trim();
    let mut parts = line.split(':');
    let label = parts.next()?;
    let value = parts.next()?;
    if parts.next().is_some() || !label.contains('[') {
        return None;
    }
    value.trim().parse().ok()
}

/// Exact, ordered comparison of a read against the expected payload.
pub fn verify(actual: &[i64], expected: &[i64]) -> bool {
    actual == expected
}
