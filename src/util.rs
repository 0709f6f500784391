//! Shared utility functions for the beadwork crate.

/// Return the last `n` lines of `text`, joined with newlines.
pub fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

/// Substitute `{project_id}` and `{bead_id}` placeholders in each argument.
pub fn expand_placeholders(args: &[String], project_id: &str, bead_id: &str) -> Vec<String> {
    args.iter()
        .map(|arg| {
            arg.replace("{project_id}", project_id)
                .replace("{bead_id}", bead_id)
        })
        .collect()
}
