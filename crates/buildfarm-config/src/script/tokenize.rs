//! Parameter tokenizer for script lines and tool command lines.

/// Split a command line into parameters.
///
/// A double quote toggles quoting and closing a quote ends the current
/// parameter. Outside quotes a space separates parameters; a tab separates
/// them everywhere, even inside quotes. Empty parameters are never produced.
pub fn extract_parameters(line: &str) -> Vec<String> {
    let mut params = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for ch in line.chars() {
        if ch == '"' {
            in_quotes = !in_quotes;
            if !in_quotes && !current.is_empty() {
                params.push(std::mem::take(&mut current));
            }
        } else if (!in_quotes && ch == ' ') || ch == '\t' {
            if !current.is_empty() {
                params.push(std::mem::take(&mut current));
            }
        } else {
            current.push(ch);
        }
    }

    if !current.is_empty() {
        params.push(current);
    }

    params
}
