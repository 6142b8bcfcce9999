//! Shared utilities for fleetrun.

/// Length of the flag value at the start of `s`, honouring quotes and
/// backslash escapes.
fn find_value_end(s: &str) -> usize {
    let mut end = 0;
    let mut in_quote = None;
    let mut escaped = false;

    for c in s.chars() {
        let char_len = c.len_utf8();

        if escaped {
            escaped = false;
            end += char_len;
            continue;
        }

        if c == '\\' {
            escaped = true;
            end += char_len;
            continue;
        }

        if let Some(q) = in_quote {
            if c == q {
                in_quote = None;
            }
            end += char_len;
            continue;
        }

        if c == '"' || c == '\'' {
            in_quote = Some(c);
            end += char_len;
            continue;
        }

        if c.is_whitespace() {
            break;
        }

        end += char_len;
    }
    end
}

/// Mask secrets in a command line before it is logged.
///
/// Agent invocations carry repository passwords as flag values; relayed
/// command lines carry the same values one or two escaping layers deep.
pub fn mask_sensitive_command(cmd: &str) -> String {
    let patterns = [
        // Agent flags
        ("--password ", "--password ***"),
        ("--password=", "--password=***"),
        ("--token ", "--token ***"),
        ("--token=", "--token=***"),
        ("--secret ", "--secret ***"),
        ("--secret=", "--secret=***"),
        ("--api-key ", "--api-key ***"),
        ("--api-key=", "--api-key=***"),
        // Environment assignments in ad-hoc commands
        ("PASSWORD=", "PASSWORD=***"),
        ("TOKEN=", "TOKEN=***"),
        ("SECRET=", "SECRET=***"),
        ("API_KEY=", "API_KEY=***"),
    ];

    let mut result = cmd.to_string();
    for (pattern, replacement) in patterns {
        // The replacement contains the pattern, so resume after it.
        let mut search_start = 0;
        while search_start < result.len() {
            let Some(start) = result[search_start..].find(pattern) else {
                break;
            };
            let abs_start = search_start + start;
            let value_start = abs_start + pattern.len();
            let value_end = value_start + find_value_end(&result[value_start..]);

            result = format!(
                "{}{}{}",
                &result[..abs_start],
                replacement,
                &result[value_end..]
            );
            search_start = abs_start + replacement.len();
        }
    }

    result
}
