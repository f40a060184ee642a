//! Environment expansion for open/close strings.

/// Replaces every `${NAME}` with the value of the environment variable
/// `NAME`. Unset variables expand to the empty string; an unterminated
/// reference is kept as written.
pub fn expand(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                if let Ok(value) = std::env::var(name) {
                    output.push_str(&value);
                } else {
                    tracing::debug!(variable = name, "unset variable in resource info");
                }
                rest = &after[end + 1..];
            }
            None => {
                output.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    output.push_str(rest);
    output
}
