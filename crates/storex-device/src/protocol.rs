//! Request formatting and reply splitting for the StoreX text protocol.
//!
//! Requests look like `STX2Name(id,arg,...)\r`. Replies are `;`-separated
//! fields, usually followed by CR LF.

use std::fmt::Display;

/// Request terminator.
pub const TERMINATOR: char = '\r';

/// Reply field separator.
pub const FIELD_SEPARATOR: char = ';';

/// Format `name(device_id,args...)\r`.
pub fn format_command(name: &str, device_id: &str, args: &[&dyn Display]) -> String {
    let mut command = format!("{name}({device_id}");
    for arg in args {
        command.push(',');
        command.push_str(&arg.to_string());
    }
    command.push(')');
    command.push(TERMINATOR);
    command
}

/// Split a reply into its non-empty, whitespace-trimmed fields.
pub fn split_fields(reply: &str) -> Vec<&str> {
    reply
        .split(FIELD_SEPARATOR)
        .map(str::trim)
        .filter(|field| !field.is_empty())
        .collect()
}
