//! Deterministic rendering of the managed `authorized_keys` block, its normalization for
//! hashing/strict-audit comparison, and the extractor that splits a live remote file into its
//! managed prefix and preserved non-managed tail.

use chrono::{DateTime, Utc};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

use crate::error::{KeymasterError, Result};
use crate::model::{PublicKey, PublicKeyMaterial};

/// Hardening options every system-key line carries, per spec.md §4.3.
const SYSTEM_KEY_OPTIONS: &str =
    "command=\"internal-sftp\",no-port-forwarding,no-agent-forwarding,no-X11-forwarding,no-pty";

const SYSTEM_KEY_COMMENT: &str = "keymaster-system-key";

/// Renders the managed block for one account.
///
/// `global_keys` and `account_keys` are deduplicated by key id (a key that is both global and
/// explicitly assigned to the account appears once — spec.md's Open Question on this is
/// resolved in DESIGN.md: dedup key is `PublicKey.id`), sorted lexicographically by `comment`,
/// globals first, then explicit assignments, each excluding expired keys.
pub fn render_managed_block(
    serial: i64,
    system_key: &PublicKeyMaterial,
    global_keys: &[PublicKey],
    account_keys: &[PublicKey],
    now: DateTime<Utc>,
) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Keymaster Managed Keys — serial: {serial}\n"));
    out.push_str(&format!(
        "{SYSTEM_KEY_OPTIONS} {} {} {SYSTEM_KEY_COMMENT}\n",
        system_key.algorithm, system_key.key_data
    ));

    let mut seen = std::collections::BTreeSet::new();
    let mut globals: Vec<&PublicKey> = global_keys
        .iter()
        .filter(|k| !k.is_expired(now) && seen.insert(k.id))
        .collect();
    globals.sort_by(|a, b| a.comment.cmp(&b.comment));

    let mut assigned: Vec<&PublicKey> = account_keys
        .iter()
        .filter(|k| !k.is_expired(now) && seen.insert(k.id))
        .collect();
    assigned.sort_by(|a, b| a.comment.cmp(&b.comment));

    for key in globals.into_iter().chain(assigned) {
        out.push_str(&key.openssh_line());
        out.push('\n');
    }

    out
}

/// Strip trailing whitespace per line, collapse blank-line runs to one, drop trailing blank
/// lines (keeping exactly one trailing newline).
pub fn normalize(content: &str) -> String {
    let stripped: Vec<&str> = content.lines().map(|l| l.trim_end()).collect();

    let mut collapsed: Vec<&str> = Vec::with_capacity(stripped.len());
    let mut prev_blank = false;
    for line in stripped {
        let blank = line.is_empty();
        if blank && prev_blank {
            continue;
        }
        collapsed.push(line);
        prev_blank = blank;
    }
    while collapsed.last().is_some_and(|l| l.is_empty()) {
        collapsed.pop();
    }

    if collapsed.is_empty() {
        return String::new();
    }
    let mut out = collapsed.join("\n");
    out.push('\n');
    out
}

/// SHA-256 over the UTF-8 bytes of the normalized content.
pub fn hash(content: &str) -> [u8; 32] {
    let normalized = normalize(content);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.finalize().into()
}

pub fn hash_hex(content: &str) -> String {
    hex_encode(&hash(content))
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(s, "{b:02x}").unwrap();
    }
    s
}

fn managed_line_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(#| *ssh-| *ecdsa-| *sk-| *command=|\s*$)").expect("static regex is valid")
    })
}

/// Split a remote `authorized_keys` file into its managed block (from the literal header line
/// through the last line that still matches the extractor rule) and the preserved tail.
/// Returns `(managed, tail)`; `managed` is empty if no header line is found.
pub fn extract_managed(content: &str) -> (String, String) {
    let lines: Vec<&str> = content.lines().collect();
    let header_idx = lines
        .iter()
        .position(|l| l.trim_start().starts_with("# Keymaster Managed Keys"));

    let Some(start) = header_idx else {
        return (String::new(), content.to_string());
    };

    let pattern = managed_line_pattern();
    let mut end = start + 1;
    while end < lines.len() && pattern.is_match(lines[end]) {
        end += 1;
    }

    let managed = lines[start..end].join("\n");
    let tail = lines[end..].join("\n");
    (managed, tail)
}

/// Compose the final file: new managed block, a blank line, then the preserved tail (spec.md
/// §4.5 step 5). If there is no tail, the file ends with the managed block's own newline.
pub fn compose_with_tail(managed_block: &str, tail: &str) -> String {
    let managed = normalize(managed_block);
    if tail.trim().is_empty() {
        return managed;
    }
    format!("{managed}\n{}\n", tail.trim_end_matches('\n'))
}

/// Parse the serial out of a managed block's header line, for serial-mode audit.
pub fn parse_header_serial(managed_block: &str) -> Result<i64> {
    let header = managed_block
        .lines()
        .find(|l| l.trim_start().starts_with("# Keymaster Managed Keys"))
        .ok_or_else(|| KeymasterError::RenderError("no managed header line found".into()))?;
    header
        .rsplit(": ")
        .next()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .ok_or_else(|| KeymasterError::RenderError(format!("unparsable header: {header}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn key(id: i64, comment: &str) -> PublicKey {
        PublicKey {
            id,
            algorithm: "ssh-ed25519".into(),
            key_data: "AAAA".into(),
            comment: comment.into(),
            is_global: false,
            expires_at: None,
        }
    }

    fn system_key() -> PublicKeyMaterial {
        PublicKeyMaterial {
            algorithm: "ssh-ed25519".into(),
            key_data: "SYSKEYDATA".into(),
        }
    }

    #[test]
    fn zero_keys_renders_header_and_system_key_only() {
        let now = Utc::now();
        let out = render_managed_block(1, &system_key(), &[], &[], now);
        assert_eq!(
            out,
            "# Keymaster Managed Keys — serial: 1\ncommand=\"internal-sftp\",no-port-forwarding,no-agent-forwarding,no-X11-forwarding,no-pty ssh-ed25519 SYSKEYDATA keymaster-system-key\n"
        );
    }

    #[test]
    fn keys_ordered_lexicographically_globals_first() {
        let now = Utc::now();
        let globals = vec![key(1, "zeta"), key(2, "alpha")];
        let assigned = vec![key(3, "mike"), key(4, "bravo")];
        let out = render_managed_block(1, &system_key(), &globals, &assigned, now);
        let lines: Vec<&str> = out.lines().skip(2).collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].ends_with("alpha"));
        assert!(lines[1].ends_with("zeta"));
        assert!(lines[2].ends_with("bravo"));
        assert!(lines[3].ends_with("mike"));
    }

    #[test]
    fn expired_key_excluded() {
        let now = Utc::now();
        let mut k = key(1, "alpha");
        k.expires_at = Some(now - Duration::seconds(1));
        let out = render_managed_block(1, &system_key(), &[k], &[], now);
        assert_eq!(out.lines().count(), 2);
    }

    #[test]
    fn duplicate_assignment_deduped_by_key_id() {
        let now = Utc::now();
        let globals = vec![key(1, "alpha")];
        let assigned = vec![key(1, "alpha")];
        let out = render_managed_block(1, &system_key(), &globals, &assigned, now);
        assert_eq!(out.lines().count(), 3);
    }

    #[test]
    fn rendering_is_deterministic() {
        let now = Utc::now();
        let globals = vec![key(1, "alpha"), key(2, "zeta")];
        let a = render_managed_block(1, &system_key(), &globals, &[], now);
        let b = render_managed_block(1, &system_key(), &globals, &[], now);
        assert_eq!(a, b);
    }

    #[test]
    fn normalize_collapses_blank_runs_and_trailing_whitespace() {
        let input = "a  \nb\n\n\n\nc\n\n";
        assert_eq!(normalize(input), "a\nb\n\nc\n");
    }

    #[test]
    fn extract_managed_stops_at_first_violating_line() {
        let content = "# Keymaster Managed Keys — serial: 2\nssh-ed25519 AAA a@b\n\n# unrelated comment kept? no\nPermitRootLogin no\nssh-rsa BBB custom\n";
        let (managed, tail) = extract_managed(content);
        assert!(managed.starts_with("# Keymaster Managed Keys"));
        assert!(tail.contains("PermitRootLogin"));
        assert!(tail.contains("ssh-rsa BBB custom"));
    }

    #[test]
    fn parse_header_serial_reads_trailing_integer() {
        let block = "# Keymaster Managed Keys — serial: 7\nssh-ed25519 AAA x\n";
        assert_eq!(parse_header_serial(block).unwrap(), 7);
    }

    #[test]
    fn compose_with_tail_inserts_blank_separator() {
        let composed = compose_with_tail("# Keymaster Managed Keys — serial: 1\nssh-ed25519 AAA x\n", "ssh-rsa BBB legacy\n");
        assert_eq!(
            composed,
            "# Keymaster Managed Keys — serial: 1\nssh-ed25519 AAA x\n\nssh-rsa BBB legacy\n"
        );
    }
}
