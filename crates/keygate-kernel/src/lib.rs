use keygate_contracts::{INVOKE_SIGIL, KEYGEN_COMMAND, LIST_METHODS_COMMAND, REDEEM_COMMAND};
use rand::Rng;
use sha2::{Digest, Sha256};

pub const KEY_LENGTH: usize = 32;
pub const KEY_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

pub const TARGET_PLACEHOLDER: &str = "{TARGET}";
pub const PORT_PLACEHOLDER: &str = "{PORT}";
pub const TIME_PLACEHOLDER: &str = "{TIME}";

pub const ROLE_LOOKUP_FAILED_REPLY: &str = "An error occurred while checking roles.";
pub const INVOKE_USAGE_REPLY: &str = "Usage: `/{METHOD} {TARGET} {PORT} {TIME}`";
pub const INVALID_METHOD_REPLY: &str =
    "Invalid method. Please use `/methods` to see available commands.";
pub const INVOKE_DENIED_REPLY: &str = "You do not have permission to use this command.";
pub const KEYGEN_DENIED_REPLY: &str = "You do not have permission to generate keys.";
pub const KEYGEN_SAVE_FAILED_REPLY: &str = "Error saving generated key.";
pub const REDEEM_USAGE_REPLY: &str = "Usage: `.redeem {KEY}`";
pub const ALREADY_REDEEMED_REPLY: &str = "This key has already been redeemed.";
pub const UNKNOWN_KEY_REPLY: &str = "This key is not valid.";
pub const REDEEM_SAVE_FAILED_REPLY: &str = "Error saving used key.";
pub const REDEEMED_REPLY: &str = "Successfully redeemed the key and the role has been assigned!";

/// A classified chat message. Routing is structural: the catalog is never
/// consulted here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ListMethods,
    Invoke(Invocation),
    InvokeUsage,
    KeyGen,
    Redeem(String),
    RedeemUsage,
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Endpoint name, lower-cased, sigil stripped.
    pub method: String,
    pub bindings: RequestBindings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestBindings {
    pub target: String,
    pub port: String,
    pub time: String,
}

/// Classifies message text. Rules are evaluated in order and the first match
/// wins.
pub fn classify(content: &str) -> Command {
    let trimmed = content.trim();
    if trimmed == LIST_METHODS_COMMAND {
        return Command::ListMethods;
    }

    if content.starts_with(INVOKE_SIGIL) {
        let parts: Vec<&str> = content.split_whitespace().collect();
        return match parts.as_slice() {
            [name, target, port, time, ..] => Command::Invoke(Invocation {
                method: name[INVOKE_SIGIL.len_utf8()..].to_lowercase(),
                bindings: RequestBindings {
                    target: target.to_string(),
                    port: port.to_string(),
                    time: time.to_string(),
                },
            }),
            _ => Command::InvokeUsage,
        };
    }

    if trimmed == KEYGEN_COMMAND {
        return Command::KeyGen;
    }

    let mut tokens = content.split_whitespace();
    if tokens.next() == Some(REDEEM_COMMAND) {
        return match (tokens.next(), tokens.next()) {
            (Some(key), None) => Command::Redeem(key.to_string()),
            _ => Command::RedeemUsage,
        };
    }

    Command::Ignore
}

/// Substitutes `{TARGET}`, `{PORT}` and `{TIME}` in one left-to-right pass.
/// Inserted values are never rescanned and are not escaped.
pub fn render_template(template: &str, bindings: &RequestBindings) -> String {
    let substitutions = [
        (TARGET_PLACEHOLDER, bindings.target.as_str()),
        (PORT_PLACEHOLDER, bindings.port.as_str()),
        (TIME_PLACEHOLDER, bindings.time.as_str()),
    ];

    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    'scan: while let Some(ch) = rest.chars().next() {
        for (placeholder, value) in substitutions {
            if let Some(tail) = rest.strip_prefix(placeholder) {
                out.push_str(value);
                rest = tail;
                continue 'scan;
            }
        }
        out.push(ch);
        rest = &rest[ch.len_utf8()..];
    }
    out
}

pub fn generate_key<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..KEY_LENGTH)
        .map(|_| KEY_ALPHABET[rng.gen_range(0..KEY_ALPHABET.len())] as char)
        .collect()
}

pub fn is_valid_key_shape(key: &str) -> bool {
    key.len() == KEY_LENGTH && key.bytes().all(|b| KEY_ALPHABET.contains(&b))
}

pub fn has_role(roles: &[String], role_id: &str) -> bool {
    roles.iter().any(|r| r == role_id)
}

/// Short, log-safe identifier for a key.
pub fn key_fingerprint(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let short: String = digest[..6].iter().map(|b| format!("{b:02x}")).collect();
    format!("key_{short}")
}

pub fn methods_reply<'a>(catalog: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    let lines: Vec<String> = catalog
        .into_iter()
        .map(|(name, description)| format!("**{name}** - {description}"))
        .collect();
    format!("Available commands:\n{}", lines.join("\n"))
}

pub fn invoke_success_reply(invocation: &Invocation) -> String {
    format!(
        "Successfully sent attack to '{}' using '{}' on '{}' for '{}'",
        invocation.bindings.target,
        invocation.method,
        invocation.bindings.port,
        invocation.bindings.time
    )
}

pub fn upstream_body_reply(body: &str) -> String {
    format!("Response from API: {body}")
}

pub fn invoke_failed_reply(err: &str) -> String {
    format!("Error sending request: {err}")
}

pub fn key_generated_reply(key: &str) -> String {
    format!("Generated key: `{key}`")
}

pub fn role_grant_failed_reply(err: &str) -> String {
    format!("Failed to assign role: {err}")
}

pub fn audit_line(content: &str, username: &str, channel_id: &str) -> String {
    format!("Command: **{content}**\nUser: <{username}>\nChannel: <{channel_id}>")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn bindings(target: &str, port: &str, time: &str) -> RequestBindings {
        RequestBindings {
            target: target.to_string(),
            port: port.to_string(),
            time: time.to_string(),
        }
    }

    #[test]
    fn render_substitutes_all_placeholders() {
        let out = render_template("http://x/{TARGET}/{PORT}/{TIME}", &bindings("a", "1", "5m"));
        assert_eq!(out, "http://x/a/1/5m");
    }

    #[test]
    fn render_does_not_rescan_inserted_values() {
        let out = render_template("{TARGET}-{PORT}", &bindings("{PORT}", "80", "1"));
        assert_eq!(out, "{PORT}-80");
    }

    #[test]
    fn render_leaves_unknown_and_absent_placeholders() {
        let out = render_template("http://x/{HOST}?t={TIME}&t2={TIME}", &bindings("a", "1", "9"));
        assert_eq!(out, "http://x/{HOST}?t=9&t2=9");
        assert_eq!(render_template("plain", &bindings("a", "1", "9")), "plain");
    }

    #[test]
    fn render_injects_values_verbatim() {
        let out = render_template("http://x/?h={TARGET}", &bindings("a&b=c d", "1", "9"));
        assert_eq!(out, "http://x/?h=a&b=c d");
    }

    #[test]
    fn render_handles_multibyte_text() {
        let out = render_template("ü{TARGET}ß", &bindings("é", "1", "9"));
        assert_eq!(out, "üéß");
    }

    #[test]
    fn classify_list_methods() {
        assert_eq!(classify("/methods"), Command::ListMethods);
        assert_eq!(classify("  /methods \n"), Command::ListMethods);
    }

    #[test]
    fn classify_invocation_lowercases_method() {
        assert_eq!(
            classify("/HOME a.b.c 80 60"),
            Command::Invoke(Invocation {
                method: "home".to_string(),
                bindings: bindings("a.b.c", "80", "60"),
            })
        );
    }

    #[test]
    fn classify_invocation_requires_four_tokens() {
        assert_eq!(classify("/home a.b.c 80"), Command::InvokeUsage);
        assert_eq!(classify("/home"), Command::InvokeUsage);
        assert_eq!(classify("/methods now"), Command::InvokeUsage);
    }

    #[test]
    fn classify_invocation_ignores_trailing_tokens() {
        assert_eq!(
            classify("/home a.b.c 80 60 extra words"),
            Command::Invoke(Invocation {
                method: "home".to_string(),
                bindings: bindings("a.b.c", "80", "60"),
            })
        );
    }

    #[test]
    fn classify_keygen_is_exact() {
        assert_eq!(classify(".keygen"), Command::KeyGen);
        assert_eq!(classify(".keygenx"), Command::Ignore);
    }

    #[test]
    fn classify_redeem() {
        assert_eq!(classify(".redeem abc"), Command::Redeem("abc".to_string()));
        assert_eq!(classify(".redeem"), Command::RedeemUsage);
        assert_eq!(classify(".redeem a b"), Command::RedeemUsage);
        assert_eq!(classify(".redeemer abc"), Command::Ignore);
    }

    #[test]
    fn classify_ignores_other_text() {
        assert_eq!(classify("hello there"), Command::Ignore);
        assert_eq!(classify(""), Command::Ignore);
        assert_eq!(classify(" /home a b c"), Command::Ignore);
    }

    #[test]
    fn generated_keys_use_alphabet_and_length() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut seen = HashSet::new();
        for _ in 0..500 {
            let key = generate_key(&mut rng);
            assert!(is_valid_key_shape(&key), "bad key {key}");
            seen.insert(key);
        }
        assert_eq!(seen.len(), 500);
    }

    #[test]
    fn role_check_is_containment() {
        let roles = vec!["a".to_string(), "b".to_string()];
        assert!(has_role(&roles, "b"));
        assert!(!has_role(&roles, "c"));
        assert!(!has_role(&[], "a"));
    }

    #[test]
    fn fingerprint_hides_key() {
        let fp = key_fingerprint("secret-key");
        assert!(fp.starts_with("key_"));
        assert_eq!(fp.len(), 16);
        assert!(!fp.contains("secret"));
    }

    #[test]
    fn methods_reply_lists_entries() {
        let text = methods_reply([("home", "home endpoint")]);
        assert_eq!(text, "Available commands:\n**home** - home endpoint");
    }

    #[test]
    fn audit_line_shape() {
        assert_eq!(
            audit_line("/methods", "alice", "c1"),
            "Command: **/methods**\nUser: <alice>\nChannel: <c1>"
        );
    }
}
