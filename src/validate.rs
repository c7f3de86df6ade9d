//! Command pre-flight validation
//!
//! The engine only ever talks to the [`CommandValidator`] trait; the policy
//! itself is a pluggable collaborator injected at engine construction. The
//! default [`DenyListValidator`] blocks shell metacharacters and a short
//! list of destructive verbs, which suits the fleet-administration use case
//! where operators run read-mostly diagnostics.
//!
//! Also here: [`sanitize_command_for_logging`], applied to every command
//! string before it reaches the audit trail or tracing output.

use std::sync::LazyLock;

use regex::Regex;

/// Pre-flight check invoked once per host before any network activity.
pub trait CommandValidator: Send + Sync {
    /// Returns the rejection reason when the command is not allowed.
    fn validate(&self, command: &str) -> Result<(), String>;
}

/// Validator that accepts everything. Useful for trusted environments and
/// as the neutral collaborator in tests.
pub struct AcceptAllValidator;

impl CommandValidator for AcceptAllValidator {
    fn validate(&self, _command: &str) -> Result<(), String> {
        Ok(())
    }
}

/// Longest command accepted by the default policy.
const MAX_COMMAND_LENGTH: usize = 10_000;

/// Shell operators and metacharacters that allow command chaining or
/// substitution.
const DANGEROUS_CHARS: &[&str] = &[
    ";", "|", "&", ">", "<", "`", "$", "(", ")", "{", "}", "\n", "\r", "\t", "\\", "'", "\"", "#",
];

/// Destructive base commands.
const DANGEROUS_COMMANDS: &[&str] = &[
    "rm", "dd", "mkfs", "fdisk", "parted", "shutdown", "reboot", "halt", "poweroff", "init",
    "killall", "pkill", "kill",
];

/// Argument fragments that point at wholesale data destruction.
const DANGEROUS_ARGUMENTS: &[&str] = &[
    "-rf",
    "-r -f",
    "-f -r",
    "of=/dev/",
    "if=/dev/zero",
    "if=/dev/urandom",
];

static ENV_VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{?[A-Za-z_][A-Za-z0-9_]*\}?").expect("env var pattern is valid")
});

/// Default deny-list policy.
pub struct DenyListValidator;

impl CommandValidator for DenyListValidator {
    fn validate(&self, command: &str) -> Result<(), String> {
        let trimmed = command.trim();
        if trimmed.is_empty() {
            return Err("command must not be empty".to_string());
        }
        if command.len() > MAX_COMMAND_LENGTH {
            return Err(format!(
                "command is too long (maximum {} characters)",
                MAX_COMMAND_LENGTH
            ));
        }

        for dangerous in DANGEROUS_CHARS {
            if command.contains(dangerous) {
                return Err(format!(
                    "command contains the forbidden character '{}'",
                    dangerous.escape_debug()
                ));
            }
        }

        if ENV_VAR_REGEX.is_match(command) {
            return Err("environment variable expansion is not allowed".to_string());
        }

        if let Some(first) = trimmed.split_whitespace().next() {
            // Strip a leading path and a dotted suffix so /usr/bin/rm and
            // mkfs.ext4 are caught like rm and mkfs
            let name = first.rsplit('/').next().unwrap_or(first);
            let name = name.split('.').next().unwrap_or(name);
            if DANGEROUS_COMMANDS.contains(&name) {
                return Err(format!(
                    "the command '{}' is blocked because it can destroy data or take the host down",
                    name
                ));
            }
        }

        let lower = trimmed.to_lowercase();
        for dangerous in DANGEROUS_ARGUMENTS {
            if lower.contains(dangerous) {
                return Err(format!(
                    "the argument '{}' is blocked because it can destroy data",
                    dangerous
                ));
            }
        }

        Ok(())
    }
}

static SENSITIVE_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"(?i)password\s*=\s*\S+", "password=***"),
        (r"(?i)passwd\s*=\s*\S+", "passwd=***"),
        (r"(?i)pass\s*=\s*\S+", "pass=***"),
        (r"(?i)key\s*=\s*\S+", "key=***"),
        (r"(?i)token\s*=\s*\S+", "token=***"),
        (r"(?i)secret\s*=\s*\S+", "secret=***"),
    ]
    .into_iter()
    .map(|(pattern, replacement)| {
        (
            Regex::new(pattern).expect("sensitive pattern is valid"),
            replacement,
        )
    })
    .collect()
});

/// Mask credential-looking fragments and cap the length before a command
/// string is written to any log or audit record.
pub fn sanitize_command_for_logging(command: &str) -> String {
    let mut sanitized = if command.len() > 200 {
        let cut = command
            .char_indices()
            .take_while(|(i, _)| *i <= 200)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(command.len());
        format!("{}...", &command[..cut])
    } else {
        command.to_string()
    };

    for (pattern, replacement) in SENSITIVE_PATTERNS.iter() {
        sanitized = pattern.replace_all(&sanitized, *replacement).to_string();
    }

    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_commands_pass() {
        let validator = DenyListValidator;
        for command in [
            "ls -la",
            "cat /etc/os-release",
            "echo hi",
            "ps aux",
            "df -h",
            "uptime",
        ] {
            assert!(validator.validate(command).is_ok(), "{} rejected", command);
        }
    }

    #[test]
    fn test_metacharacters_rejected() {
        let validator = DenyListValidator;
        for command in [
            "ls; rm -rf /",
            "ls | cat",
            "ls && reboot",
            "ls > /tmp/out",
            "ls `id`",
            "echo $HOME",
        ] {
            assert!(validator.validate(command).is_err(), "{} accepted", command);
        }
    }

    #[test]
    fn test_destructive_verbs_rejected() {
        let validator = DenyListValidator;
        for command in [
            "rm /tmp/file",
            "/usr/bin/rm file.txt",
            "dd if=/dev/zero of=/dev/sda",
            "mkfs.ext4 /dev/sda1",
            "shutdown -h now",
            "reboot",
            "killall -9 sshd",
        ] {
            assert!(validator.validate(command).is_err(), "{} accepted", command);
        }
    }

    #[test]
    fn test_length_and_emptiness() {
        let validator = DenyListValidator;
        assert!(validator.validate("").is_err());
        assert!(validator.validate("   ").is_err());
        assert!(validator.validate(&"a".repeat(MAX_COMMAND_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_accept_all_accepts_everything() {
        assert!(AcceptAllValidator.validate("rm -rf /").is_ok());
    }

    #[test]
    fn test_sanitize_masks_credentials() {
        let sanitized = sanitize_command_for_logging("mysql -u root password=hunter2");
        assert!(sanitized.contains("password=***"));
        assert!(!sanitized.contains("hunter2"));

        let sanitized = sanitize_command_for_logging("curl -H token=abc123 https://x");
        assert!(!sanitized.contains("abc123"));
    }

    #[test]
    fn test_sanitize_caps_length() {
        let long = "x".repeat(500);
        let sanitized = sanitize_command_for_logging(&long);
        assert!(sanitized.len() < 220);
        assert!(sanitized.ends_with("..."));
    }
}
