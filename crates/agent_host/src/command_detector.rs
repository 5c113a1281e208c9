//! Finds a shell command the assistant says it wants to run.
//!
//! Only finished responses are scanned. Rules are tried in order and the first one
//! that yields a usable command wins. A command that looks destructive voids the
//! whole detection.

use regex::Regex;
use shared::agent_api::strip_reasoning;
use shared::commands::CommandCandidate;
use std::sync::LazyLock;

/// (name, pattern, description). Capture group 1 is the raw command.
const RULE_TABLE: &[(&str, &str, &str)] = &[
    (
        "intent_inline",
        r"(?i)\b(?:I'll|I will|I'm going to|I am going to|let me)\s+(?:execute|run)\s+(?:this|the following|a|the)\s+command\s*:?\s*`([^`\n]+)`",
        "Command the assistant said it would run",
    ),
    (
        "intent_fenced",
        r"(?i)\b(?:I'll|I will|I'm going to|I am going to|let me)\s+(?:execute|run)\b[^\n]*\s*```[ \t]*(?:[A-Za-z]+)?[ \t]*\n[ \t]*([^\n`]+)",
        "Command the assistant said it would run",
    ),
    (
        "let_me_run",
        r"(?i)\blet me run\s*:?\s*`([^`\n]+)`",
        "Command the assistant said it would run",
    ),
    (
        "run_this",
        r"(?im)^[ \t>*_-]*(?:run|execute|try) this(?: command)?\s*:[ \t]*`?([^`\n]+?)`?[ \t]*$",
        "Command suggested by the assistant",
    ),
    (
        "sudo_line",
        r"(?m)^[ \t]*(?:\$[ \t]+)?(sudo[ \t]+[^\n`]+?)[ \t]*$",
        "Privileged command in the response",
    ),
    (
        "numbered_step",
        r"(?im)^[ \t]*\d+[.)][ \t]+(?:\*\*)?(?:run|execute)(?:\*\*)?(?:[ \t]+(?:the[ \t]+)?command)?[ \t]*:?[ \t]*`([^`\n]+)`",
        "Step from a numbered list of commands",
    ),
];

/// Commands that are never offered for approval
const DENY_TABLE: &[(&str, &str)] = &[
    ("rm_recursive_force", r"\brm\s+(?:-[A-Za-z]+\s+)*-[A-Za-z]*(?:[rR][A-Za-z]*f|f[A-Za-z]*[rR])"),
    ("rm_split_flags", r"\brm\s+(?:-[A-Za-z]+\s+)*-[A-Za-z]*[rR][A-Za-z]*\s+(?:-[A-Za-z]+\s+)*-[A-Za-z]*f"),
    ("rm_split_flags", r"\brm\s+(?:-[A-Za-z]+\s+)*-[A-Za-z]*f[A-Za-z]*\s+(?:-[A-Za-z]+\s+)*-[A-Za-z]*[rR]"),
    ("rm_long_flags", r"\brm\b.*(?:--recursive.*--force|--force.*--recursive|--no-preserve-root)"),
    ("dd_raw", r"\bdd\b.*\b(?:if|of)="),
    ("mkfs", r"\bmkfs(?:\.[A-Za-z0-9]+)?\b"),
    ("partition_tool", r"\b(?:fdisk|sfdisk|gdisk|parted|wipefs)\b"),
    ("fork_bomb", r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:"),
    ("raw_device_write", r">\s*/dev/(?:sd[a-z]|hd[a-z]|nvme\d|mmcblk\d|disk\d)"),
    ("chmod_root", r"\bchmod\s+(?:-[A-Za-z]+\s+)*0?777\s+/(?:\s|$)"),
    ("chown_root", r"\bchown\s+-[A-Za-z]*R[A-Za-z]*\s+\S+\s+/(?:\s|$)"),
    ("sudo_destructive", r"\bsudo\s+(?:-\S+\s+)*(?:rm|dd|mkfs\S*|shred|shutdown|reboot|halt|poweroff)\b"),
];

const LANGUAGE_HINTS: &[&str] = &[
    "bash", "sh", "shell", "zsh", "console", "terminal", "powershell", "ps", "cmd", "fish",
];
/// Hints that are never a real executable, dropped even on the same line as the command
const INLINE_HINTS: &[&str] = &["shell", "console", "terminal"];

const MIN_COMMAND_CHARS: usize = 2;

static HTML_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"</?[A-Za-z][^<>]*>").expect("valid tag regex"));

#[derive(Debug, Clone)]
pub struct CommandRule {
    pub name: &'static str,
    pub pattern: Regex,
    pub description: &'static str,
}

static BUILTIN_RULES: LazyLock<Vec<CommandRule>> = LazyLock::new(|| {
    RULE_TABLE
        .iter()
        .map(|&(name, pattern, description)| CommandRule {
            name,
            pattern: Regex::new(pattern).expect("valid command rule"),
            description,
        })
        .collect()
});

static DENYLIST: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    DENY_TABLE
        .iter()
        .map(|&(name, pattern)| (name, Regex::new(pattern).expect("valid deny rule")))
        .collect()
});

#[derive(Debug, Clone)]
pub struct CommandDetector {
    rules: Vec<CommandRule>,
}

impl Default for CommandDetector {
    fn default() -> Self {
        Self {
            rules: BUILTIN_RULES.clone(),
        }
    }
}

impl CommandDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// First command found in a finished response, if any
    pub fn detect(&self, finished_text: &str) -> Option<CommandCandidate> {
        let text = strip_reasoning(finished_text);

        for rule in &self.rules {
            let Some(raw) = rule
                .pattern
                .captures(&text)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str())
            else {
                continue;
            };
            let Some(command) = normalize_command(raw) else {
                tracing::debug!("Rule {} matched but {:?} is not a usable command", rule.name, raw);
                continue;
            };
            if let Some(reason) = dangerous_reason(&command) {
                tracing::debug!("Dropping detected command {:?} ({})", command, reason);
                return None;
            }
            tracing::debug!("Rule {} detected command {:?}", rule.name, command);
            return Some(CommandCandidate {
                command,
                description: rule.description.to_string(),
                rule: rule.name.to_string(),
            });
        }
        None
    }
}

/// Clean a raw capture into a runnable command line
pub fn normalize_command(raw: &str) -> Option<String> {
    let without_tags = HTML_TAG.replace_all(raw, " ");
    let decoded = without_tags
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    let unfenced = decoded.replace("```", "\n");

    let mut text = unfenced
        .trim_matches(|c: char| c == '`' || c == '*' || c == '_' || c.is_whitespace())
        .to_string();

    // A hint alone on the first line
    if let Some((first, rest)) = text.split_once('\n') {
        if is_hint(first.trim()) {
            text = rest.trim().to_string();
        }
    }

    let mut tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.first().is_some_and(|t| *t == "$" || *t == ">") {
        tokens.remove(0);
    } else if let Some(first) = tokens.first_mut() {
        let token: &str = *first;
        if let Some(rest) = token.strip_prefix('$') {
            *first = rest;
        }
    }
    if tokens.len() > 1
        && INLINE_HINTS
            .iter()
            .any(|h| tokens[0].eq_ignore_ascii_case(h))
    {
        tokens.remove(0);
    }

    let command = tokens
        .into_iter()
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if command.chars().count() < MIN_COMMAND_CHARS {
        return None;
    }
    Some(command)
}

fn is_hint(token: &str) -> bool {
    LANGUAGE_HINTS.iter().any(|h| token.eq_ignore_ascii_case(h))
}

/// Name of the deny rule `command` trips, if any
pub fn dangerous_reason(command: &str) -> Option<&'static str> {
    DENYLIST
        .iter()
        .find(|(_, re)| re.is_match(command))
        .map(|(name, _)| *name)
}

pub fn is_dangerous(command: &str) -> bool {
    dangerous_reason(command).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detect(text: &str) -> Option<String> {
        CommandDetector::new().detect(text).map(|c| c.command)
    }

    #[test]
    fn test_inline_intent() {
        assert_eq!(
            detect("I'll execute this command: `ls -la`").as_deref(),
            Some("ls -la")
        );
        let c = CommandDetector::new()
            .detect("Sure. I will run the following command: `df -h`")
            .unwrap();
        assert_eq!(c.rule, "intent_inline");
        assert_eq!(c.command, "df -h");
    }

    #[test]
    fn test_fenced_intent() {
        let text = "I'm going to run this command:\n\n```bash\ngit status\n```\nThen we'll see.";
        assert_eq!(detect(text).as_deref(), Some("git status"));
    }

    #[test]
    fn test_other_rules() {
        assert_eq!(detect("Let me run: `uname -a`").as_deref(), Some("uname -a"));
        assert_eq!(detect("Run this: free -m").as_deref(), Some("free -m"));
        assert_eq!(
            detect("You need root:\nsudo apt update\nthen retry").as_deref(),
            Some("sudo apt update")
        );
        assert_eq!(
            detect("Steps:\n1. Run `npm install`\n2. Start it").as_deref(),
            Some("npm install")
        );
    }

    #[test]
    fn test_rule_priority() {
        let text = "Run this: whoami\nI'll execute this command: `pwd`";
        let c = CommandDetector::new().detect(text).unwrap();
        assert_eq!(c.command, "pwd");
        assert_eq!(c.rule, "intent_inline");
    }

    #[test]
    fn test_no_command() {
        assert!(detect("The capital of France is Paris.").is_none());
        assert!(detect("You could run `ls` yourself.").is_none());
        assert!(detect("").is_none());
    }

    #[test]
    fn test_reasoning_is_ignored() {
        let text = "<think>I'll execute this command: `whoami`</think>No command needed.";
        assert!(detect(text).is_none());
    }

    #[test]
    fn test_dangerous_commands_void_detection() {
        assert!(detect("I'll execute this command: `rm -rf /`").is_none());
        assert!(detect("Run this: sudo rm -rf /var").is_none());
        assert!(detect("sudo dd if=/dev/zero of=/dev/sda").is_none());
        assert!(detect("I'll run this command: `:(){ :|:& };:`").is_none());
        // a later safe rule does not rescue a void detection
        assert!(detect("I'll execute this command: `mkfs.ext4 /dev/sdb1`\nRun this: ls").is_none());
    }

    #[test]
    fn test_denylist_table() {
        let cases = [
            ("rm -rf /", true),
            ("rm -fr ~/x", true),
            ("rm -r -f build", true),
            ("rm --recursive --force x", true),
            ("rm file.txt", false),
            ("rm -r dir", false),
            ("dd if=/dev/zero of=disk.img", true),
            ("mkfs.ext4 /dev/sdb1", true),
            ("sudo fdisk -l", true),
            ("echo x > /dev/sda", true),
            ("echo x > /dev/null", false),
            ("chmod -R 777 /", true),
            ("chmod 644 notes.txt", false),
            ("sudo shutdown now", true),
            ("sudo apt install htop", false),
            ("ls -la", false),
        ];
        for (cmd, expected) in cases {
            assert_eq!(is_dangerous(cmd), expected, "{}", cmd);
        }
    }

    #[test]
    fn test_normalize_table() {
        let cases = [
            ("`ls -la`", Some("ls -la")),
            ("```bash\nls -la\n```", Some("ls -la")),
            ("**`git status`**", Some("git status")),
            ("<code>df  -h</code>", Some("df -h")),
            ("$ echo hi", Some("echo hi")),
            ("$echo hi", Some("echo hi")),
            ("  npm   install\n  lodash ", Some("npm install lodash")),
            ("console ls", Some("ls")),
            ("sh script.sh", Some("sh script.sh")),
            ("grep &quot;x&quot; file", Some("grep \"x\" file")),
            ("`a`", None),
            ("", None),
            ("``", None),
        ];
        for (raw, expected) in cases {
            assert_eq!(normalize_command(raw).as_deref(), expected, "{:?}", raw);
        }
    }

    #[test]
    fn test_no_content_dedup() {
        let detector = CommandDetector::new();
        let a = detector.detect("I'll execute this command: `ls`").unwrap();
        let b = detector.detect("I'll execute this command: `ls`").unwrap();
        assert_eq!(a, b);
    }
}
