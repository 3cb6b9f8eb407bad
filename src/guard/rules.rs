//! Built-in deny rules and the pre-processing passes they depend on.
//!
//! Rules are evaluated in declaration order; hanging rules see the command
//! with quoted strings collapsed, shell-injection rules see it with quoted
//! heredoc bodies removed. The regex crate has no lookahead, so exclusions
//! (`node --eval`) live in a secondary `unless` pattern.

use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleCategory {
    Destructive,
    Hanging,
    NetworkExfil,
    PrivilegeEsc,
    ShellInjection,
}

pub struct DenyRule {
    pub id: &'static str,
    pub category: RuleCategory,
    pub reason: &'static str,
    pattern: Regex,
    unless: Option<Regex>,
}

impl DenyRule {
    pub fn matches(&self, command: &str) -> bool {
        if !self.pattern.is_match(command) {
            return false;
        }
        match &self.unless {
            Some(exception) => !exception.is_match(command),
            None => true,
        }
    }
}

fn ci(pattern: &str) -> Regex {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .unwrap_or_else(|e| panic!("invalid builtin guard pattern `{pattern}`: {e}"))
}

fn cs(pattern: &str) -> Regex {
    Regex::new(pattern)
        .unwrap_or_else(|e| panic!("invalid builtin guard pattern `{pattern}`: {e}"))
}

fn rule(
    id: &'static str,
    category: RuleCategory,
    pattern: Regex,
    reason: &'static str,
) -> DenyRule {
    DenyRule { id, category, reason, pattern, unless: None }
}

static RULES: LazyLock<Vec<DenyRule>> = LazyLock::new(|| {
    vec![
        // Destructive
        rule(
            "rm-rf-root",
            RuleCategory::Destructive,
            ci(r"\brm\s+(?:(?:-[a-z]*r[a-z]*f[a-z]*|-[a-z]*f[a-z]*r[a-z]*)|-r\s+-f|-f\s+-r)\s+(?:--\s+)?(?:/+\*?|~/?|\.\.|\*)(?:\s|$|[;&|])"),
            "Recursive force-delete of a protected path",
        ),
        rule(
            "mkfs",
            RuleCategory::Destructive,
            ci(r"\bmkfs(?:\.[a-z0-9]+)?\b"),
            "Filesystem creation destroys the target device",
        ),
        rule(
            "dd-device",
            RuleCategory::Destructive,
            ci(r"\bdd\b[^|;&]*\bof=/dev/"),
            "Raw write to a device node",
        ),
        rule(
            "shred",
            RuleCategory::Destructive,
            ci(r"\bshred\b"),
            "Secure deletion is unrecoverable",
        ),
        rule(
            "wipefs",
            RuleCategory::Destructive,
            ci(r"\bwipefs\b"),
            "Wiping filesystem signatures is unrecoverable",
        ),
        // Hanging (auto-promoted to background, never blocked)
        DenyRule {
            id: "node-server-file",
            category: RuleCategory::Hanging,
            reason: "Running a Node entry point usually never exits",
            pattern: ci(r"\bnode\s+(?:-[a-z-]+\s+)*\S+\.(?:js|ts|mjs|cjs)\b"),
            unless: Some(ci(r"(?:^|\s)(?:--eval|-e)(?:\s|=|$)")),
        },
        rule(
            "npm-start",
            RuleCategory::Hanging,
            ci(r"\bnpm\s+start\b"),
            "npm start runs a long-lived server",
        ),
        rule(
            "npm-dev-script",
            RuleCategory::Hanging,
            ci(r"\bnpm\s+run\s+(?:dev|serve|watch)\b"),
            "Dev/serve/watch scripts never exit",
        ),
        rule(
            "yarn-start",
            RuleCategory::Hanging,
            ci(r"\byarn\s+(?:start|dev|serve)\b"),
            "yarn start/dev/serve runs a long-lived server",
        ),
        rule(
            "pnpm-start",
            RuleCategory::Hanging,
            ci(r"\bpnpm\s+(?:start|dev|serve)\b"),
            "pnpm start/dev/serve runs a long-lived server",
        ),
        rule(
            "python-server",
            RuleCategory::Hanging,
            ci(r"\bpython[23]?\b.*(?:\bserver\b|\bapp\.py\b|manage\.py\s+runserver)"),
            "Python servers never exit",
        ),
        rule(
            "tail-follow",
            RuleCategory::Hanging,
            ci(r"\btail\b[^|;&]*(?:\s-[a-z]*f\b|--follow\b)"),
            "tail -f follows forever",
        ),
        rule(
            "sleep-long",
            RuleCategory::Hanging,
            ci(r"\bsleep\s+(?:infinity|[1-9]\d{3,})\b"),
            "Very long sleeps stall the mission",
        ),
        rule(
            "yes",
            RuleCategory::Hanging,
            ci(r"(?:^|[;&|]\s*)yes\b(?:\s+[^|;&]*)?$"),
            "yes emits output forever",
        ),
        rule(
            "cat-stdin",
            RuleCategory::Hanging,
            ci(r"(?:^|[;&|]\s*)cat\s*$"),
            "cat without arguments waits on stdin",
        ),
        // Network exfiltration
        DenyRule {
            id: "curl-upload",
            category: RuleCategory::NetworkExfil,
            reason: "curl upload flags can exfiltrate workspace files",
            // Case-sensitive: -F/-T are uploads, -f/-t are not.
            pattern: cs(r"\bcurl\b[^|;&]*(?:\s-[A-Za-z]*[FT]\b|--upload-file\b|--data(?:-\w+)?[\s=]+@|\s-d\s+@)"),
            unless: None,
        },
        rule(
            "nc-listen-exec",
            RuleCategory::NetworkExfil,
            ci(r"\b(?:nc|ncat|netcat)\b[^|;&]*\s-[a-z]*[lec][a-z]*\b"),
            "netcat listeners and exec shells are not allowed",
        ),
        rule(
            "wget-post",
            RuleCategory::NetworkExfil,
            ci(r"\bwget\b[^|;&]*--post"),
            "wget --post-* can exfiltrate workspace files",
        ),
        rule(
            "scp-rsync-remote",
            RuleCategory::NetworkExfil,
            ci(r"\b(?:scp|rsync)\b[^|;&]*\S+@\S+"),
            "Copying to a remote host is not allowed",
        ),
        // Privilege escalation
        rule(
            "sudo",
            RuleCategory::PrivilegeEsc,
            ci(r"(?:^|[;&|]\s*)sudo\b"),
            "sudo is not available in the sandbox",
        ),
        rule(
            "su-root",
            RuleCategory::PrivilegeEsc,
            ci(r"\bsu\s+(?:root\b|-(?:\s|$))"),
            "Switching to root is not allowed",
        ),
        rule(
            "chmod-dangerous",
            RuleCategory::PrivilegeEsc,
            ci(r"\bchmod\s+(?:-[a-z]+\s+)*(?:777|666|[ugoa]*\+[rwx]*s|o\+w|a\+w)\b"),
            "World-writable or setuid permissions are not allowed",
        ),
        rule(
            "chown-root",
            RuleCategory::PrivilegeEsc,
            ci(r"\bchown\s+(?:-[a-z]+\s+)*(?:root|0)\b"),
            "Changing ownership to root is not allowed",
        ),
        // Shell injection
        rule(
            "eval",
            RuleCategory::ShellInjection,
            ci(r"\beval\s"),
            "eval obscures the executed command",
        ),
        rule(
            "backticks",
            RuleCategory::ShellInjection,
            ci(r"`[^`]*`"),
            "Command substitution via back-ticks is not allowed",
        ),
        rule(
            "fork-bomb",
            RuleCategory::ShellInjection,
            ci(r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:"),
            "Fork bomb",
        ),
        rule(
            "base64-pipe-shell",
            RuleCategory::ShellInjection,
            ci(r"\bbase64\b[^|]*(?:-d\b|--decode\b)[^|]*\|\s*(?:sh|bash|zsh)\b"),
            "Decoding straight into a shell hides the payload",
        ),
        rule(
            "curl-pipe-shell",
            RuleCategory::ShellInjection,
            ci(r"\bcurl\b[^|]*\|\s*(?:sh|bash|zsh|source)\b"),
            "Piping a download into a shell is not allowed",
        ),
        rule(
            "wget-pipe-shell",
            RuleCategory::ShellInjection,
            ci(r"\bwget\b[^|]*\|\s*(?:sh|bash|zsh|source)\b"),
            "Piping a download into a shell is not allowed",
        ),
    ]
});

pub fn builtin_rules() -> &'static [DenyRule] {
    &RULES
}

static HEREDOC_OPEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<<-?\s*(?:'(?P<sq>[A-Za-z_][A-Za-z0-9_]*)'|"(?P<dq>[A-Za-z_][A-Za-z0-9_]*)")"#)
        .expect("heredoc pattern compiles")
});

/// Remove the bodies of quoted heredocs (`<<'EOF'` / `<<"EOF"`), keeping the
/// opening line. Unquoted heredocs expand variables and stay dangerous, so
/// they are left intact. Line-oriented: the current delimiter is kept until a
/// line equals it exactly (after trimming).
pub fn strip_quoted_heredocs(command: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut delimiter: Option<String> = None;

    for line in command.lines() {
        if let Some(delim) = &delimiter {
            if line.trim() == delim {
                delimiter = None;
            }
            continue;
        }
        if let Some(caps) = HEREDOC_OPEN.captures(line) {
            let delim = caps
                .name("sq")
                .or_else(|| caps.name("dq"))
                .map(|m| m.as_str().to_string());
            delimiter = delim;
        }
        out.push(line);
    }

    out.join("\n")
}

/// Collapse the content of single- and double-quoted strings to nothing, so
/// e.g. `npm pkg set scripts.start="node src/server.js"` does not look like a
/// hanging `node` invocation. Quote characters themselves are kept.
pub fn strip_quoted_strings(command: &str) -> String {
    #[derive(PartialEq)]
    enum State {
        Plain,
        Single,
        Double,
    }

    let mut out = String::with_capacity(command.len());
    let mut state = State::Plain;
    let mut chars = command.chars();

    while let Some(c) = chars.next() {
        match state {
            State::Plain => {
                if c == '\'' {
                    state = State::Single;
                } else if c == '"' {
                    state = State::Double;
                }
                out.push(c);
            }
            State::Single => {
                if c == '\'' {
                    state = State::Plain;
                    out.push(c);
                }
            }
            State::Double => {
                if c == '\\' {
                    // Skip the escaped character entirely.
                    chars.next();
                } else if c == '"' {
                    state = State::Plain;
                    out.push(c);
                }
            }
        }
    }

    out
}

/// Fallback readiness pattern when no framework is recognised.
pub const DEFAULT_READY_PATTERN: &str = "listening on|ready|started|running";

/// Guess a readiness regex for a command promoted to background.
pub fn guess_ready_pattern(command: &str) -> String {
    let lower = command.to_lowercase();
    let table: &[(&str, &str)] = &[
        ("next", "ready|started server"),
        ("vite", "ready in|local:"),
        ("nuxt", "listening on|nuxt"),
        ("ng serve", "compiled successfully|listening on"),
        ("django", "starting development server"),
        ("manage.py runserver", "starting development server"),
        ("flask", "running on"),
        ("rails", "listening on|puma"),
        ("tail -f", "."),
    ];
    for (needle, pattern) in table {
        if lower.contains(needle) {
            return (*pattern).to_string();
        }
    }
    DEFAULT_READY_PATTERN.to_string()
}
