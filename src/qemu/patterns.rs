//! Console patterns and guest protocol markers.
//!
//! The console patterns recognize what the guest prints on its own (getty
//! prompts, shell prompts, kernel panics). The markers are tokens this tool
//! injects into shell commands so their results can be located precisely in
//! the interleaved console stream.

use regex::Regex;

/// Tag identifying which pattern matched during a wait.
///
/// Branching in the session automaton is done on tags, never on the pattern
/// text itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    /// Kernel panic marker. Always listed first: panic beats everything.
    Panic,
    /// getty "login:" prompt.
    LoginPrompt,
    /// "Password:" prompt.
    PasswordPrompt,
    /// Interactive shell prompt.
    ShellPrompt,
    /// Driver already reported running.
    DriverUp,
    /// Driver start command finished with an exit code.
    DriverRc,
    /// In-guest test binary finished with an exit code.
    TestRc,
    /// dd/cmp fallback pipeline finished with an exit code.
    FallbackDone,
}

pub const LOGIN_PROMPT: &str = "(?i)login:";
pub const PASSWORD_PROMPT: &str = "(?i)password:";
pub const SHELL_PROMPT: &str = r"\n.*[#$] ";
pub const PANIC: &str = "panic|PANIC";

pub const DRIVER_UP: &str = "__DRV_UP__";
pub const DRIVER_START_RC: &str = r"__DRV_UP_RC__:(\d+)";
pub const TEST_RC: &str = r"__TEST_RC__:(\d+)";
pub const FALLBACK_DONE: &str = r"__DD_DONE__:(\d+)";
pub const FALLBACK_OK_MARKER: &str = "__DD_OK__";
pub const FALLBACK_SKIP_MARKER: &str = "__DD_SKIP__";
pub const PROBE_START_MARKER: &str = "__PROBE_START__";
pub const PROBE_END_MARKER: &str = "__PROBE_END__";

pub const SUMMARY: &str = r"Summary: pass=(\d+) fail=(\d+) skip=(\d+)";

/// Extract the first numeric capture of a marker pattern from the buffer.
pub fn capture_rc(pattern: &str, buffer: &str) -> Option<u32> {
    let re = Regex::new(pattern).ok()?;
    re.captures(buffer)?.get(1)?.as_str().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_prompt_matches_root_prompt() {
        let re = Regex::new(SHELL_PROMPT).unwrap();
        assert!(re.is_match("\n# "));
        assert!(re.is_match("boot messages\nminix$ "));
        assert!(!re.is_match("no prompt here"));
    }

    #[test]
    fn login_prompt_is_case_insensitive() {
        let re = Regex::new(LOGIN_PROMPT).unwrap();
        assert!(re.is_match("minix Login: "));
        assert!(re.is_match("login:"));
    }

    #[test]
    fn capture_rc_reads_first_occurrence() {
        assert_eq!(capture_rc(TEST_RC, "noise __TEST_RC__:0 later"), Some(0));
        assert_eq!(
            capture_rc(DRIVER_START_RC, "__DRV_UP_RC__:16\n__DRV_UP_RC__:1"),
            Some(16)
        );
        assert_eq!(capture_rc(TEST_RC, "no marker"), None);
    }
}
