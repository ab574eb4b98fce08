//! Capability policy evaluated by the admission gate.
//!
//! The policy is plain configuration: the gate never hard-codes what is
//! allowed. Name patterns are dotted names; a trailing `*` makes a pattern
//! match by prefix (`os.exec*` matches `os.execv`).

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AdmissionPolicy {
    /// Sources longer than this many bytes are rejected before parsing.
    pub max_source_bytes: usize,

    /// Top-level modules that may be imported. Empty means any module.
    pub allowed_modules: Vec<String>,

    /// Modules that may never be imported (submodules included).
    pub denied_modules: Vec<String>,

    /// Dotted call names that are never admitted.
    pub denied_calls: Vec<String>,

    /// Reject any call passing `shell=True`.
    pub deny_shell_true: bool,

    /// Calls that start a process from an argv (`subprocess.run([...])`).
    pub process_calls: Vec<String>,

    /// Programs that may not be launched through `process_calls`.
    /// Compared case-insensitively against the program's file name.
    pub shell_programs: Vec<String>,

    /// Calls that import the module named by their first argument.
    pub import_calls: Vec<String>,

    /// Approved filesystem roots. Empty means paths are not checked.
    pub fs_roots: Vec<String>,

    /// Calls whose first argument is a filesystem path.
    pub path_calls: Vec<String>,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            max_source_bytes: 50_000,
            allowed_modules: Vec::new(),
            denied_modules: vec!["ctypes".to_string()],
            denied_calls: [
                "eval",
                "exec",
                "compile",
                "__import__",
                "os.system",
                "os.popen",
                "os.exec*",
                "os.spawn*",
                "pty.spawn",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            deny_shell_true: true,
            process_calls: [
                "subprocess.*",
                "os.spawn*",
                "os.exec*",
                "os.posix_spawn*",
                "asyncio.create_subprocess_exec",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            shell_programs: [
                "sh",
                "bash",
                "zsh",
                "dash",
                "cmd",
                "cmd.exe",
                "powershell",
                "powershell.exe",
                "pwsh",
                "pwsh.exe",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            import_calls: vec!["importlib.import_module".to_string()],
            fs_roots: Vec::new(),
            path_calls: [
                "open",
                "os.remove",
                "os.unlink",
                "os.rmdir",
                "os.mkdir",
                "os.makedirs",
                "os.rename",
                "shutil.rmtree",
                "shutil.move",
                "shutil.copy",
                "shutil.copyfile",
                "pathlib.Path",
                "Path",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl AdmissionPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.max_source_bytes == 0 {
            return Err(anyhow!("admission.max_source_bytes must be > 0"));
        }
        let lists = [
            ("allowed_modules", &self.allowed_modules),
            ("denied_modules", &self.denied_modules),
            ("denied_calls", &self.denied_calls),
            ("process_calls", &self.process_calls),
            ("shell_programs", &self.shell_programs),
            ("import_calls", &self.import_calls),
            ("fs_roots", &self.fs_roots),
            ("path_calls", &self.path_calls),
        ];
        for (name, entries) in lists {
            if entries.iter().any(|entry| entry.trim().is_empty()) {
                return Err(anyhow!("admission.{name} must not contain empty entries"));
            }
        }
        if let Some(root) = self
            .fs_roots
            .iter()
            .find(|root| LexicalPath::parse(root).is_none_or(|path| path.is_relative()))
        {
            return Err(anyhow!("admission.fs_roots entry `{root}` must be an absolute path"));
        }
        Ok(())
    }

    /// Return a rejection reason if importing `module` is not permitted.
    pub fn check_module(&self, module: &str) -> Option<String> {
        if let Some(denied) = self
            .denied_modules
            .iter()
            .find(|entry| module_matches(entry, module))
        {
            return Some(format!("import of `{module}` is denied (matches `{denied}`)"));
        }
        if !self.allowed_modules.is_empty()
            && !self
                .allowed_modules
                .iter()
                .any(|entry| module_matches(entry, module))
        {
            return Some(format!("import of `{module}` is not in the allow-list"));
        }
        None
    }

    /// Return the deny-list entry matching a fully resolved dotted name.
    pub fn denied_call(&self, name: &str) -> Option<&str> {
        self.denied_calls
            .iter()
            .find(|pattern| name_matches(pattern, name))
            .map(String::as_str)
    }

    /// First deny-list entry reachable as a member of `module`
    /// (`from os import *` exposes `os.system`).
    pub fn denied_member_of(&self, module: &str) -> Option<&str> {
        let prefix = format!("{module}.");
        self.denied_calls
            .iter()
            .find(|pattern| pattern.starts_with(&prefix))
            .map(String::as_str)
    }

    pub fn is_process_call(&self, name: &str) -> bool {
        self.process_calls
            .iter()
            .any(|pattern| name_matches(pattern, name))
    }

    pub fn is_import_call(&self, name: &str) -> bool {
        self.import_calls
            .iter()
            .any(|pattern| name_matches(pattern, name))
    }

    /// Return the matching entry when `program` names a denied shell.
    ///
    /// Only the file name counts, so `/bin/sh` and `C:\Windows\cmd.exe` match.
    pub fn shell_program(&self, program: &str) -> Option<&str> {
        let name = program
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(program)
            .to_ascii_lowercase();
        self.shell_programs
            .iter()
            .find(|entry| entry.eq_ignore_ascii_case(&name))
            .map(String::as_str)
    }

    pub fn is_path_call(&self, name: &str) -> bool {
        self.path_calls
            .iter()
            .any(|pattern| name_matches(pattern, name))
    }

    /// Whether a path literal is acceptable under `fs_roots`.
    ///
    /// `.` and `..` segments are resolved lexically before comparing.
    /// Relative paths resolve inside the sandbox working directory and are
    /// accepted unless they climb out of it.
    pub fn path_permitted(&self, path: &str) -> bool {
        if self.fs_roots.is_empty() {
            return true;
        }
        let Some(path) = LexicalPath::parse(path) else {
            return false;
        };
        if path.is_relative() {
            return true;
        }
        self.fs_roots
            .iter()
            .filter_map(|root| LexicalPath::parse(root))
            .any(|root| path.is_within(&root))
    }
}

/// A path literal with `.` and `..` resolved, split into an anchor
/// (`/`, `c:`, `//`, `~`, or empty when relative) and plain segments.
#[derive(Debug, PartialEq, Eq)]
struct LexicalPath {
    anchor: String,
    segments: Vec<String>,
}

impl LexicalPath {
    /// `None` when `..` climbs above a relative start, a home directory,
    /// or a UNC share.
    fn parse(raw: &str) -> Option<Self> {
        let path = raw.replace('\\', "/");
        let (anchor, rest) = if is_drive_path(&path) {
            (path[..2].to_ascii_lowercase(), &path[2..])
        } else if let Some(rest) = path.strip_prefix("//") {
            ("//".to_string(), rest)
        } else if let Some(rest) = path.strip_prefix('/') {
            ("/".to_string(), rest)
        } else if path.starts_with('~') {
            let end = path.find('/').unwrap_or(path.len());
            (path[..end].to_string(), &path[end..])
        } else {
            (String::new(), path.as_str())
        };
        let clamps_at_anchor = anchor == "/" || is_drive_path(&anchor);
        let case_insensitive = is_drive_path(&anchor) || anchor == "//";

        let mut segments: Vec<String> = Vec::new();
        for segment in rest.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    if segments.pop().is_none() && !clamps_at_anchor {
                        return None;
                    }
                }
                segment if case_insensitive => segments.push(segment.to_ascii_lowercase()),
                segment => segments.push(segment.to_string()),
            }
        }
        Some(Self { anchor, segments })
    }

    fn is_relative(&self) -> bool {
        self.anchor.is_empty()
    }

    fn is_within(&self, root: &LexicalPath) -> bool {
        self.anchor == root.anchor && self.segments.starts_with(&root.segments)
    }
}

fn module_matches(entry: &str, module: &str) -> bool {
    module == entry
        || module
            .strip_prefix(entry)
            .is_some_and(|rest| rest.starts_with('.'))
}

fn name_matches(pattern: &str, name: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => pattern == name,
    }
}

fn is_drive_path(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && bytes.get(2).is_none_or(|b| *b == b'/' || *b == b'\\')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_validates() {
        AdmissionPolicy::default().validate().expect("valid");
    }

    #[test]
    fn empty_entries_are_rejected() {
        let policy = AdmissionPolicy {
            denied_calls: vec![" ".to_string()],
            ..AdmissionPolicy::default()
        };
        let err = policy.validate().expect_err("invalid");
        assert!(err.to_string().contains("denied_calls"));
    }

    #[test]
    fn denied_module_covers_submodules_but_not_prefixes() {
        let policy = AdmissionPolicy {
            denied_modules: vec!["ctypes".to_string()],
            ..AdmissionPolicy::default()
        };
        assert!(policy.check_module("ctypes").is_some());
        assert!(policy.check_module("ctypes.wintypes").is_some());
        assert!(policy.check_module("ctypesx").is_none());
    }

    #[test]
    fn allow_list_applies_when_non_empty() {
        let policy = AdmissionPolicy {
            allowed_modules: vec!["os".to_string(), "pyautogui".to_string()],
            ..AdmissionPolicy::default()
        };
        assert!(policy.check_module("os.path").is_none());
        assert!(policy.check_module("pyautogui").is_none());
        let reason = policy.check_module("requests").expect("rejected");
        assert!(reason.contains("not in the allow-list"));
    }

    #[test]
    fn call_patterns_support_prefix_wildcards() {
        let policy = AdmissionPolicy::default();
        assert_eq!(policy.denied_call("os.execvp"), Some("os.exec*"));
        assert_eq!(policy.denied_call("eval"), Some("eval"));
        assert_eq!(policy.denied_call("os.path.join"), None);
        assert_eq!(policy.denied_call("evaluate"), None);
    }

    #[test]
    fn paths_are_checked_against_roots() {
        let policy = AdmissionPolicy {
            fs_roots: vec!["/home/user/Documents".to_string(), "C:\\Users\\me".to_string()],
            ..AdmissionPolicy::default()
        };
        assert!(policy.path_permitted("notes.txt"));
        assert!(policy.path_permitted("/home/user/Documents/report.docx"));
        assert!(!policy.path_permitted("/home/user/Documents-old/x"));
        assert!(!policy.path_permitted("/etc/passwd"));
        assert!(policy.path_permitted("c:/users/me/Desktop/a.png"));
        assert!(!policy.path_permitted("D:\\secrets.txt"));
    }

    #[test]
    fn parent_segments_are_resolved_before_root_check() {
        let policy = AdmissionPolicy {
            fs_roots: vec!["/home/user".to_string(), "C:\\Users\\me".to_string()],
            ..AdmissionPolicy::default()
        };
        assert!(!policy.path_permitted("/home/user/../../etc/shadow"));
        assert!(!policy.path_permitted("/home/user/.."));
        assert!(policy.path_permitted("/home/user/a/../b/./c.txt"));
        assert!(!policy.path_permitted("C:\\Users\\me\\..\\other\\x"));
        // `/..` is `/`.
        assert!(!policy.path_permitted("/../../etc"));
        assert!(policy.path_permitted("/../home/user/x"));
    }

    #[test]
    fn relative_paths_may_not_climb_out_of_the_sandbox() {
        let policy = AdmissionPolicy {
            fs_roots: vec!["/home/user".to_string()],
            ..AdmissionPolicy::default()
        };
        assert!(policy.path_permitted("out/a.txt"));
        assert!(policy.path_permitted("out/../a.txt"));
        assert!(!policy.path_permitted("../../../../etc"));
        assert!(!policy.path_permitted("out/../../x"));
        assert!(!policy.path_permitted("~/../root"));
    }

    #[test]
    fn relative_roots_are_rejected() {
        let policy = AdmissionPolicy {
            fs_roots: vec!["Documents".to_string()],
            ..AdmissionPolicy::default()
        };
        let err = policy.validate().expect_err("invalid");
        assert!(err.to_string().contains("must be an absolute path"));
    }

    #[test]
    fn wildcard_members_and_shell_programs() {
        let policy = AdmissionPolicy::default();
        assert_eq!(policy.denied_member_of("os"), Some("os.system"));
        assert_eq!(policy.denied_member_of("pty"), Some("pty.spawn"));
        assert_eq!(policy.denied_member_of("math"), None);
        assert_eq!(policy.shell_program("/bin/sh"), Some("sh"));
        assert_eq!(policy.shell_program("C:\\Windows\\System32\\CMD.EXE"), Some("cmd.exe"));
        assert_eq!(policy.shell_program("notepad.exe"), None);
        assert!(policy.is_process_call("subprocess.Popen"));
        assert!(!policy.is_process_call("os.path.join"));
    }

    #[test]
    fn no_roots_means_any_path() {
        let policy = AdmissionPolicy::default();
        assert!(policy.path_permitted("/etc/passwd"));
    }
}
