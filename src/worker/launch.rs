//! Launch resolution
//!
//! Turns a start request into a concrete program, argument list, working
//! directory, environment and descriptor table. Nothing here touches the
//! process table, so the rules can be tested directly.

use std::collections::BTreeMap;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};

use nix::unistd::{getuid, User};

use crate::config::WorkerSettings;
use crate::process::FdMapping;
use crate::protocol::{StartRequest, EDITOR_COMMAND, FIRST_AUX_SLOT, PAGER_COMMAND};

/// Shell used when nothing else names one
pub const FALLBACK_SHELL: &str = "/bin/sh";

/// Editor used when nothing else names one
pub const FALLBACK_EDITOR: &str = "vi";

/// Pager used when nothing else names one
pub const FALLBACK_PAGER: &str = "less";

/// The parts of the worker's own environment that launch resolution reads
#[derive(Debug, Clone, Default)]
pub struct HostEnv {
    pub shell: Option<String>,
    pub visual: Option<String>,
    pub editor: Option<String>,
    pub pager: Option<String>,
    pub home: Option<PathBuf>,
    /// Shell from the password database
    pub login_shell: Option<String>,
    /// The worker's environment, overlaid by each request
    pub vars: BTreeMap<String, String>,
}

impl HostEnv {
    /// Snapshot the current process environment
    pub fn current() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|value| !value.is_empty());
        let user = User::from_uid(getuid()).ok().flatten();

        Self {
            shell: var("SHELL"),
            visual: var("VISUAL"),
            editor: var("EDITOR"),
            pager: var("PAGER"),
            home: var("HOME")
                .map(PathBuf::from)
                .or_else(|| user.as_ref().map(|user| user.dir.clone())),
            login_shell: user.map(|user| user.shell.to_string_lossy().into_owned()),
            vars: std::env::vars().collect(),
        }
    }
}

/// Everything needed to start one session's process
#[derive(Debug)]
pub struct Launch {
    pub program: String,
    pub args: Vec<String>,
    /// `argv[0]` when it differs from `program`
    pub arg0: Option<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub inherit: Vec<FdMapping>,
}

impl Launch {
    /// Resolve a request. `fds` are the auxiliary descriptors that came with it.
    pub fn resolve(
        request: StartRequest,
        fds: Vec<OwnedFd>,
        settings: &WorkerSettings,
        host: &HostEnv,
    ) -> Self {
        let StartRequest { args, cwd, env, .. } = request;
        let mut fds = fds.into_iter();
        let mut inherit = Vec::new();

        let (program, args, arg0) = match args.split_first() {
            None => {
                let shell = first_of([&settings.shell, &host.shell, &host.login_shell])
                    .unwrap_or_else(|| FALLBACK_SHELL.to_string());
                let arg0 = format!("-{}", basename(&shell));
                (shell, Vec::new(), Some(arg0))
            }
            Some((command, rest)) if command == EDITOR_COMMAND => {
                let editor = first_of([&settings.editor, &host.visual, &host.editor])
                    .unwrap_or_else(|| FALLBACK_EDITOR.to_string());
                let (program, args) = split_command(&editor, rest);
                (program, args, None)
            }
            Some((command, rest)) if command == PAGER_COMMAND => {
                if let Some(input) = fds.next() {
                    inherit.push(FdMapping::new(input, 0));
                }
                let pager = first_of([&settings.pager, &host.pager])
                    .unwrap_or_else(|| FALLBACK_PAGER.to_string());
                let (program, args) = split_command(&pager, rest);
                (program, args, None)
            }
            Some((command, rest)) => (command.clone(), rest.to_vec(), None),
        };

        for (slot, fd) in (FIRST_AUX_SLOT..).zip(fds) {
            inherit.push(FdMapping::new(fd, slot));
        }

        let mut environment = host.vars.clone();
        environment.extend(env);

        Self {
            program,
            args,
            arg0,
            cwd: resolve_cwd(cwd.as_deref(), host.home.as_deref()),
            env: environment,
            inherit,
        }
    }

    /// True for a login shell
    pub fn is_login_shell(&self) -> bool {
        self.arg0.as_deref().is_some_and(|arg0| arg0.starts_with('-'))
    }
}

fn first_of<const N: usize>(candidates: [&Option<String>; N]) -> Option<String> {
    candidates
        .into_iter()
        .flatten()
        .find(|value| !value.trim().is_empty())
        .cloned()
}

/// Split a configured command such as `code --wait` and append `extra`
fn split_command(command: &str, extra: &[String]) -> (String, Vec<String>) {
    let mut words = command.split_whitespace().map(str::to_string);
    let program = words.next().unwrap_or_default();
    let args = words.chain(extra.iter().cloned()).collect();
    (program, args)
}

fn basename(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(path)
}

/// Requested directory if it exists, else home, else `/`
fn resolve_cwd(requested: Option<&str>, home: Option<&Path>) -> PathBuf {
    if let Some(dir) = requested.map(Path::new).filter(|dir| dir.is_dir()) {
        return dir.to_path_buf();
    }
    if let Some(home) = home.filter(|home| home.is_dir()) {
        return home.to_path_buf();
    }
    PathBuf::from("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::OFlag;
    use nix::unistd::pipe2;
    use std::os::fd::AsRawFd;

    fn host() -> HostEnv {
        HostEnv {
            shell: Some("/bin/bash".to_string()),
            visual: None,
            editor: Some("nano".to_string()),
            pager: Some("more".to_string()),
            home: Some(PathBuf::from("/tmp")),
            login_shell: Some("/bin/zsh".to_string()),
            vars: BTreeMap::from([
                ("PATH".to_string(), "/usr/bin:/bin".to_string()),
                ("TERM".to_string(), "dumb".to_string()),
            ]),
        }
    }

    fn request(args: &[&str]) -> StartRequest {
        StartRequest::new(args.iter().map(|s| s.to_string()).collect())
    }

    fn resolve(request: StartRequest, fds: Vec<OwnedFd>) -> Launch {
        Launch::resolve(request, fds, &WorkerSettings::default(), &host())
    }

    #[test]
    fn test_login_shell_from_environment() {
        let launch = resolve(StartRequest::shell(), Vec::new());
        assert_eq!(launch.program, "/bin/bash");
        assert!(launch.args.is_empty());
        assert_eq!(launch.arg0.as_deref(), Some("-bash"));
        assert!(launch.is_login_shell());
    }

    #[test]
    fn test_login_shell_fallbacks() {
        let settings = WorkerSettings {
            shell: Some("/usr/bin/fish".to_string()),
            ..WorkerSettings::default()
        };
        let launch = Launch::resolve(StartRequest::shell(), Vec::new(), &settings, &host());
        assert_eq!(launch.program, "/usr/bin/fish");
        assert_eq!(launch.arg0.as_deref(), Some("-fish"));

        let mut env = host();
        env.shell = None;
        let launch = Launch::resolve(StartRequest::shell(), Vec::new(), &WorkerSettings::default(), &env);
        assert_eq!(launch.program, "/bin/zsh");

        let launch = Launch::resolve(
            StartRequest::shell(),
            Vec::new(),
            &WorkerSettings::default(),
            &HostEnv::default(),
        );
        assert_eq!(launch.program, FALLBACK_SHELL);
        assert_eq!(launch.arg0.as_deref(), Some("-sh"));
    }

    #[test]
    fn test_plain_command() {
        let launch = resolve(request(&["ls", "-l", "/"]), Vec::new());
        assert_eq!(launch.program, "ls");
        assert_eq!(launch.args, vec!["-l".to_string(), "/".to_string()]);
        assert!(launch.arg0.is_none());
        assert!(!launch.is_login_shell());
    }

    #[test]
    fn test_editor_resolution() {
        let launch = resolve(request(&[EDITOR_COMMAND, "notes.txt"]), Vec::new());
        assert_eq!(launch.program, "nano");
        assert_eq!(launch.args, vec!["notes.txt".to_string()]);

        let mut env = host();
        env.visual = Some("code --wait".to_string());
        let launch = Launch::resolve(
            request(&[EDITOR_COMMAND, "a.rs"]),
            Vec::new(),
            &WorkerSettings::default(),
            &env,
        );
        assert_eq!(launch.program, "code");
        assert_eq!(launch.args, vec!["--wait".to_string(), "a.rs".to_string()]);

        let launch = Launch::resolve(
            request(&[EDITOR_COMMAND]),
            Vec::new(),
            &WorkerSettings::default(),
            &HostEnv::default(),
        );
        assert_eq!(launch.program, FALLBACK_EDITOR);
    }

    #[test]
    fn test_pager_takes_first_descriptor_as_stdin() {
        let (reader, _writer) = pipe2(OFlag::O_CLOEXEC).unwrap();
        let (extra, _extra_writer) = pipe2(OFlag::O_CLOEXEC).unwrap();
        let reader_raw = reader.as_raw_fd();
        let extra_raw = extra.as_raw_fd();

        let launch = resolve(request(&[PAGER_COMMAND, "-"]), vec![reader, extra]);
        assert_eq!(launch.program, "more");
        assert_eq!(launch.args, vec!["-".to_string()]);

        let slots: Vec<(i32, i32)> = launch
            .inherit
            .iter()
            .map(|mapping| (mapping.fd.as_raw_fd(), mapping.slot))
            .collect();
        assert_eq!(slots, vec![(reader_raw, 0), (extra_raw, FIRST_AUX_SLOT)]);
    }

    #[test]
    fn test_aux_descriptors_start_at_first_slot() {
        let fds: Vec<OwnedFd> = (0..3).map(|_| pipe2(OFlag::O_CLOEXEC).unwrap().0).collect();
        let launch = resolve(request(&["cat"]), fds);
        let slots: Vec<i32> = launch.inherit.iter().map(|mapping| mapping.slot).collect();
        assert_eq!(slots, vec![3, 4, 5]);
    }

    #[test]
    fn test_environment_overlay() {
        let mut request = request(&["env"]);
        request.env = BTreeMap::from([
            ("TERM".to_string(), "xterm-256color".to_string()),
            ("EXTRA".to_string(), "1".to_string()),
        ]);

        let launch = resolve(request, Vec::new());
        assert_eq!(launch.env["TERM"], "xterm-256color");
        assert_eq!(launch.env["EXTRA"], "1");
        assert_eq!(launch.env["PATH"], "/usr/bin:/bin");
    }

    #[test]
    fn test_working_directory_fallbacks() {
        let launch = resolve(request(&["pwd"]).with_cwd(Some("/".to_string())), Vec::new());
        assert_eq!(launch.cwd, PathBuf::from("/"));

        let launch = resolve(
            request(&["pwd"]).with_cwd(Some("/nonexistent/boxi".to_string())),
            Vec::new(),
        );
        assert_eq!(launch.cwd, PathBuf::from("/tmp"));

        assert_eq!(
            resolve_cwd(Some("/nonexistent/boxi"), Some(Path::new("/nonexistent/home"))),
            PathBuf::from("/")
        );
        assert_eq!(resolve_cwd(None, None), PathBuf::from("/"));
    }
}
