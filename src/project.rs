//! Project recognition and container command rewriting.
//!
//! A working directory maps to one of a closed set of project kinds by
//! substring. The kind decides the configuration key, the display name and how
//! a command is wrapped to run inside the project's compose service.

use std::path::Path;

const WEB_SERVER_MARKER: &str = "zotonic";
const APP_FRAMEWORK_MARKER: &str = "phoenix";
const EXTENSION_MARKER: &str = "plugin";

/// Compose definitions that enable containerized execution.
pub const COMPOSE_FILES: [&str; 2] = ["docker-compose.yml", "docker-compose.yaml"];

const COMPOSE_RUN: &str =
    "stdbuf -o0 -e0 docker compose --ansi=always --verbose --progress=plain -f docker-compose.yml run --rm";
const COMPOSE_EXEC: &str = "stdbuf -o0 -e0 docker-compose --ansi=always --verbose exec";

const WEB_SERVER_WORKDIR: &str = "/opt/zotonic";
const WEB_SERVER_SERVICE: &str = "zotonic";
const APP_WORKDIR: &str = "/app";
const APP_SERVICE: &str = "app";
const GENERIC_SERVICE: &str = "app";

// Commands that need a plain shell inside the web server image instead of its entry point.
const SHELL_CLASS: [&str; 4] = ["make", "bash", "sh", "mise"];

/// The kind of project a working directory belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectKind {
    /// The Erlang web server.
    WebServer,
    /// The Phoenix application.
    AppFramework,
    /// The browser extension.
    Extension,
    /// Anything else, identified by its directory name.
    Other(String),
}

impl ProjectKind {
    pub fn detect(cwd: &Path) -> Self {
        let text = cwd.to_string_lossy();
        if text.contains(WEB_SERVER_MARKER) {
            Self::WebServer
        } else if text.contains(APP_FRAMEWORK_MARKER) {
            Self::AppFramework
        } else if text.contains(EXTENSION_MARKER) {
            Self::Extension
        } else {
            // `/` and paths ending in `..` have no directory name.
            let name = cwd
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            Self::Other(name)
        }
    }

    /// Identifier used for configuration lookup and single-run log names.
    pub fn key(&self) -> &str {
        match self {
            Self::WebServer => "superleme",
            Self::AppFramework => "sl_phoenix",
            Self::Extension => "extension",
            Self::Other(name) => name,
        }
    }

    /// Human-readable name shown on panes.
    pub fn display_name(&self) -> &str {
        match self {
            Self::WebServer => "Superleme",
            Self::AppFramework => "SL Phoenix",
            Self::Extension => "Extension",
            Self::Other(name) => name,
        }
    }

    /// Rewrites `command` to run inside this project's compose service.
    pub fn wrap_for_container(&self, command: &str) -> String {
        match self {
            Self::WebServer if is_shell_class(command) => format!(
                "NO_PROXY=* {COMPOSE_RUN} --entrypoint=\"\" -w {WEB_SERVER_WORKDIR} -e NO_PROXY=* -e TERM=xterm-256color {WEB_SERVER_SERVICE} {command}"
            ),
            Self::WebServer => format!(
                "{COMPOSE_RUN} --service-ports -w {WEB_SERVER_WORKDIR} -e TERM=xterm-256color {WEB_SERVER_SERVICE} {command}"
            ),
            Self::AppFramework => format!(
                "{COMPOSE_RUN} --service-ports -w {APP_WORKDIR} -e TERM=xterm-256color {APP_SERVICE} {command}"
            ),
            Self::Extension | Self::Other(_) => {
                format!("{COMPOSE_EXEC} -e TERM=xterm-256color {GENERIC_SERVICE} {command}")
            }
        }
    }
}

/// Whether `cwd` holds a compose definition.
pub fn has_compose_file(cwd: &Path) -> bool {
    COMPOSE_FILES.iter().any(|name| cwd.join(name).is_file())
}

fn is_shell_class(command: &str) -> bool {
    let first = match shell_words::split(command) {
        Ok(words) => words.into_iter().next(),
        Err(_) => command.split_whitespace().next().map(str::to_string),
    };
    first
        .map(|word| SHELL_CLASS.contains(&word.as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn detects_kinds_by_path_substring() {
        assert_eq!(ProjectKind::detect(Path::new("/home/dev/zotonic")), ProjectKind::WebServer);
        assert_eq!(ProjectKind::detect(Path::new("/src/sl_phoenix")), ProjectKind::AppFramework);
        assert_eq!(ProjectKind::detect(Path::new("/src/plugin/chrome")), ProjectKind::Extension);
        assert_eq!(
            ProjectKind::detect(Path::new("/src/tools")),
            ProjectKind::Other("tools".into())
        );
    }

    #[test]
    fn web_server_marker_wins_over_others() {
        let kind = ProjectKind::detect(Path::new("/zotonic/apps_user/phoenix_plugin"));
        assert_eq!(kind, ProjectKind::WebServer);
    }

    #[test]
    fn keys_and_display_names() {
        assert_eq!(ProjectKind::WebServer.key(), "superleme");
        assert_eq!(ProjectKind::AppFramework.display_name(), "SL Phoenix");
        assert_eq!(ProjectKind::Extension.key(), "extension");
        let other = ProjectKind::Other("scratch".into());
        assert_eq!(other.key(), "scratch");
        assert_eq!(other.display_name(), "scratch");
    }

    #[test]
    fn paths_without_a_directory_name_get_an_empty_name() {
        assert_eq!(ProjectKind::detect(Path::new("/")), ProjectKind::Other(String::new()));
        assert_eq!(
            ProjectKind::detect(Path::new("/srv/tools/..")),
            ProjectKind::Other(String::new())
        );
    }

    #[test]
    fn make_in_web_server_bypasses_entry_point() {
        let wrapped = ProjectKind::WebServer.wrap_for_container("make");
        assert!(wrapped.starts_with("NO_PROXY=* stdbuf -o0 -e0 docker compose"));
        assert!(wrapped.contains("--entrypoint=\"\" -w /opt/zotonic"));
        assert!(wrapped.contains("-e NO_PROXY=*"));
        assert!(!wrapped.contains("--service-ports"));
        assert!(wrapped.ends_with("zotonic make"));
    }

    #[test]
    fn other_web_server_commands_publish_ports() {
        let wrapped = ProjectKind::WebServer.wrap_for_container("./run.sh");
        assert!(wrapped.contains("--service-ports -w /opt/zotonic -e TERM=xterm-256color zotonic ./run.sh"));
        assert!(!wrapped.contains("--entrypoint"));
    }

    #[test]
    fn shell_class_matches_whole_first_word() {
        assert!(is_shell_class("bash -c 'echo hi'"));
        assert!(is_shell_class("mise x -- erl"));
        assert!(!is_shell_class("shasum file"));
        assert!(!is_shell_class(""));
        assert!(is_shell_class("make 'unterminated"));
    }

    #[test]
    fn app_framework_runs_in_app_service() {
        let wrapped = ProjectKind::AppFramework.wrap_for_container("mix deps.get");
        assert_eq!(
            wrapped,
            "stdbuf -o0 -e0 docker compose --ansi=always --verbose --progress=plain -f docker-compose.yml run --rm --service-ports -w /app -e TERM=xterm-256color app mix deps.get"
        );
    }

    #[test]
    fn generic_projects_exec_into_service() {
        let wrapped = ProjectKind::Other("api".into()).wrap_for_container("make test");
        assert_eq!(
            wrapped,
            "stdbuf -o0 -e0 docker-compose --ansi=always --verbose exec -e TERM=xterm-256color app make test"
        );
    }

    #[test]
    fn compose_detection_accepts_both_extensions() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!has_compose_file(dir.path()));
        std::fs::write(dir.path().join("docker-compose.yaml"), "services: {}\n").unwrap();
        assert!(has_compose_file(dir.path()));
        assert!(!has_compose_file(&PathBuf::from("/definitely/missing")));
    }
}
