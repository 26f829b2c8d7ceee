//! Server discovery.
//!
//! Resolution walks a short, fixed list of candidates and picks the first
//! one that exists on disk:
//!
//! 1. the configured override (`sayo-asm.languageServer.path`),
//! 2. the executable bundled under `<extension>/bin/`,
//! 3. a release build, then a debug build, under the first workspace root.
//!
//! Nothing else is searched: no `PATH` lookup, no recursive walk.

use std::fmt;
use std::path::{Path, PathBuf};

/// File name of the language server executable, without platform suffix.
pub const SERVER_BINARY_NAME: &str = "sayo-lsp";

/// Where a candidate path came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOrigin {
    Configured,
    Bundled,
    WorkspaceRelease,
    WorkspaceDebug,
}

impl CandidateOrigin {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Configured => "configured",
            Self::Bundled => "bundled",
            Self::WorkspaceRelease => "workspace release build",
            Self::WorkspaceDebug => "workspace debug build",
        }
    }
}

impl fmt::Display for CandidateOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A possible server location. Existence is checked when resolving, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub origin: CandidateOrigin,
}

/// The executable selected for this activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    path: PathBuf,
    origin: CandidateOrigin,
}

impl Resolution {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn origin(&self) -> CandidateOrigin {
        self.origin
    }

    #[must_use]
    pub fn into_path(self) -> PathBuf {
        self.path
    }
}

/// `sayo-lsp` plus the platform executable suffix.
#[must_use]
pub fn server_binary_file_name() -> String {
    format!("{SERVER_BINARY_NAME}{}", std::env::consts::EXE_SUFFIX)
}

/// All candidates, highest priority first.
///
/// An empty or whitespace-only override is not a candidate; any other
/// override is checked exactly as given. Only the first workspace root
/// contributes development builds.
#[must_use]
pub fn candidates(
    configured_override: Option<&str>,
    install_dir: &Path,
    workspace_roots: &[PathBuf],
) -> Vec<Candidate> {
    let binary = server_binary_file_name();
    let mut out = Vec::with_capacity(4);

    if let Some(configured) = configured_override
        && !configured.trim().is_empty()
    {
        out.push(Candidate {
            path: PathBuf::from(configured),
            origin: CandidateOrigin::Configured,
        });
    }

    out.push(Candidate {
        path: install_dir.join("bin").join(&binary),
        origin: CandidateOrigin::Bundled,
    });

    if let Some(root) = workspace_roots.first() {
        let target = root.join("target");
        out.push(Candidate {
            path: target.join("release").join(&binary),
            origin: CandidateOrigin::WorkspaceRelease,
        });
        out.push(Candidate {
            path: target.join("debug").join(&binary),
            origin: CandidateOrigin::WorkspaceDebug,
        });
    }

    out
}

/// Pick the first existing candidate, or `None` when nothing is installed.
///
/// A configured override that does not exist is skipped, so a stale setting
/// never blocks the bundled or development builds.
#[must_use]
pub fn resolve_server_path(
    configured_override: Option<&str>,
    install_dir: &Path,
    workspace_roots: &[PathBuf],
) -> Option<Resolution> {
    for candidate in candidates(configured_override, install_dir, workspace_roots) {
        if candidate.path.exists() {
            tracing::info!(
                origin = %candidate.origin,
                path = %candidate.path.display(),
                "Using {} LSP server",
                candidate.origin
            );
            return Some(Resolution {
                path: candidate.path,
                origin: candidate.origin,
            });
        }
        if candidate.origin == CandidateOrigin::Configured {
            tracing::debug!(
                path = %candidate.path.display(),
                "Configured LSP server path does not exist; ignoring it"
            );
        } else {
            tracing::trace!(
                origin = %candidate.origin,
                path = %candidate.path.display(),
                "LSP server candidate missing"
            );
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    struct Layout {
        _tmp: TempDir,
        install: PathBuf,
        workspace: PathBuf,
        elsewhere: PathBuf,
    }

    impl Layout {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let install = tmp.path().join("extension");
            let workspace = tmp.path().join("workspace");
            let elsewhere = tmp.path().join("elsewhere");
            fs::create_dir_all(&install).unwrap();
            fs::create_dir_all(&workspace).unwrap();
            fs::create_dir_all(&elsewhere).unwrap();
            Self {
                _tmp: tmp,
                install,
                workspace,
                elsewhere,
            }
        }

        fn touch(path: &Path) -> PathBuf {
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, b"").unwrap();
            path.to_path_buf()
        }

        fn bundled(&self) -> PathBuf {
            Self::touch(&self.install.join("bin").join(server_binary_file_name()))
        }

        fn build(&self, profile: &str) -> PathBuf {
            Self::touch(
                &self
                    .workspace
                    .join("target")
                    .join(profile)
                    .join(server_binary_file_name()),
            )
        }

        fn custom(&self) -> PathBuf {
            Self::touch(&self.elsewhere.join("my-sayo-lsp"))
        }

        fn roots(&self) -> Vec<PathBuf> {
            vec![self.workspace.clone()]
        }
    }

    #[test]
    fn test_existing_override_wins_over_everything() {
        let layout = Layout::new();
        let custom = layout.custom();
        layout.bundled();
        layout.build("release");
        layout.build("debug");

        let resolved = resolve_server_path(
            Some(custom.to_str().unwrap()),
            &layout.install,
            &layout.roots(),
        )
        .unwrap();
        assert_eq!(resolved.path(), custom);
        assert_eq!(resolved.origin(), CandidateOrigin::Configured);
    }

    #[test]
    fn test_existing_override_wins_with_nothing_else_present() {
        let layout = Layout::new();
        let custom = layout.custom();

        let resolved =
            resolve_server_path(Some(custom.to_str().unwrap()), &layout.install, &[]).unwrap();
        assert_eq!(resolved.path(), custom);
    }

    #[test]
    fn test_empty_override_falls_back_to_bundled() {
        let layout = Layout::new();
        let bundled = layout.bundled();

        let resolved = resolve_server_path(Some(""), &layout.install, &layout.roots()).unwrap();
        assert_eq!(resolved.path(), bundled);
        assert_eq!(resolved.origin(), CandidateOrigin::Bundled);
    }

    #[test]
    fn test_padded_override_is_checked_as_given() {
        let layout = Layout::new();
        let custom = layout.custom();
        let bundled = layout.bundled();

        let padded = format!(" {} ", custom.display());
        let resolved = resolve_server_path(Some(&padded), &layout.install, &layout.roots()).unwrap();
        assert_eq!(resolved.path(), bundled);
        assert_eq!(resolved.origin(), CandidateOrigin::Bundled);
    }

    #[test]
    fn test_stale_override_falls_back_to_bundled() {
        let layout = Layout::new();
        let bundled = layout.bundled();

        let resolved =
            resolve_server_path(Some("/no/such/file"), &layout.install, &layout.roots()).unwrap();
        assert_eq!(resolved.path(), bundled);
    }

    #[test]
    fn test_stale_override_is_indistinguishable_from_none() {
        let layout = Layout::new();
        layout.build("debug");

        let without = resolve_server_path(None, &layout.install, &layout.roots());
        let stale = resolve_server_path(
            Some(layout.elsewhere.join("gone").to_str().unwrap()),
            &layout.install,
            &layout.roots(),
        );
        assert_eq!(without, stale);
        assert_eq!(stale.unwrap().origin(), CandidateOrigin::WorkspaceDebug);
    }

    #[test]
    fn test_bundled_precedes_workspace_builds() {
        let layout = Layout::new();
        let bundled = layout.bundled();
        layout.build("release");

        let resolved = resolve_server_path(None, &layout.install, &layout.roots()).unwrap();
        assert_eq!(resolved.path(), bundled);
    }

    #[test]
    fn test_debug_build_only() {
        let layout = Layout::new();
        let debug = layout.build("debug");

        let resolved = resolve_server_path(None, &layout.install, &layout.roots()).unwrap();
        assert_eq!(resolved.path(), debug);
        assert_eq!(resolved.origin(), CandidateOrigin::WorkspaceDebug);
    }

    #[test]
    fn test_release_precedes_debug() {
        let layout = Layout::new();
        let release = layout.build("release");
        layout.build("debug");

        let resolved = resolve_server_path(None, &layout.install, &layout.roots()).unwrap();
        assert_eq!(resolved.path(), release);
        assert_eq!(resolved.origin(), CandidateOrigin::WorkspaceRelease);
    }

    #[test]
    fn test_only_first_workspace_root_is_searched() {
        let layout = Layout::new();
        let second = layout.elsewhere.clone();
        Layout::touch(&second.join("target").join("release").join(server_binary_file_name()));

        let roots = vec![layout.workspace.clone(), second];
        assert!(resolve_server_path(None, &layout.install, &roots).is_none());
    }

    #[test]
    fn test_nothing_found() {
        let layout = Layout::new();
        assert!(resolve_server_path(None, &layout.install, &[]).is_none());
        assert!(resolve_server_path(Some(""), &layout.install, &layout.roots()).is_none());
    }

    #[test]
    fn test_candidates_order_and_shape() {
        let install = PathBuf::from("ext");
        let roots = vec![PathBuf::from("ws1"), PathBuf::from("ws2")];
        let list = candidates(Some("  custom/server  "), &install, &roots);
        let origins: Vec<CandidateOrigin> = list.iter().map(|c| c.origin).collect();
        assert_eq!(
            origins,
            vec![
                CandidateOrigin::Configured,
                CandidateOrigin::Bundled,
                CandidateOrigin::WorkspaceRelease,
                CandidateOrigin::WorkspaceDebug,
            ]
        );
        assert_eq!(list[0].path, PathBuf::from("  custom/server  "));
        assert_eq!(list[1].path, install.join("bin").join(server_binary_file_name()));
        assert!(list[2].path.starts_with("ws1"));
        assert!(list[3].path.starts_with("ws1"));
    }

    #[test]
    fn test_candidates_without_override_or_roots() {
        let list = candidates(Some("   "), Path::new("ext"), &[]);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].origin, CandidateOrigin::Bundled);
    }
}
