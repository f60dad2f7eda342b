//! Ecosystem check table for auto-detected verification.
//!
//! Each ecosystem is a marker file plus an ordered list of checks. Adding an
//! ecosystem is a table edit in [`default_ecosystems`]; nothing else branches on
//! ecosystem names.

/// What a check is for; decides whether its failure blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckKind {
    TypeCheck,
    Test,
    /// Lint or format check. Non-blocking unless configured otherwise.
    Lint,
}

impl CheckKind {
    pub fn is_blocking(self, lint_blocking: bool) -> bool {
        match self {
            CheckKind::TypeCheck | CheckKind::Test => true,
            CheckKind::Lint => lint_blocking,
        }
    }
}

/// Condition under which a check applies to a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Always,
    /// `package.json` declares this script.
    NpmScript(String),
    /// The named executable is on `PATH`.
    OnPath(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckSpec {
    pub name: String,
    pub kind: CheckKind,
    pub program: String,
    pub args: Vec<String>,
    pub requires: Requirement,
}

impl CheckSpec {
    pub fn new(name: &str, kind: CheckKind, command: &[&str], requires: Requirement) -> Self {
        let (program, args) = command.split_first().map_or(("", &[][..]), |(p, a)| (*p, a));
        Self {
            name: name.to_string(),
            kind,
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            requires,
        }
    }

    /// Command line for logs.
    pub fn display_command(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// An ecosystem recognized by any of its marker files in the project root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ecosystem {
    pub name: String,
    pub markers: Vec<String>,
    pub checks: Vec<CheckSpec>,
}

impl Ecosystem {
    pub fn new(name: &str, markers: &[&str], checks: Vec<CheckSpec>) -> Self {
        Self {
            name: name.to_string(),
            markers: markers.iter().map(|m| m.to_string()).collect(),
            checks,
        }
    }
}

fn npm_script(script: &str) -> Requirement {
    Requirement::NpmScript(script.to_string())
}

fn on_path(tool: &str) -> Requirement {
    Requirement::OnPath(tool.to_string())
}

/// Built-in ecosystems, in the order their checks run.
pub fn default_ecosystems() -> Vec<Ecosystem> {
    use CheckKind::{Lint, Test, TypeCheck};

    vec![
        Ecosystem::new(
            "node",
            &["package.json"],
            vec![
                CheckSpec::new(
                    "npm typecheck",
                    TypeCheck,
                    &["npm", "run", "typecheck"],
                    npm_script("typecheck"),
                ),
                CheckSpec::new("npm test", Test, &["npm", "test"], npm_script("test")),
                CheckSpec::new("npm lint", Lint, &["npm", "run", "lint"], npm_script("lint")),
            ],
        ),
        Ecosystem::new(
            "rust",
            &["Cargo.toml"],
            vec![
                CheckSpec::new(
                    "cargo check",
                    TypeCheck,
                    &["cargo", "check", "--all-targets"],
                    Requirement::Always,
                ),
                CheckSpec::new("cargo test", Test, &["cargo", "test"], Requirement::Always),
                CheckSpec::new(
                    "cargo fmt",
                    Lint,
                    &["cargo", "fmt", "--check"],
                    Requirement::Always,
                ),
                CheckSpec::new(
                    "cargo clippy",
                    Lint,
                    &["cargo", "clippy", "--all-targets"],
                    Requirement::Always,
                ),
            ],
        ),
        Ecosystem::new(
            "python",
            &["pyproject.toml", "requirements.txt", "setup.py", "uv.lock"],
            vec![
                CheckSpec::new("mypy", TypeCheck, &["mypy", "."], on_path("mypy")),
                CheckSpec::new("pytest", Test, &["pytest", "-q"], on_path("pytest")),
                CheckSpec::new("ruff", Lint, &["ruff", "check", "."], on_path("ruff")),
            ],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lint_blocks_only_when_configured() {
        assert!(!CheckKind::Lint.is_blocking(false));
        assert!(CheckKind::Lint.is_blocking(true));
        assert!(CheckKind::Test.is_blocking(false));
        assert!(CheckKind::TypeCheck.is_blocking(false));
    }

    #[test]
    fn every_ecosystem_orders_typecheck_before_test_before_lint() {
        for eco in default_ecosystems() {
            let ranks: Vec<u8> = eco
                .checks
                .iter()
                .map(|c| match c.kind {
                    CheckKind::TypeCheck => 0,
                    CheckKind::Test => 1,
                    CheckKind::Lint => 2,
                })
                .collect();
            let mut sorted = ranks.clone();
            sorted.sort_unstable();
            assert_eq!(ranks, sorted, "{} checks out of order", eco.name);
        }
    }

    #[test]
    fn display_command_joins_program_and_args() {
        let spec = CheckSpec::new("t", CheckKind::Test, &["cargo", "test"], Requirement::Always);
        assert_eq!(spec.display_command(), "cargo test");
    }
}
