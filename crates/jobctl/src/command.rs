//! Parsed command input
//!
//! The engine never tokenizes; hosts hand it argument vectors and
//! redirection lists that were parsed elsewhere.

use std::path::PathBuf;

/// Which standard stream a redirection replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectDirection {
    /// `< file` replaces stdin
    Input,
    /// `> file` replaces stdout, creating or truncating the file
    Output,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirection {
    pub direction: RedirectDirection,
    pub path: PathBuf,
}

impl Redirection {
    pub fn input(path: impl Into<PathBuf>) -> Self {
        Self {
            direction: RedirectDirection::Input,
            path: path.into(),
        }
    }

    pub fn output(path: impl Into<PathBuf>) -> Self {
        Self {
            direction: RedirectDirection::Output,
            path: path.into(),
        }
    }
}

/// One command: program and arguments plus its redirections, applied in order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    pub redirections: Vec<Redirection>,
    /// Original text as typed, kept for job listings.
    pub text: Option<String>,
}

impl CommandSpec {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            redirections: Vec::new(),
            text: None,
        }
    }

    pub fn redirect(mut self, redirection: Redirection) -> Self {
        self.redirections.push(redirection);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Text shown in job listings: the original text if known, otherwise a
    /// reconstruction from argv and redirections.
    pub fn display_text(&self) -> String {
        if let Some(text) = &self.text {
            return text.clone();
        }
        let mut parts = self.argv.clone();
        for r in &self.redirections {
            let op = match r.direction {
                RedirectDirection::Input => "<",
                RedirectDirection::Output => ">",
            };
            parts.push(format!("{} {}", op, r.path.display()));
        }
        parts.join(" ")
    }
}

/// Listing text for a whole pipeline.
pub fn pipeline_text(stages: &[CommandSpec]) -> String {
    stages
        .iter()
        .map(CommandSpec::display_text)
        .collect::<Vec<_>>()
        .join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_text_reconstructed() {
        let cmd = CommandSpec::new(["sort", "-r"])
            .redirect(Redirection::input("in.txt"))
            .redirect(Redirection::output("out.txt"));
        assert_eq!(cmd.display_text(), "sort -r < in.txt > out.txt");
    }

    #[test]
    fn test_display_text_prefers_original() {
        let cmd = CommandSpec::new(["echo", "hi"]).with_text("echo   hi");
        assert_eq!(cmd.display_text(), "echo   hi");
    }

    #[test]
    fn test_pipeline_text() {
        let stages = vec![CommandSpec::new(["ls"]), CommandSpec::new(["wc", "-l"])];
        assert_eq!(pipeline_text(&stages), "ls | wc -l");
    }
}
