//! Minimal line splitting for the REPL
//!
//! Whitespace-separated words, `|` between stages, `< file` and `> file`
//! redirections (the operator may also be glued to the file name). No
//! quoting, variables or globbing.

use jobctl::{CommandSpec, Redirection};

/// Split one input line into pipeline stages.
pub fn parse_line(line: &str) -> Result<Vec<CommandSpec>, String> {
    let mut stages = Vec::new();
    for stage_text in line.split('|') {
        stages.push(parse_stage(stage_text.trim())?);
    }
    Ok(stages)
}

fn parse_stage(text: &str) -> Result<CommandSpec, String> {
    let mut argv: Vec<String> = Vec::new();
    let mut redirections = Vec::new();
    let mut words = text.split_whitespace();

    while let Some(word) = words.next() {
        let (op, rest) = match word.chars().next() {
            Some(c @ ('<' | '>')) => (c, &word[1..]),
            _ => {
                argv.push(word.to_string());
                continue;
            }
        };
        let path = if rest.is_empty() {
            words
                .next()
                .ok_or_else(|| format!("missing file name after '{}'", op))?
        } else {
            rest
        };
        redirections.push(if op == '<' {
            Redirection::input(path)
        } else {
            Redirection::output(path)
        });
    }

    if argv.is_empty() {
        return Err("empty command".to_string());
    }
    let mut spec = CommandSpec::new(argv).with_text(text);
    spec.redirections = redirections;
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobctl::RedirectDirection;
    use std::path::PathBuf;

    #[test]
    fn test_single_command() {
        let stages = parse_line("  ls   -l /tmp ").unwrap();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].argv, vec!["ls", "-l", "/tmp"]);
        assert_eq!(stages[0].display_text(), "ls   -l /tmp");
    }

    #[test]
    fn test_pipeline_with_redirections() {
        let stages = parse_line("sort <in.txt | uniq -c > out.txt").unwrap();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].argv, vec!["sort"]);
        assert_eq!(stages[0].redirections[0].direction, RedirectDirection::Input);
        assert_eq!(stages[0].redirections[0].path, PathBuf::from("in.txt"));
        assert_eq!(stages[1].argv, vec!["uniq", "-c"]);
        assert_eq!(stages[1].redirections[0].direction, RedirectDirection::Output);
    }

    #[test]
    fn test_errors() {
        assert!(parse_line("ls |").is_err());
        assert!(parse_line("cat <").is_err());
        assert!(parse_line("> out.txt").is_err());
    }
}
