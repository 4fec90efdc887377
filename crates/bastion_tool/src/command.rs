//! Built command lines.

use bastion_core::Secret;
use bastion_policy::Redactor;
use regex::Regex;
use std::collections::BTreeMap;

/// An interactive prompt and its answer
#[derive(Debug, Clone)]
pub struct Prompt {
    /// Matched against live terminal output
    pub pattern: Regex,
    /// Written to the terminal, followed by a newline
    pub answer: Secret,
}

impl Prompt {
    /// Prompt matching `pattern`
    #[must_use]
    pub fn new(pattern: Regex, answer: Secret) -> Self {
        Self { pattern, answer }
    }

    /// Prompt matching `text` literally
    ///
    /// # Errors
    ///
    /// Returns error if the escaped text exceeds the regex size limit
    pub fn literal(text: &str, answer: Secret) -> Result<Self, regex::Error> {
        Ok(Self::new(Regex::new(&regex::escape(text))?, answer))
    }
}

/// A file the command expects in the scratch directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScratchFile {
    /// File name inside the scratch directory
    pub name: String,
    /// Contents
    pub contents: Secret,
    /// Unix permission bits
    pub mode: u32,
}

impl ScratchFile {
    /// Private file (`0600`)
    #[must_use]
    pub fn private(name: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contents: Secret::new(contents.into()),
            mode: 0o600,
        }
    }
}

/// Output of a builder
#[derive(Debug, Clone)]
pub struct CommandLine {
    /// Argument vector, program first
    pub argv: Vec<String>,
    /// Argument vector safe to persist and log
    pub display_argv: Vec<String>,
    /// Process environment additions
    pub env: BTreeMap<String, String>,
    /// Prompt table, first match wins
    pub prompts: Vec<Prompt>,
    /// Files to write into the scratch directory before spawning
    pub files: Vec<ScratchFile>,
}

impl CommandLine {
    /// Command with identical display argv
    #[must_use]
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            display_argv: argv.clone(),
            argv,
            env: BTreeMap::new(),
            prompts: Vec::new(),
            files: Vec::new(),
        }
    }

    /// Add a prompt answer
    #[must_use]
    pub fn with_prompt(mut self, prompt: Prompt) -> Self {
        self.prompts.push(prompt);
        self
    }

    /// Add a prompt answer when the secret is configured
    #[must_use]
    pub fn with_optional_prompt(mut self, pattern: &Regex, answer: Option<&Secret>) -> Self {
        if let Some(answer) = answer.filter(|a| !a.is_empty()) {
            self.prompts.push(Prompt::new(pattern.clone(), answer.clone()));
        }
        self
    }

    /// Add a scratch file
    #[must_use]
    pub fn with_file(mut self, file: ScratchFile) -> Self {
        self.files.push(file);
        self
    }

    /// Re-derive the display argv through `redactor`
    pub fn redact_display(&mut self, redactor: &Redactor) {
        self.display_argv = redactor.redact_args(&self.argv);
    }

    /// Environment safe to persist
    #[must_use]
    pub fn redacted_env(&self, redactor: &Redactor) -> BTreeMap<String, String> {
        redactor.redact_env(&self.env)
    }

    /// Redactor primed with every prompt answer
    #[must_use]
    pub fn redactor(&self) -> Redactor {
        let mut redactor = Redactor::new();
        for prompt in &self.prompts {
            redactor.add_secret(&prompt.answer);
        }
        redactor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optional_prompt_skips_missing() {
        let pattern = Regex::new("password:").unwrap();
        let cmd = CommandLine::new(vec!["true".into()])
            .with_optional_prompt(&pattern, None)
            .with_optional_prompt(&pattern, Some(&Secret::new("")))
            .with_optional_prompt(&pattern, Some(&Secret::new("pw")));
        assert_eq!(cmd.prompts.len(), 1);
    }

    #[test]
    fn test_literal_prompt_escapes() {
        let prompt = Prompt::literal("Enter passphrase for /tmp/x (key):", Secret::new("p")).unwrap();
        assert!(prompt.pattern.is_match("Enter passphrase for /tmp/x (key): "));
        assert!(!prompt.pattern.is_match("Enter passphrase for /tmp/xx"));
    }

    #[test]
    fn test_redactor_covers_answers() {
        let mut cmd = CommandLine::new(vec!["sh".into(), "-c".into(), "echo s3cret".into()])
            .with_prompt(Prompt::literal("pw:", Secret::new("s3cret")).unwrap());
        let redactor = cmd.redactor();
        cmd.redact_display(&redactor);
        assert_eq!(cmd.display_argv[2], "echo $encrypted$");
        assert_eq!(cmd.argv[2], "echo s3cret");
    }
}
