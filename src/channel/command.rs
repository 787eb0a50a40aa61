//! Remote command construction.
//!
//! Shell strings run through `sh -c` so the remote login shell never
//! re-interprets them; argument vectors are quoted one argument at a time.

use std::borrow::Cow;

use shell_escape::unix::escape;

/// What to run on the remote host.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CommandBody {
    /// A shell script executed with `sh -c`.
    Shell(String),
    /// A program and its arguments, each quoted individually.
    Argv(Vec<String>),
}

/// A command to execute on an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteCommand {
    body: CommandBody,
    as_root: bool,
    description: Option<String>,
    stdin: Option<Vec<u8>>,
}

impl RemoteCommand {
    /// Creates a command from a shell script.
    #[must_use]
    pub fn shell(script: impl Into<String>) -> Self {
        Self::from_body(CommandBody::Shell(script.into()))
    }

    /// Creates a command from a program and its arguments.
    #[must_use]
    pub fn argv<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_body(CommandBody::Argv(args.into_iter().map(Into::into).collect()))
    }

    const fn from_body(body: CommandBody) -> Self {
        Self {
            body,
            as_root: false,
            description: None,
            stdin: None,
        }
    }

    /// Runs the command through `sudo --`.
    #[must_use]
    pub const fn as_root(mut self) -> Self {
        self.as_root = true;
        self
    }

    /// Attaches a human-readable purpose used in logs instead of the command.
    #[must_use]
    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Feeds `input` to the command's standard input.
    #[must_use]
    pub fn with_stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Bytes passed on standard input, if any.
    #[must_use]
    pub fn stdin(&self) -> Option<&[u8]> {
        self.stdin.as_deref()
    }

    /// Command body.
    #[must_use]
    pub const fn body(&self) -> &CommandBody {
        &self.body
    }

    /// Whether the command runs through `sudo`.
    #[must_use]
    pub const fn runs_as_root(&self) -> bool {
        self.as_root
    }

    /// Description for logging, falling back to the rendered command.
    #[must_use]
    pub fn description(&self) -> Cow<'_, str> {
        self.description
            .as_deref()
            .map_or_else(|| Cow::Owned(self.render()), Cow::Borrowed)
    }

    /// Renders the command line passed to the remote shell.
    #[must_use]
    pub fn render(&self) -> String {
        let mut words: Vec<Cow<'_, str>> = Vec::new();
        if self.as_root {
            words.push(Cow::Borrowed("sudo"));
            words.push(Cow::Borrowed("--"));
        }
        match &self.body {
            CommandBody::Shell(script) => {
                words.push(Cow::Borrowed("sh"));
                words.push(Cow::Borrowed("-c"));
                words.push(escape(script.as_str().into()));
            }
            CommandBody::Argv(args) => {
                words.extend(args.iter().map(|arg| escape(arg.as_str().into())));
            }
        }
        words.join(" ")
    }
}

impl From<&str> for RemoteCommand {
    fn from(script: &str) -> Self {
        Self::shell(script)
    }
}

impl From<String> for RemoteCommand {
    fn from(script: String) -> Self {
        Self::shell(script)
    }
}

impl From<Vec<String>> for RemoteCommand {
    fn from(args: Vec<String>) -> Self {
        Self::argv(args)
    }
}

impl<const N: usize> From<[&str; N]> for RemoteCommand {
    fn from(args: [&str; N]) -> Self {
        Self::argv(args)
    }
}
