use super::*;

static RE_OVERWRITE: Lazy<Regex> = Lazy::new(|| compile(r"(?i)already exists;"));
static RE_GZIP_ERROR: Lazy<Regex> = Lazy::new(|| compile(r"(?i)gzip:\s(?P<ERROR_MSG>.*)"));

static GUNZIP_RULES: &[Rule<Gunzip>] = &[
    Rule {
        name: "blank line",
        on_partial: false,
        apply: Gunzip::skip_blank_line,
    },
    Rule {
        name: "overwrite question",
        on_partial: true,
        apply: Gunzip::answer_overwrite,
    },
    Rule {
        name: "gzip error",
        on_partial: false,
        apply: Gunzip::gzip_error,
    },
    Rule {
        name: "output",
        on_partial: false,
        apply: Gunzip::collect_output,
    },
];

/// `gunzip` of one or more archives. Every output line is a result line.
#[derive(Debug, Clone)]
pub struct Gunzip {
    archives: Vec<String>,
    new_suffix: Option<String>,
    output_file: Option<String>,
    options: Option<String>,
    overwrite: bool,
    overwrite_answered: bool,
}

impl Gunzip {
    pub fn new<I, S>(archives: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            archives: archives.into_iter().map(Into::into).collect(),
            new_suffix: None,
            output_file: None,
            options: None,
            overwrite: false,
            overwrite_answered: false,
        }
    }

    /// Suffix passed with `-S`.
    pub fn with_new_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.new_suffix = Some(suffix.into());
        self
    }

    /// Redirects decompressed output to `file`.
    pub fn with_output_file(mut self, file: impl Into<String>) -> Self {
        self.output_file = Some(file.into());
        self
    }

    pub fn with_options(mut self, options: impl Into<String>) -> Self {
        self.options = Some(options.into());
        self
    }

    /// Whether an existing output file may be replaced.
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    fn skip_blank_line(&mut self, line: &str, _ctx: &mut LineContext<'_>) -> Parse {
        if line.trim().is_empty() {
            return Parse::Consumed;
        }
        Parse::Pass
    }

    fn answer_overwrite(&mut self, line: &str, ctx: &mut LineContext<'_>) -> Parse {
        if !RE_OVERWRITE.is_match(line) {
            return Parse::Pass;
        }
        // The question may show up as a prompt and again as a full line.
        if self.overwrite_answered {
            return Parse::Consumed;
        }
        self.overwrite_answered = true;
        if self.overwrite {
            ctx.sendline("y");
        } else {
            ctx.sendline("n");
            ctx.fail(
                FailureKind::RemoteOperation,
                "file already exists and overwrite is set to False",
            );
        }
        Parse::Consumed
    }

    fn gzip_error(&mut self, line: &str, ctx: &mut LineContext<'_>) -> Parse {
        match RE_GZIP_ERROR.captures(line) {
            Some(caps) => {
                ctx.fail(FailureKind::RemoteOperation, &caps["ERROR_MSG"]);
                Parse::Consumed
            }
            None => Parse::Pass,
        }
    }

    fn collect_output(&mut self, line: &str, ctx: &mut LineContext<'_>) -> Parse {
        ctx.append(line);
        Parse::Consumed
    }
}

impl LineClassifier for Gunzip {
    fn name(&self) -> &'static str {
        "gunzip"
    }

    fn command_string(&self) -> String {
        let mut cmd = "gunzip".to_string();
        if let Some(options) = &self.options {
            cmd = format!("{cmd} {options}");
        }
        if let Some(suffix) = &self.new_suffix {
            cmd = format!("{cmd} -S {suffix}");
        }
        for archive in &self.archives {
            cmd = format!("{cmd} {archive}");
        }
        if let Some(output) = &self.output_file {
            cmd = format!("{cmd} > {output}");
        }
        cmd
    }

    fn rules() -> &'static [Rule<Self>] {
        GUNZIP_RULES
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{capturing_connection, feed_lines};
    use super::*;

    fn run(gunzip: Gunzip, lines: &[&str]) -> (Arc<CommandAutomaton<Gunzip>>, Vec<String>) {
        let (connection, sent) = capturing_connection();
        let automaton = CommandAutomaton::new(Arc::clone(&connection), gunzip);
        automaton.start().expect("start");
        feed_lines(&connection, lines);
        let sent = sent.lock().expect("sent").clone();
        (automaton, sent)
    }

    #[test]
    fn builds_command_string() {
        assert_eq!(Gunzip::new(["new.gz"]).command_string(), "gunzip new.gz");
        assert_eq!(
            Gunzip::new(["a.z", "b.z"])
                .with_options("-f")
                .with_new_suffix(".z")
                .with_output_file("out.txt")
                .command_string(),
            "gunzip -f -S .z a.z b.z > out.txt"
        );
    }

    #[test]
    fn quiet_gunzip_has_empty_result() {
        let (automaton, _) = run(
            Gunzip::new(["new.gz"]),
            &["", "xyz@debian:~$ gunzip new.gz", "xyz@debian:~$"],
        );
        assert!(automaton.result().expect("success").is_empty());
    }

    #[test]
    fn verbose_output_is_collected() {
        let (automaton, _) = run(
            Gunzip::new(["new.gz"]).with_options("-v"),
            &[
                "",
                "xyz@debian:~$ gunzip -v new.gz",
                "new.gz:\t -7.7% -- replaced with new",
                "xyz@debian:~$",
            ],
        );
        assert_eq!(
            automaton.result().expect("success"),
            vec!["new.gz:\t -7.7% -- replaced with new".to_string()]
        );
    }

    #[test]
    fn overwrite_allowed_answers_yes() {
        let (automaton, sent) = run(
            Gunzip::new(["new.gz"]).overwrite(true),
            &[
                "",
                "xyz@debian:~$ gunzip new.gz",
                "gzip: new already exists; do you wish to overwrite (y or n)?",
                "xyz@debian:~$",
            ],
        );
        assert!(automaton.result().expect("success").is_empty());
        assert_eq!(sent, vec!["gunzip new.gz\n".to_string(), "y\n".to_string()]);
    }

    #[test]
    fn overwrite_refused_answers_no_and_fails() {
        let (automaton, sent) = run(
            Gunzip::new(["new.gz"]),
            &[
                "xyz@debian:~$ gunzip new.gz",
                "gzip: new already exists; do you wish to overwrite (y or n)?",
                "xyz@debian:~$",
            ],
        );
        assert_eq!(sent.last().map(String::as_str), Some("n\n"));
        match automaton.result() {
            Err(ConnectError::CommandFailure(failure)) => {
                assert_eq!(
                    failure.message,
                    "file already exists and overwrite is set to False"
                );
                assert_eq!(failure.command, "gunzip new.gz");
            }
            other => panic!("expected overwrite failure, got {other:?}"),
        }
    }

    #[test]
    fn overwrite_prompt_is_answered_once() {
        let (connection, sent) = capturing_connection();
        let automaton = CommandAutomaton::new(
            Arc::clone(&connection),
            Gunzip::new(["new.gz"]).overwrite(true),
        );
        automaton.start().expect("start");
        connection.inject("xyz@debian:~$ gunzip new.gz\n");
        connection.inject("gzip: new already exists; do you wish to overwrite (y or n)? ");
        connection.inject("\nxyz@debian:~$ ");

        assert!(automaton.is_done());
        let answers = sent.lock().expect("sent").iter().filter(|s| *s == "y\n").count();
        assert_eq!(answers, 1);
    }

    #[test]
    fn gzip_error_is_reported() {
        let (automaton, _) = run(
            Gunzip::new(["missing.gz"]),
            &[
                "xyz@debian:~$ gunzip missing.gz",
                "gzip: missing.gz: No such file or directory",
                "xyz@debian:~$",
            ],
        );
        match automaton.result() {
            Err(ConnectError::CommandFailure(failure)) => {
                assert_eq!(failure.kind, FailureKind::RemoteOperation);
                assert_eq!(failure.message, "missing.gz: No such file or directory");
            }
            other => panic!("expected gzip failure, got {other:?}"),
        }
    }
}
