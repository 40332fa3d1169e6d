use super::*;

static RE_HEXDUMP_ERROR: Lazy<Regex> = Lazy::new(|| compile(r"(?i)hexdump:\s(?P<ERROR_MSG>.*)"));

static HEXDUMP_RULES: &[Rule<Hexdump>] = &[
    Rule {
        name: "blank line",
        on_partial: false,
        apply: Hexdump::skip_blank_line,
    },
    Rule {
        name: "hexdump error",
        on_partial: false,
        apply: Hexdump::hexdump_error,
    },
    Rule {
        name: "output",
        on_partial: false,
        apply: Hexdump::collect_output,
    },
];

/// `hexdump` of one or more files.
#[derive(Debug, Clone)]
pub struct Hexdump {
    files: Vec<String>,
    options: Option<String>,
}

impl Hexdump {
    /// # Errors
    ///
    /// [`ConnectError::WrongUsage`] when no file name is non-blank.
    pub fn new<I, S>(files: I) -> Result<Self, ConnectError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let files: Vec<String> = files.into_iter().map(Into::into).collect();
        if files.iter().all(|file| file.trim().is_empty()) {
            return Err(ConnectError::WrongUsage(format!(
                "no files given to hexdump: {files:?}"
            )));
        }
        Ok(Self {
            files,
            options: None,
        })
    }

    pub fn with_options(mut self, options: impl Into<String>) -> Self {
        self.options = Some(options.into());
        self
    }

    fn skip_blank_line(&mut self, line: &str, _ctx: &mut LineContext<'_>) -> Parse {
        if line.trim().is_empty() {
            return Parse::Consumed;
        }
        Parse::Pass
    }

    fn hexdump_error(&mut self, line: &str, ctx: &mut LineContext<'_>) -> Parse {
        match RE_HEXDUMP_ERROR.captures(line) {
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

impl LineClassifier for Hexdump {
    fn name(&self) -> &'static str {
        "hexdump"
    }

    fn command_string(&self) -> String {
        let mut cmd = "hexdump".to_string();
        if let Some(options) = &self.options {
            cmd = format!("{cmd} {options}");
        }
        for file in self.files.iter().filter(|f| !f.trim().is_empty()) {
            cmd = format!("{cmd} {file}");
        }
        cmd
    }

    fn rules() -> &'static [Rule<Self>] {
        HEXDUMP_RULES
    }
}
