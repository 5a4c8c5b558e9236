//! Script parser
//!
//! Parses expect scripts. Each line is one directive, chosen by its prefix
//! (checked in this order):
//! - `$$ ` declares subject arguments
//! - `> ` is input sent to the subject
//! - `#` is a comment
//! - `<e` (the whole line) expects an error line
//! - `<r ` expects a line fully matching a regular expression
//! - `<l ` expects a literal line (prefix stripped)
//! - anything else expects the whole line literally
//!
//! Also home to [`split_arguments`], which turns a command string into an
//! argument vector with single/double-quote grouping.

use crate::error::{Error, ErrorKind, Result};

/// A regular expression that must match a whole output line.
///
/// The pattern is compiled once at parse time as `^(?:pattern)$`.
#[derive(Debug, Clone)]
pub struct LinePattern {
    source: String,
    regex: regex::Regex,
}

impl LinePattern {
    /// Compile a pattern, anchoring it at both ends
    pub fn new(source: &str) -> Result<Self> {
        let regex = regex::RegexBuilder::new(&format!("^(?:{})$", source))
            .size_limit(1 << 20) // 1 MB DFA limit
            .build()
            .map_err(|e| Error::syntax(format!("invalid regex: {}", e)))?;
        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }

    /// The pattern as written in the script
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// The pattern as it is matched, with anchors
    pub fn anchored(&self) -> String {
        format!("^{}$", self.source)
    }

    /// Whether the whole line matches
    pub fn is_match(&self, line: &str) -> bool {
        self.regex.is_match(line)
    }
}

impl PartialEq for LinePattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for LinePattern {}

/// One parsed instruction of a script
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// `$$ args`: arguments for the subject's command line
    Argument(String),
    /// `> text`: a line written to the subject's input
    SendInput(String),
    /// `# text`: printed to the diagnostics, nothing else
    Comment(String),
    /// `<e`: the next output line must start with the error prefix
    ExpectError,
    /// `<r pattern`: the next output line must fully match the pattern
    ExpectRegex(LinePattern),
    /// `<l text` or a bare line: the next output line must equal the text
    ExpectLiteral(String),
}

/// A parsed script line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptLine {
    /// The parsed directive
    pub directive: Directive,
    /// Original line text (for diagnostics)
    pub raw: String,
    /// Line number in the script
    pub line_number: usize,
}

/// A parsed script: directives in file order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Script {
    pub lines: Vec<ScriptLine>,
}

impl Script {
    /// Parse script text. `filename` is only used for error locations.
    pub fn parse(content: &str, filename: &str) -> Result<Self> {
        let lines = split_lines(content)
            .into_iter()
            .enumerate()
            .map(|(i, line)| {
                parse_line(line, i + 1).map_err(|e| e.with_location(filename, i + 1))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { lines })
    }

    /// Read and parse a script file
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::new(ErrorKind::Io, format!("failed to read script: {}", e))
                .with_file(path.display().to_string()))?;
        Self::parse(&content, &path.display().to_string())
    }

    /// Iterate over the directives in order
    pub fn directives(&self) -> impl Iterator<Item = &Directive> {
        self.lines.iter().map(|l| &l.directive)
    }

    /// Arguments declared with `$$`, split into an argument vector
    pub fn arguments(&self) -> Result<Vec<String>> {
        let mut args = Vec::new();
        for line in &self.lines {
            if let Directive::Argument(text) = &line.directive {
                args.extend(split_arguments(text).map_err(|e| e.with_line(line.line_number))?);
            }
        }
        Ok(args)
    }
}

/// Split text into lines on `\n` or `\r\n`.
///
/// A trailing empty line caused by a final newline is dropped; empty lines
/// elsewhere are kept (they expect an empty output line).
pub fn split_lines(content: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = content
        .split('\n')
        .map(|l| l.strip_suffix('\r').unwrap_or(l))
        .collect();
    if lines.last() == Some(&"") {
        lines.pop();
    }
    lines
}

/// Parse a single script line into a ScriptLine.
///
/// Never fails except for `<r` lines whose pattern does not compile.
pub fn parse_line(line: &str, line_number: usize) -> Result<ScriptLine> {
    let directive = if let Some(rest) = line.strip_prefix("$$ ") {
        Directive::Argument(rest.to_string())
    } else if let Some(rest) = line.strip_prefix("> ") {
        Directive::SendInput(rest.to_string())
    } else if line.starts_with('#') {
        Directive::Comment(line.to_string())
    } else if line == "<e" {
        Directive::ExpectError
    } else if let Some(rest) = line.strip_prefix("<r ") {
        Directive::ExpectRegex(LinePattern::new(rest)?)
    } else if let Some(rest) = line.strip_prefix("<l ") {
        Directive::ExpectLiteral(rest.to_string())
    } else {
        Directive::ExpectLiteral(line.to_string())
    };

    Ok(ScriptLine {
        directive,
        raw: line.to_string(),
        line_number,
    })
}

/// Split a command string into arguments.
///
/// Whitespace separates arguments. Text inside single or double quotes is
/// kept together and the quote characters are dropped; quoted and unquoted
/// chunks that touch form one argument (`pre"mid dle"suf` is one argument).
pub fn split_arguments(command: &str) -> Result<Vec<String>> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_arg = false;
    let mut quote: Option<char> = None;

    for c in command.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => {
                quote = Some(c);
                in_arg = true;
            }
            None if c.is_whitespace() => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            None => {
                current.push(c);
                in_arg = true;
            }
        }
    }

    if let Some(q) = quote {
        return Err(Error::usage(format!("unterminated {} quote in: {}", q, command)));
    }
    if in_arg {
        args.push(current);
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directive(line: &str) -> Directive {
        parse_line(line, 1).unwrap().directive
    }

    #[test]
    fn test_parse_argument() {
        assert_eq!(directive("$$ --verbose"), Directive::Argument("--verbose".into()));
    }

    #[test]
    fn test_parse_input() {
        assert_eq!(directive("> hello"), Directive::SendInput("hello".into()));
        // "> " wins over a following "#"
        assert_eq!(directive("> # not a comment"), Directive::SendInput("# not a comment".into()));
    }

    #[test]
    fn test_parse_comment() {
        assert_eq!(directive("# section"), Directive::Comment("# section".into()));
        assert_eq!(directive("#"), Directive::Comment("#".into()));
    }

    #[test]
    fn test_parse_error_exact_token() {
        assert_eq!(directive("<e"), Directive::ExpectError);
        // only the exact token is an error expectation
        assert_eq!(directive("<e "), Directive::ExpectLiteral("<e ".into()));
        assert_eq!(directive("<error"), Directive::ExpectLiteral("<error".into()));
    }

    #[test]
    fn test_parse_regex() {
        match directive("<r ^[0-9]+$") {
            Directive::ExpectRegex(p) => {
                assert_eq!(p.as_str(), "^[0-9]+$");
                assert!(p.is_match("123"));
                assert!(!p.is_match("abc"));
            }
            other => panic!("unexpected directive: {:?}", other),
        }
    }

    #[test]
    fn test_regex_is_anchored() {
        let p = LinePattern::new("[0-9]+").unwrap();
        assert!(p.is_match("42"));
        assert!(!p.is_match("a42"));
        assert!(!p.is_match("42a"));
        // alternation stays inside the anchors
        let p = LinePattern::new("foo|bar").unwrap();
        assert!(p.is_match("bar"));
        assert!(!p.is_match("barbecue"));
        assert_eq!(p.anchored(), "^foo|bar$");
    }

    #[test]
    fn test_parse_invalid_regex_error() {
        let err = Script::parse("> x\n<r (unclosed\n", "bad.test").unwrap_err();
        assert_eq!(err.kind, ErrorKind::SyntaxError);
        assert_eq!(err.line, Some(2));
        assert!(err.to_string().starts_with("bad.test:2:"));
    }

    #[test]
    fn test_parse_literal() {
        assert_eq!(directive("<l > not input"), Directive::ExpectLiteral("> not input".into()));
        assert_eq!(directive("Hello, world"), Directive::ExpectLiteral("Hello, world".into()));
        assert_eq!(directive(""), Directive::ExpectLiteral("".into()));
    }

    #[test]
    fn test_parse_script_lines() {
        let script = Script::parse("$$ --verbose\r\n> hello\r\nHello, hello\r\n\r\n<e\n", "t").unwrap();
        let kinds: Vec<_> = script.directives().cloned().collect();
        assert_eq!(kinds, vec![
            Directive::Argument("--verbose".into()),
            Directive::SendInput("hello".into()),
            Directive::ExpectLiteral("Hello, hello".into()),
            Directive::ExpectLiteral("".into()),
            Directive::ExpectError,
        ]);
        assert_eq!(script.lines[4].line_number, 5);
    }

    #[test]
    fn test_split_lines_drops_only_final_empty() {
        assert_eq!(split_lines("a\nb\n"), vec!["a", "b"]);
        assert_eq!(split_lines("a\n\nb"), vec!["a", "", "b"]);
        assert_eq!(split_lines("a\n\n"), vec!["a", ""]);
        assert!(split_lines("").is_empty());
    }

    #[test]
    fn test_script_arguments() {
        let script = Script::parse("$$ --name 'Jane Doe'\n$$ -v\n> hi\n", "t").unwrap();
        assert_eq!(script.arguments().unwrap(), vec!["--name", "Jane Doe", "-v"]);
    }

    #[test]
    fn test_split_arguments_plain() {
        assert_eq!(split_arguments("deno run  main.ts").unwrap(), vec!["deno", "run", "main.ts"]);
        assert!(split_arguments("   ").unwrap().is_empty());
    }

    #[test]
    fn test_split_arguments_quotes() {
        assert_eq!(
            split_arguments(r#"prog --subject "sh -c 'echo hi'" 'a b'"#).unwrap(),
            vec!["prog", "--subject", "sh -c 'echo hi'", "a b"]
        );
        assert_eq!(split_arguments(r#"pre"mid dle"suf"#).unwrap(), vec!["premid dlesuf"]);
        assert_eq!(split_arguments(r#"a "" b"#).unwrap(), vec!["a", "", "b"]);
    }

    #[test]
    fn test_split_arguments_unterminated() {
        let err = split_arguments("echo 'oops").unwrap_err();
        assert_eq!(err.kind, ErrorKind::UsageError);
        assert!(err.message.contains("unterminated"));
    }
}
