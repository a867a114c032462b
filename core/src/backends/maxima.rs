use std::io::Write;

use abacus_protocol::ExpressionResult;
use regex_lite::Regex;
use tempfile::NamedTempFile;

use crate::backend::BackendStrategy;
use crate::backend::FinishedParse;
use crate::backend::ParseContext;
use crate::backend::ParseOutcome;
use crate::backend::PreparedCommand;
use crate::config::BackendConfig;
use crate::config::resolve_executable;
use crate::error::EngineError;
use crate::error::Result;
use crate::process::SpawnSpec;
use crate::variables::Variable;
use crate::variables::VariableProtocol;

const PROMPT_OPEN: &str = "<abacus-prompt>";
const PROMPT_CLOSE: &str = "</abacus-prompt>";
const RESULT_OPEN: &str = "<abacus-result>";
const RESULT_CLOSE: &str = "</abacus-result>";
const TEXT_OPEN: &str = "<abacus-text>";
const TEXT_CLOSE: &str = "</abacus-text>";
const LATEX_OPEN: &str = "<abacus-latex>";
const LATEX_CLOSE: &str = "</abacus-latex>";
const VALUE_SEPARATOR: &str = "-abacus-value-separator-";

const OUTPUT_LABEL_PATTERN: &str = r"\(\s*%\s*o[\s0-9]*\)";
const INPUT_LABEL_PATTERN: &str = r"\(\s*%\s*i[\s0-9]*\)";

/// Lisp loaded via `--init-lisp` at startup. It wraps every result and
/// prompt in sentinel tags so the output stream can be parsed without
/// guessing where Maxima's 2d-rendered text ends.
const INIT_LISP: &str = r#";; Host integration for driving Maxima as a child process.
;; Results and prompts are wrapped in sentinel tags.
(setf *prompt-prefix* "<abacus-prompt>")
(setf *prompt-suffix* "</abacus-prompt>")
(setf *maxima-prolog* "")
(setf *maxima-epilog* "")

(defun abacus-displa (form)
  (princ "<abacus-result><abacus-text>")
  (let ((*alt-display1d* nil) (*alt-display2d* nil) ($display2d nil))
    (displa form))
  (princ "</abacus-text>")
  (when $display2d
    (princ "<abacus-latex>")
    (let ((*alt-display1d* nil) (*alt-display2d* nil))
      (princ (mfuncall '$tex1 (caddr form))))
    (princ "</abacus-latex>"))
  (princ "</abacus-result>")
  (finish-output))

(setf *alt-display1d* 'abacus-displa)
(setf *alt-display2d* 'abacus-displa)

;; Prints the names of the bound items in `vars` followed by their values,
;; delimited so the host can split them apart again.
(defun abacus-inspect (vars)
  (let ((names (cdr (meval vars))))
    (mfuncall '$disp (meval vars))
    (dolist (name names)
      (mfuncall '$disp (meval name))
      (princ "\"-abacus-value-separator-\"")))
  '$done)
"#;

/// Maxima profile: `--quiet --init-lisp=<tempfile>` startup, tag-delimited
/// results, `(%o<N>)` output labels, `;`/`$` statement terminators.
pub struct MaximaStrategy {
    // Deleted when the strategy is dropped; must outlive the process.
    init_file: NamedTempFile,
    output_label: Regex,
    input_label: Regex,
}

impl std::fmt::Debug for MaximaStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaximaStrategy")
            .field("init_file", &self.init_file.path())
            .finish()
    }
}

impl MaximaStrategy {
    pub fn new() -> Result<Self> {
        let mut init_file = tempfile::Builder::new()
            .prefix("abacus-maxima-")
            .suffix(".lisp")
            .tempfile()
            .map_err(|source| EngineError::InitFile { source })?;
        init_file
            .write_all(INIT_LISP.as_bytes())
            .map_err(|source| EngineError::InitFile { source })?;
        init_file
            .flush()
            .map_err(|source| EngineError::InitFile { source })?;
        let output_label = Regex::new(OUTPUT_LABEL_PATTERN)
            .map_err(|err| EngineError::pattern(OUTPUT_LABEL_PATTERN, err))?;
        let input_label = Regex::new(INPUT_LABEL_PATTERN)
            .map_err(|err| EngineError::pattern(INPUT_LABEL_PATTERN, err))?;
        Ok(Self {
            init_file,
            output_label,
            input_label,
        })
    }

    fn is_help_request(command: &str) -> bool {
        command.starts_with("??")
            || command.starts_with("describe(")
            || command.starts_with("example(")
            || command.starts_with(":lisp(cl-info::info-exact")
    }

    fn extract_id(&self, text: &str) -> (Option<u64>, String) {
        let Some(label) = self.output_label.find(text) else {
            return (None, text.trim().to_string());
        };
        let digits: String = text[label.start()..label.end()]
            .chars()
            .filter(char::is_ascii_digit)
            .collect();
        let id = digits.parse::<u64>().ok();
        let mut stripped = String::with_capacity(text.len());
        stripped.push_str(&text[..label.start()]);
        stripped.push_str(&text[label.end()..]);
        (id, stripped.trim().to_string())
    }

    fn parse_result(&self, content: &str, results: &mut Vec<ExpressionResult>) -> Option<u64> {
        let text_content = between(content, TEXT_OPEN, TEXT_CLOSE).unwrap_or(content);
        let (id, plain) = self.extract_id(text_content.trim());

        match between(content, LATEX_OPEN, LATEX_CLOSE) {
            Some(latex) => {
                let latex = rewrite_mbox(latex.trim());
                results.push(ExpressionResult::Latex { latex, plain });
            }
            None => results.push(ExpressionResult::Text { text: plain }),
        }
        id
    }
}

impl BackendStrategy for MaximaStrategy {
    fn name(&self) -> &str {
        "maxima"
    }

    fn spawn_spec(&self, config: &BackendConfig) -> Result<SpawnSpec> {
        let program = resolve_executable(config.path.as_deref(), "maxima")?;
        let mut args = vec![
            "--quiet".to_string(),
            format!("--init-lisp={}", self.init_file.path().display()),
        ];
        args.extend(config.args.iter().cloned());
        Ok(SpawnSpec {
            program,
            args,
            cwd: config.working_dir.clone(),
            mode: config.channel,
        })
    }

    fn login_complete(&self, buffer: &str) -> Option<usize> {
        buffer
            .find(PROMPT_CLOSE)
            .map(|start| start + PROMPT_CLOSE.len())
    }

    fn prepare(&self, command: &str) -> PreparedCommand {
        let despaced: String = command.chars().filter(|c| !c.is_whitespace()).collect();
        if despaced == "quit()" {
            // Queuing quit() would look like a crash when the process exits.
            return PreparedCommand::Logout;
        }

        match scan_comments(command) {
            CommentScan::Code => {}
            CommentScan::CommentOnly => {
                return PreparedCommand::Done {
                    results: Vec::new(),
                };
            }
            CommentScan::TooManyClosers => {
                return PreparedCommand::Error {
                    message: "too many */".to_string(),
                };
            }
            CommentScan::TooManyOpeners => {
                return PreparedCommand::Error {
                    message: "too many /*".to_string(),
                };
            }
            CommentScan::UnterminatedString => {
                return PreparedCommand::Error {
                    message: "expected \" before ;".to_string(),
                };
            }
        }

        let mut text = command.to_string();
        if !text.ends_with('$') && !text.ends_with(';') {
            text.push(';');
        }
        // Without this, Maxima prints an input prompt after every line and
        // the whole command is no longer answered by a single prompt.
        text = text.replace('\n', " ");
        // The quiet form prints no prompt at all, which would hang parsing.
        if let Some(rest) = text.strip_prefix(":lisp-quiet") {
            text = format!(":lisp{rest}");
        }
        PreparedCommand::Run { text }
    }

    fn parse_output(&self, buffer: &str, ctx: ParseContext<'_>) -> ParseOutcome {
        let Some(prompt_start) = buffer.find(PROMPT_OPEN) else {
            return ParseOutcome::Incomplete;
        };
        // Search from the open tag on: result text may contain the literal
        // close tag (a user can print it).
        let Some(prompt_close) = buffer[prompt_start..]
            .find(PROMPT_CLOSE)
            .map(|rel| prompt_start + rel)
        else {
            return ParseOutcome::Incomplete;
        };
        let consumed = prompt_close + PROMPT_CLOSE.len();
        let prompt = simplified(&buffer[prompt_start + PROMPT_OPEN.len()..prompt_close]);

        // A result embedded in the prompt means Maxima paused and is asking
        // the user something (e.g. askinteger).
        if prompt.contains(RESULT_OPEN) {
            let question = between(&prompt, TEXT_OPEN, TEXT_CLOSE)
                .unwrap_or(prompt.as_str())
                .trim()
                .to_string();
            return ParseOutcome::NeedsInformation { question, consumed };
        }

        let body = &buffer[..prompt_start];
        let mut results = Vec::new();
        let mut id = None;
        let mut error_content = String::new();

        let mut cursor = 0;
        let mut first_result = true;
        while let Some(rel_start) = body[cursor..].find(RESULT_OPEN) {
            let start = cursor + rel_start;
            if first_result {
                error_content.push_str(&body[..start]);
                first_result = false;
            }
            let Some(rel_end) = body[start..].find(RESULT_CLOSE) else {
                break;
            };
            let end = start + rel_end;
            let parsed_id =
                self.parse_result(&body[start + RESULT_OPEN.len()..end], &mut results);
            id = id.or(parsed_id);
            cursor = end + RESULT_CLOSE.len();
        }
        // Outside the sentinel tags only error diagnostics appear.
        error_content.push_str(body[cursor..].trim());
        if !ctx.stderr.trim().is_empty() {
            if !error_content.is_empty() {
                error_content.push('\n');
            }
            error_content.push_str(ctx.stderr.trim());
        }

        if error_content.trim().is_empty() {
            return ParseOutcome::Finished(FinishedParse {
                consumed,
                id,
                results,
                error: None,
            });
        }

        if buffer.contains(VALUE_SEPARATOR) {
            // Variable inspection writes the names to the error channel in
            // addition to the real listing. Not an error.
            return ParseOutcome::Finished(FinishedParse {
                consumed,
                id,
                results,
                error: None,
            });
        }

        if Self::is_help_request(ctx.command) {
            // Help text is delivered outside the result tags. The pager may
            // itself wait for input, recognizable by a prompt without an
            // input label.
            if !self.input_label.is_match(&prompt) {
                return ParseOutcome::NeedsInformation {
                    question: prompt,
                    consumed,
                };
            }
            results.push(ExpressionResult::Help {
                text: error_content.trim().to_string(),
            });
            return ParseOutcome::Finished(FinishedParse {
                consumed,
                id,
                results,
                error: None,
            });
        }

        let message = error_content.trim().replace("\n\n", "\n");
        ParseOutcome::Finished(FinishedParse {
            consumed,
            id,
            results,
            error: Some(message),
        })
    }

    fn format_information(&self, answer: &str) -> String {
        let mut answer = answer.trim().to_string();
        if !answer.ends_with(';') {
            answer.push(';');
        }
        answer
    }

    fn logout_command(&self) -> Option<String> {
        Some("quit();".to_string())
    }

    fn autorun_command(&self, scripts: &[String]) -> Option<String> {
        if scripts.is_empty() {
            return None;
        }
        // kill(labels) keeps the autorun from shifting the user's (%o) ids.
        Some(format!("{};kill(labels)", scripts.join(";")))
    }

    fn typesetting_command(&self, enable: bool) -> Option<String> {
        let value = if enable { "t" } else { "nil" };
        Some(format!(":lisp(setf $display2d {value})"))
    }

    fn variables(&self) -> Option<&dyn VariableProtocol> {
        Some(&MaximaVariables)
    }
}

#[derive(Debug)]
struct MaximaVariables;

impl VariableProtocol for MaximaVariables {
    fn refresh_command(&self) -> String {
        ":lisp(abacus-inspect $values)".to_string()
    }

    /// The listing starts with the name list, e.g. `[a,b]`, followed by the
    /// values delimited by the separator sentinel:
    /// `[a,b]\n1\n"-abacus-value-separator-"\n2\n"-abacus-value-separator-"`.
    fn parse_listing(&self, text: &str) -> Vec<Variable> {
        let Some(names_end) = text.find(']') else {
            return Vec::new();
        };
        let names = text[..names_end]
            .trim_start()
            .trim_start_matches('[')
            .trim();
        if names.is_empty() {
            return Vec::new();
        }

        if names.contains(')') {
            // Function definitions: names only, no values.
            return names
                .split("),")
                .map(|name| {
                    let mut name = name.trim().to_string();
                    if !name.ends_with(')') {
                        name.push(')');
                    }
                    Variable { name, value: None }
                })
                .collect();
        }

        let separator = format!("\"{VALUE_SEPARATOR}\"");
        let values_text = text[names_end + 1..].trim().replace('\n', "");
        let mut values = values_text.split(separator.as_str()).map(str::trim);
        names
            .split(',')
            .map(|name| Variable {
                name: name.trim().to_string(),
                value: values.next().filter(|v| !v.is_empty()).map(String::from),
            })
            .collect()
    }
}

enum CommentScan {
    Code,
    CommentOnly,
    TooManyClosers,
    TooManyOpeners,
    UnterminatedString,
}

/// One pass over the command deciding whether it contains any code at all.
/// Handles nested `/* */`, `"` strings and `\` escapes.
fn scan_comments(command: &str) -> CommentScan {
    let chars: Vec<char> = command.chars().collect();
    let mut comment_only = true;
    let mut level = 0usize;
    let mut in_string = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '\\' {
            i += 1; // skip the escaped character
            if level == 0 && !in_string {
                comment_only = false;
            }
        } else if c == '"' && level == 0 {
            in_string = !in_string;
            comment_only = false;
        } else if !in_string && c == '/' && chars.get(i + 1) == Some(&'*') {
            level += 1;
            i += 1;
        } else if !in_string && c == '*' && chars.get(i + 1) == Some(&'/') {
            if level == 0 {
                return CommentScan::TooManyClosers;
            }
            level -= 1;
            i += 1;
        } else if comment_only && level == 0 && !c.is_whitespace() {
            comment_only = false;
        }
        i += 1;
    }
    if level > 0 {
        CommentScan::TooManyOpeners
    } else if in_string {
        CommentScan::UnterminatedString
    } else if comment_only {
        CommentScan::CommentOnly
    } else {
        CommentScan::Code
    }
}

fn between<'a>(text: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = text.find(open)? + open.len();
    let end = start + text[start..].find(close)?;
    Some(&text[start..end])
}

/// Trim and collapse internal whitespace runs to single spaces.
fn simplified(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Maxima's tex1 renders labels inside `\mbox{...}`. Replace that wrapper by
/// an eqnarray environment that LaTeX renderers can digest.
fn rewrite_mbox(latex: &str) -> String {
    let Some(mbox_start) = latex.find("\\mbox{") else {
        return latex.to_string();
    };
    let brace_start = mbox_start + "\\mbox".len();
    let mut depth = 0usize;
    let mut close = None;
    for (offset, c) in latex[brace_start..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    close = Some(brace_start + offset);
                    break;
                }
            }
            _ => {}
        }
    }
    let Some(close) = close else {
        return latex.to_string();
    };
    let mut content = latex[close + 1..].trim();
    if content.is_empty() {
        // Empty \mbox{} (print() output): the real content precedes it.
        content = latex[..mbox_start].trim();
    }
    format!("\\begin{{eqnarray*}}{content}\\end{{eqnarray*}}")
}
