use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories that never hold crate sources. The reference pack under `examples/`
// follows other projects' conventions and must not be policed here.
const SKIPPED_ROOTS: [&str; 2] = ["./target", "./examples"];

// Collects every line flagged by one policy check in one file, so the error lists
// all offending lines at once instead of failing on the first.
struct PolicyCollector {
    violations: Vec<String>,
    file_path: PathBuf,
    kind: Policy,
}

#[derive(Clone, Copy)]
enum Policy {
    UnderscoreBinding,
    ForbiddenWords,
    StarsInComment,
    AllCapsComment,
    AllowDeadCode,
}

impl Policy {
    fn headline(self) -> &'static str {
        match self {
            Policy::UnderscoreBinding => "underscore-prefixed variables",
            Policy::ForbiddenWords => "comments narrating edits (fixed, changed, updated...)",
            Policy::StarsInComment => "'**' emphasis inside non-doc comments",
            Policy::AllCapsComment => "comments with all uppercase alphabetic characters",
            Policy::AllowDeadCode => "#[allow(dead_code)] attributes",
        }
    }

    fn advice(self) -> &'static str {
        match self {
            Policy::UnderscoreBinding => {
                "Underscore-prefixed variable names are not allowed in this project."
            }
            Policy::ForbiddenWords | Policy::StarsInComment => {
                "Please remove these patterns before committing."
            }
            Policy::AllCapsComment => {
                "Comments where all alphabetic characters are uppercase are STRICTLY FORBIDDEN in this project."
            }
            Policy::AllowDeadCode => {
                "Either use the code (removing the attribute) or remove it completely."
            }
        }
    }
}

impl PolicyCollector {
    fn new(file_path: &Path, kind: Policy) -> Self {
        Self {
            violations: Vec::new(),
            file_path: file_path.to_path_buf(),
            kind,
        }
    }

    // After searching, report every violation found in this file, if any.
    fn check_and_get_error_message(&self) -> Option<String> {
        if self.violations.is_empty() {
            return None;
        }

        let file_name = self.file_path.to_str().unwrap_or("?");
        let mut error_msg = format!(
            "\n❌ ERROR: Found {} {} in {}:\n",
            self.violations.len(),
            self.kind.headline(),
            file_name
        );
        for violation in &self.violations {
            error_msg.push_str(&format!("   {violation}\n"));
        }
        error_msg.push_str(&format!("\n⚠️ {}\n", self.kind.advice()));
        Some(error_msg)
    }

    fn accepts(&self, line_text: &str) -> bool {
        match self.kind {
            Policy::UnderscoreBinding => !is_comment_or_string_match(line_text),
            Policy::ForbiddenWords | Policy::AllowDeadCode => true,
            // Bold text is tolerated in doc comments, which render as markdown.
            Policy::StarsInComment => !is_doc_comment(line_text),
            Policy::AllCapsComment => comment_text(line_text).is_some_and(|text| {
                let alpha: Vec<char> = text.chars().filter(|c| c.is_alphabetic()).collect();
                !alpha.is_empty() && alpha.iter().all(|c| c.is_uppercase())
            }),
        }
    }
}

impl Sink for PolicyCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if self.accepts(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn is_doc_comment(line: &str) -> bool {
    line.trim_start().starts_with("///")
}

// Underscore identifiers are only a violation in code, not inside comments or
// string literals.
fn is_comment_or_string_match(line_text: &str) -> bool {
    if line_text.trim_start().starts_with("//") {
        return true;
    }
    line_text
        .split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'))
}

fn comment_text(line_text: &str) -> Option<&str> {
    let trimmed = line_text.trim_start();
    if let Some(rest) = trimmed.strip_prefix("///") {
        return Some(rest.trim());
    }
    if let Some(rest) = trimmed.strip_prefix("//") {
        return Some(rest.trim());
    }
    let idx = line_text.find("/*")?;
    let body = &line_text[idx + 2..];
    Some(match body.find("*/") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    })
}

fn rust_sources(include_build_script: bool) -> Vec<PathBuf> {
    WalkDir::new(".")
        .into_iter()
        .filter_entry(|e| !SKIPPED_ROOTS.iter().any(|root| e.path().starts_with(root)))
        .filter_map(|e| e.ok())
        .filter(|e| include_build_script || e.file_name() != "build.rs")
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.path().to_path_buf())
        .collect()
}

fn run_policy(
    pattern: &str,
    kind: Policy,
    include_build_script: bool,
) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(pattern)?;
    let mut searcher = Searcher::new();

    for path in rust_sources(include_build_script) {
        if std::fs::read_to_string(&path).is_err() {
            continue;
        }
        let mut collector = PolicyCollector::new(&path, kind);
        searcher.search_path(&matcher, &path, &mut collector)?;
        if let Some(error_message) = collector.check_and_get_error_message() {
            return Err(error_message.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in ["sdl", "metrics", "cli", "tests", "benches"] {
        println!("cargo:rerun-if-changed={dir}");
    }

    let checks: [(&str, Policy, bool); 5] = [
        (r"\b(_[a-zA-Z0-9_]+)\b", Policy::UnderscoreBinding, true),
        (
            r"(//|/\*|///).*(?:FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE)",
            Policy::ForbiddenWords,
            false,
        ),
        (r"(//|/\*).*\*\*", Policy::StarsInComment, false),
        (r"(//|/\*|///).*", Policy::AllCapsComment, false),
        (
            r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
            Policy::AllowDeadCode,
            false,
        ),
    ];

    for (pattern, kind, include_build_script) in checks {
        if let Err(e) = run_policy(pattern, kind, include_build_script) {
            // Shown in cargo's output; fails the build.
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
