use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Source trees held to the project's coding policy. Anything else under the
// package root is someone else's code and is never scanned.
const POLICED_DIRS: [&str; 4] = ["cychp", "cli", "tests", "benches"];

/// One policy rule: a line pattern plus how to report its matches.
struct Rule {
    pattern: &'static str,
    what: &'static str,
    advice: &'static str,
    accept: fn(&str) -> bool,
}

const RULES: [Rule; 4] = [
    Rule {
        pattern: r"\b(_[a-zA-Z0-9_]+)\b",
        what: "underscore-prefixed variables",
        advice: "Either use the variable (removing the underscore) or remove it completely.",
        accept: is_code_identifier,
    },
    Rule {
        pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        what: "#[allow(dead_code)] attributes",
        advice: "Either use the code (removing the attribute) or remove it completely.",
        accept: always,
    },
    Rule {
        pattern: r"(//|/\*).*(?:FIXED|FIXES|FIX|CHANGED|CHANGES|CHANGE|UPDATED|UPDATES|UPDATE)",
        what: "forbidden comment patterns",
        advice: "Comments describing edits belong in version control, not in the source.",
        accept: always,
    },
    Rule {
        pattern: r"(//|/\*).*",
        what: "comments with all uppercase alphabetic characters",
        advice: "Strongly consider deleting the comment completely.",
        accept: is_shouting_comment,
    },
];

// Collects every accepted match of one rule in one file.
struct ViolationCollector {
    violations: Vec<String>,
    accept: fn(&str) -> bool,
}

impl Sink for ViolationCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if (self.accept)(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

fn always(_: &str) -> bool {
    true
}

// Skips matches inside comments and string literals.
fn is_code_identifier(line_text: &str) -> bool {
    if line_text.trim_start().starts_with("//") {
        return false;
    }
    !line_text
        .split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'))
}

fn is_shouting_comment(line_text: &str) -> bool {
    let trimmed = line_text.trim_start();
    let comment = if let Some(rest) = trimmed.strip_prefix("//") {
        rest.trim_start_matches(['/', '!'])
    } else if let Some(idx) = line_text.find("/*") {
        let rest = &line_text[idx + 2..];
        rest.find("*/").map_or(rest, |end| &rest[..end])
    } else {
        return false;
    };
    let mut letters = comment.chars().filter(|c| c.is_alphabetic()).peekable();
    letters.peek().is_some() && letters.all(char::is_uppercase)
}

fn rust_sources() -> impl Iterator<Item = PathBuf> {
    POLICED_DIRS.into_iter().flat_map(|dir| {
        WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
            .map(|e| e.into_path())
    })
}

fn check_rule(rule: &Rule, path: &Path, searcher: &mut Searcher) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(rule.pattern)?;
    let mut collector = ViolationCollector {
        violations: Vec::new(),
        accept: rule.accept,
    };
    searcher.search_path(&matcher, path, &mut collector)?;
    if collector.violations.is_empty() {
        return Ok(());
    }

    let mut error_msg = format!(
        "\n❌ ERROR: Found {} {} in {}:\n",
        collector.violations.len(),
        rule.what,
        path.display()
    );
    for violation in &collector.violations {
        error_msg.push_str(&format!("   {violation}\n"));
    }
    error_msg.push_str(&format!(
        "\n⚠️ {} are not allowed in this project.\n   {}\n",
        rule.what, rule.advice
    ));
    Err(error_msg.into())
}

fn scan_sources() -> Result<(), Box<dyn Error>> {
    let mut searcher = Searcher::new();
    for path in rust_sources() {
        for rule in &RULES {
            check_rule(rule, &path, &mut searcher)?;
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in POLICED_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    if let Err(e) = scan_sources() {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
