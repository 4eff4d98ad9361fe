//! Line-oriented unit scripts.
//!
//! A unit's content is its program: one directive per line, `#` starts a
//! comment. Parsing is strict so a typo in a fixture fails loudly instead of
//! silently capturing less.

use anyhow::{Context, Result, bail};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Directive {
    /// Resolve a unit and run it once.
    Load(String),
    /// Resolve the first resource with this name.
    Resource(String),
    /// Resolve every resource with this name.
    Resources(String),
    /// Load a unit on a new thread through the ambient loader, then join it.
    Spawn(String),
    /// Load a unit on a detached thread after a delay.
    Defer { delay: Duration, unit: String },
    /// Synthesize an empty unit at run time.
    Define(String),
    Sleep(Duration),
    Fail(String),
}

pub fn parse(content: &[u8]) -> Result<Vec<Directive>> {
    let text = std::str::from_utf8(content).context("unit content is not UTF-8 text")?;
    let mut directives = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let directive = parse_line(line).with_context(|| format!("line {}", index + 1))?;
        directives.push(directive);
    }
    Ok(directives)
}

fn parse_line(line: &str) -> Result<Directive> {
    let (keyword, rest) = match line.split_once(char::is_whitespace) {
        Some((keyword, rest)) => (keyword, rest.trim()),
        None => (line, ""),
    };
    let directive = match keyword {
        "load" => Directive::Load(single_operand(keyword, rest)?),
        "resource" => Directive::Resource(single_operand(keyword, rest)?),
        "resources" => Directive::Resources(single_operand(keyword, rest)?),
        "spawn" => Directive::Spawn(single_operand(keyword, rest)?),
        "define" => Directive::Define(single_operand(keyword, rest)?),
        "sleep" => Directive::Sleep(millis(&single_operand(keyword, rest)?)?),
        "defer" => {
            let mut operands = rest.split_whitespace();
            match (operands.next(), operands.next(), operands.next()) {
                (Some(delay), Some(unit), None) => Directive::Defer {
                    delay: millis(delay)?,
                    unit: unit.to_string(),
                },
                _ => bail!("defer expects '<ms> <unit>'"),
            }
        }
        "fail" => {
            if rest.is_empty() {
                Directive::Fail("unit requested failure".to_string())
            } else {
                Directive::Fail(rest.to_string())
            }
        }
        other => bail!("unknown directive '{other}'"),
    };
    Ok(directive)
}

fn single_operand(keyword: &str, rest: &str) -> Result<String> {
    let mut operands = rest.split_whitespace();
    match (operands.next(), operands.next()) {
        (Some(operand), None) => Ok(operand.to_string()),
        _ => bail!("{keyword} expects exactly one operand"),
    }
}

fn millis(raw: &str) -> Result<Duration> {
    let value: u64 = raw
        .parse()
        .with_context(|| format!("invalid millisecond value '{raw}'"))?;
    Ok(Duration::from_millis(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_directive_and_skips_comments() {
        let script = b"# demo entry\n\nload Demo$Helper\nresource config.properties\nresources META-INF/services\nspawn Worker\ndefer 50 Late\ndefine Generated\nsleep 5\nfail boom now\n";
        let parsed = parse(script).unwrap();
        assert_eq!(
            parsed,
            vec![
                Directive::Load("Demo$Helper".into()),
                Directive::Resource("config.properties".into()),
                Directive::Resources("META-INF/services".into()),
                Directive::Spawn("Worker".into()),
                Directive::Defer {
                    delay: Duration::from_millis(50),
                    unit: "Late".into()
                },
                Directive::Define("Generated".into()),
                Directive::Sleep(Duration::from_millis(5)),
                Directive::Fail("boom now".into()),
            ]
        );
    }

    #[test]
    fn errors_name_the_offending_line() {
        let err = parse(b"load A\njump B\n").unwrap_err();
        let rendered = format!("{err:#}");
        assert!(rendered.contains("line 2"), "{rendered}");
        assert!(rendered.contains("unknown directive 'jump'"), "{rendered}");

        assert!(parse(b"load\n").is_err());
        assert!(parse(b"load A B\n").is_err());
        assert!(parse(b"defer soon X\n").is_err());
        assert!(parse(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn empty_unit_is_a_valid_program() {
        assert!(parse(b"").unwrap().is_empty());
        assert!(parse(b"  # nothing here\n").unwrap().is_empty());
    }
}
