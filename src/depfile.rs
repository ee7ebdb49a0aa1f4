//! Parsing of Makefile-syntax .d files, as written by `gcc -MD -MF`.

use crate::scanner::{ParseResult, Scanner};

#[derive(Debug)]
pub struct Deps {
    pub targets: Vec<String>,
    pub deps: Vec<String>,
}

/// Skip spaces and backslashed newlines.
fn skip_spaces(scanner: &mut Scanner) -> ParseResult<()> {
    loop {
        match scanner.read() {
            ' ' | '\t' => {}
            '\\' => match scanner.read() {
                '\n' => {}
                '\r' => scanner.expect('\n')?,
                _ => return scanner.parse_error("invalid backslash escape"),
            },
            '\0' => {
                if !scanner.at_end() {
                    scanner.back();
                }
                break;
            }
            _ => {
                scanner.back();
                break;
            }
        }
    }
    Ok(())
}

/// Read one path, unescaping "\ " and "$$".  Returns None if there is no
/// path before the next separator.
fn read_path(scanner: &mut Scanner) -> ParseResult<Option<String>> {
    skip_spaces(scanner)?;
    let start = scanner.ofs;
    let mut path: Vec<u8> = Vec::new();
    while !scanner.at_end() {
        match scanner.peek() {
            ' ' | '\t' | '\n' | '\r' => break,
            ':' => {
                // "c:\foo" style drive letters are part of the path.
                if path.len() == 1 {
                    scanner.next();
                    if matches!(scanner.peek(), '\\' | '/') {
                        path.push(b':');
                        continue;
                    }
                    scanner.back();
                }
                break;
            }
            '\\' => {
                scanner.next();
                match scanner.peek() {
                    ' ' | '#' => {
                        path.push(scanner.read_byte());
                    }
                    '\n' | '\r' => {
                        scanner.back();
                        break;
                    }
                    _ => path.push(b'\\'),
                }
            }
            '$' => {
                scanner.next();
                if !scanner.skip('$') {
                    return scanner.parse_error("expected $$");
                }
                path.push(b'$');
            }
            _ => path.push(scanner.read_byte()),
        }
    }
    if path.is_empty() {
        return Ok(None);
    }
    match String::from_utf8(path) {
        Ok(path) => Ok(Some(path)),
        Err(_) => {
            scanner.ofs = start;
            scanner.parse_error("path is not valid UTF-8")
        }
    }
}

fn skip_newlines(scanner: &mut Scanner) {
    while scanner.skip('\n') || scanner.skip('\r') {}
}

/// Parse all rules in a depfile.  Dependencies of every rule are collected;
/// empty rules (as emitted by `-MP`) contribute nothing.
pub fn parse(scanner: &mut Scanner) -> ParseResult<Deps> {
    let mut targets = Vec::new();
    let mut deps = Vec::new();
    skip_newlines(scanner);
    while !scanner.at_end() {
        let mut rule_targets = Vec::new();
        while let Some(target) = read_path(scanner)? {
            rule_targets.push(target);
        }
        if rule_targets.is_empty() {
            return scanner.parse_error("expected file");
        }
        scanner.expect(':')?;
        while let Some(dep) = read_path(scanner)? {
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }
        if !scanner.at_end() {
            scanner.skip('\r');
            scanner.expect('\n')?;
        }
        skip_newlines(scanner);
        for target in rule_targets {
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
    }
    Ok(Deps { targets, deps })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn must_parse(buf: &[u8]) -> Deps {
        let mut scanner = Scanner::new(buf);
        match parse(&mut scanner) {
            Err(err) => {
                println!("{}", scanner.format_parse_error(Path::new("test"), err));
                panic!("failed parse");
            }
            Ok(d) => d,
        }
    }

    #[test]
    fn test_parse() {
        let deps = must_parse(b"build/browse.o: src/browse.cc src/browse.h build/browse_py.h\n");
        assert_eq!(deps.targets, vec!["build/browse.o"]);
        assert_eq!(deps.deps.len(), 3);
    }

    #[test]
    fn continuation_lines() {
        let deps = must_parse(b"main.o: main.c \\\n  /usr/include/stdio.h \\\n  util.h\n");
        assert_eq!(deps.deps, vec!["main.c", "/usr/include/stdio.h", "util.h"]);
    }

    #[test]
    fn escaped_space_and_phony_rules() {
        let deps = must_parse(b"out.o: my\\ file.h other.h\n\nmy\\ file.h:\nother.h:\n");
        assert_eq!(deps.deps, vec!["my file.h", "other.h"]);
        assert_eq!(deps.targets.len(), 3);
    }

    #[test]
    fn no_trailing_newline() {
        let deps = must_parse(b"out: in");
        assert_eq!(deps.deps, vec!["in"]);
    }

    #[test]
    fn non_ascii_paths() {
        let deps = must_parse("out.o: /usr/include/café.h src/日本.h\n".as_bytes());
        assert_eq!(deps.deps, vec!["/usr/include/café.h", "src/日本.h"]);
    }

    #[test]
    fn invalid_utf8_path() {
        let mut scanner = Scanner::new(b"out.o: bad\xff.h\n");
        let err = parse(&mut scanner).unwrap_err();
        let msg = scanner.format_parse_error(Path::new("out.d"), err);
        assert!(msg.contains("not valid UTF-8"), "{}", msg);
    }

    #[test]
    fn garbage() {
        let mut scanner = Scanner::new(b"garbage text\n");
        assert!(parse(&mut scanner).is_err());
    }
}
