// Kernel source scanning
//
// The host backend does not compile anything; it only checks the source is
// well formed and collects the `__kernel void NAME(...)` declarations with
// their parameter counts. Diagnostics use the usual `<source>:LINE: error:`
// build log format.

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Punct(char),
}

#[derive(Debug, Clone)]
struct Located {
    token: Token,
    line: usize,
}

fn diagnostic(line: usize, message: &str) -> String {
    format!("<source>:{}: error: {}", line, message)
}

/// Scan `source` and return entry point name -> parameter count, or the
/// build log on failure.
pub fn scan_entry_points(source: &[u8]) -> Result<HashMap<String, usize>, String> {
    let text = std::str::from_utf8(source)
        .map_err(|e| diagnostic(1, &format!("source is not valid UTF-8 ({})", e)))?;

    let tokens = tokenize(text)?;
    check_balance(&tokens)?;

    let mut entries = HashMap::new();
    let mut i = 0;
    while i < tokens.len() {
        let is_qualifier = matches!(&tokens[i].token, Token::Ident(w) if w == "__kernel" || w == "kernel");
        if !is_qualifier {
            i += 1;
            continue;
        }

        let line = tokens[i].line;
        let name = match (tokens.get(i + 1), tokens.get(i + 2), tokens.get(i + 3)) {
            (
                Some(Located { token: Token::Ident(ret), .. }),
                Some(Located { token: Token::Ident(name), .. }),
                Some(Located { token: Token::Punct('('), .. }),
            ) => {
                if ret != "void" {
                    return Err(diagnostic(line, &format!("kernel '{}' must return void", name)));
                }
                name.clone()
            }
            _ => return Err(diagnostic(line, "expected 'void NAME(' after kernel qualifier")),
        };

        let (params, next) = count_params(&tokens, i + 4);
        if entries.insert(name.clone(), params).is_some() {
            return Err(diagnostic(line, &format!("redefinition of kernel '{}'", name)));
        }
        i = next;
    }

    Ok(entries)
}

fn tokenize(text: &str) -> Result<Vec<Located>, String> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    let mut line = 1;

    while let Some(c) = chars.next() {
        match c {
            '\n' => line += 1,
            '/' if chars.peek() == Some(&'/') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        line += 1;
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                let start = line;
                chars.next();
                let mut prev = '\0';
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '\n' {
                        line += 1;
                    }
                    if prev == '*' && c == '/' {
                        closed = true;
                        break;
                    }
                    prev = c;
                }
                if !closed {
                    return Err(diagnostic(start, "unterminated comment"));
                }
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut word = String::from(c);
                while let Some(&n) = chars.peek() {
                    if n.is_alphanumeric() || n == '_' {
                        word.push(n);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Located {
                    token: Token::Ident(word),
                    line,
                });
            }
            c if c.is_whitespace() => {}
            c => tokens.push(Located {
                token: Token::Punct(c),
                line,
            }),
        }
    }

    Ok(tokens)
}

fn check_balance(tokens: &[Located]) -> Result<(), String> {
    let mut open: Vec<(char, usize)> = Vec::new();

    for t in tokens {
        let Token::Punct(c) = t.token else { continue };
        match c {
            '(' | '{' | '[' => open.push((c, t.line)),
            ')' | '}' | ']' => {
                let expected = match c {
                    ')' => '(',
                    '}' => '{',
                    _ => '[',
                };
                match open.pop() {
                    Some((o, _)) if o == expected => {}
                    _ => return Err(diagnostic(t.line, &format!("unexpected '{}'", c))),
                }
            }
            _ => {}
        }
    }

    match open.pop() {
        Some((c, line)) => Err(diagnostic(line, &format!("unmatched '{}' at end of input", c))),
        None => Ok(()),
    }
}

/// Count the comma-separated parameters of the list starting at `start`
/// (just past the opening paren). Returns the count and the index after the
/// closing paren.
fn count_params(tokens: &[Located], start: usize) -> (usize, usize) {
    let mut depth = 1;
    let mut commas = 0;
    let mut any = false;
    let mut only_void = true;
    let mut i = start;

    while i < tokens.len() {
        match &tokens[i].token {
            Token::Punct('(') => depth += 1,
            Token::Punct(')') => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            Token::Punct(',') if depth == 1 => commas += 1,
            _ => {}
        }
        if depth >= 1 {
            any = true;
            only_void &= matches!(&tokens[i].token, Token::Ident(w) if w == "void");
        }
        i += 1;
    }

    let count = if !any || only_void { 0 } else { commas + 1 };
    (count, i + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_entry_points_and_parameter_counts() {
        let source = br#"
            // helpers are not entry points
            float3 reflect3(float3 v, float3 n) { return v; }

            __kernel void ParticleSimulation(__global float4* p, __global float4* v,
                                             __global float4* c, __constant float4* b,
                                             __constant float4* s, __constant float4* t)
            {
                int i = get_global_id(0);
            }

            /* kernel void Hidden(int a) {} */
            kernel void Empty(void) {}
        "#;

        let entries = scan_entry_points(source).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries["ParticleSimulation"], 6);
        assert_eq!(entries["Empty"], 0);
    }

    #[test]
    fn unbalanced_braces_produce_a_located_log() {
        let source = b"__kernel void A(__global float* x)\n{\n  x[0] = 1.0f;\n";
        let log = scan_entry_points(source).unwrap_err();
        assert_eq!(log, "<source>:2: error: unmatched '{' at end of input");
    }

    #[test]
    fn invalid_utf8_is_a_build_error() {
        let log = scan_entry_points(&[0x5f, 0xff, 0xfe]).unwrap_err();
        assert!(log.starts_with("<source>:1: error:"));
    }

    #[test]
    fn duplicate_kernels_are_rejected() {
        let source = b"__kernel void A(int x) {}\n__kernel void A(int y) {}\n";
        let log = scan_entry_points(source).unwrap_err();
        assert!(log.contains("redefinition of kernel 'A'"));
        assert!(log.starts_with("<source>:2:"));
    }
}
