//! Name comparison and glob matching under IRC case rules.
//!
//! IRC folds `[]\~` onto `{}|^` in addition to ASCII letters, so
//! `Hub[1].lagun.co` and `hub{1}.lagun.co` name the same server.

/// Fold one byte to its lower-case IRC equivalent.
pub fn fold(b: u8) -> u8 {
    match b {
        b'[' => b'{',
        b']' => b'}',
        b'\\' => b'|',
        b'~' => b'^',
        _ => b.to_ascii_lowercase(),
    }
}

/// Case-folded key for hash lookups.
pub fn fold_key(s: &str) -> String {
    s.bytes().map(|b| char::from(fold(b))).collect()
}

/// Case-insensitive equality under IRC folding.
pub fn eq_ignore_case(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.bytes().zip(b.bytes()).all(|(x, y)| fold(x) == fold(y))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Star,
    Any,
    Lit(u8),
}

fn tokenize(pattern: &[u8]) -> Vec<Token> {
    let mut out = Vec::with_capacity(pattern.len());
    let mut i = 0;
    while i < pattern.len() {
        let tok = match pattern[i] {
            b'*' => Token::Star,
            b'?' => Token::Any,
            b'\\' if i + 1 < pattern.len() => {
                i += 1;
                Token::Lit(fold(pattern[i]))
            }
            c => Token::Lit(fold(c)),
        };
        out.push(tok);
        i += 1;
    }
    out
}

/// Glob-match `text` against `mask`: `*` is any run, `?` any single byte,
/// `\` escapes the next byte.
pub fn matches(mask: &str, text: &str) -> bool {
    let pattern = tokenize(mask.as_bytes());
    let text = text.as_bytes();

    // Iterative implementation to avoid stack overflow on long patterns.
    let mut pi = 0;
    let mut ti = 0;
    let mut star_pi = usize::MAX;
    let mut star_ti = 0;

    while ti < text.len() {
        let hit = match pattern.get(pi) {
            Some(Token::Any) => true,
            Some(Token::Lit(c)) => *c == fold(text[ti]),
            _ => false,
        };
        if hit {
            pi += 1;
            ti += 1;
        } else if pattern.get(pi) == Some(&Token::Star) {
            star_pi = pi;
            star_ti = ti;
            pi += 1;
        } else if star_pi != usize::MAX {
            pi = star_pi + 1;
            star_ti += 1;
            ti = star_ti;
        } else {
            return false;
        }
    }

    while pattern.get(pi) == Some(&Token::Star) {
        pi += 1;
    }

    pi == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_and_question() {
        assert!(matches("*.lagun.co", "hub.lagun.co"));
        assert!(matches("h?b.*", "hub.lagun.co"));
        assert!(matches("*", ""));
        assert!(!matches("*.lagun.co", "hub.lagun.net"));
        assert!(!matches("?", ""));
    }

    #[test]
    fn case_folds_irc_brackets() {
        assert!(matches("HUB[1].*", "hub{1}.lagun.co"));
        assert!(eq_ignore_case("Leaf~1.Lagun.co", "leaf^1.lagun.co"));
        assert_eq!(fold_key("A[B]"), "a{b}");
    }

    #[test]
    fn backslash_escapes_wildcards() {
        assert!(matches(r"a\*b", "a*b"));
        assert!(!matches(r"a\*b", "axxb"));
        assert!(matches(r"a\?", "a?"));
    }

    #[test]
    fn backtracks_over_multiple_stars() {
        assert!(matches("*a*b*c", "xxaxxbxxc"));
        assert!(!matches("*a*b*c", "xxaxxcxxb"));
    }
}
