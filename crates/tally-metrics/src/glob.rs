//! Redis-style glob matching for key listing.
//!
//! Supports `*`, `?`, `[abc]`, `[a-z]`, `[^abc]` and `\` escapes.

/// Returns `true` if `text` matches `pattern`.
#[must_use]
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    match_from(&pattern, &text)
}

fn match_from(pattern: &[char], text: &[char]) -> bool {
    let (mut p, mut t) = (0, 0);
    // Backtrack point for the most recent `*`: (pattern index after it, text index).
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        let step = match pattern.get(p) {
            Some('*') => {
                star = Some((p + 1, t));
                p += 1;
                continue;
            }
            Some('?') => Some(1),
            Some('[') => match_class(&pattern[p..], text[t]),
            Some('\\') if p + 1 < pattern.len() => (pattern[p + 1] == text[t]).then_some(2),
            Some(c) => (*c == text[t]).then_some(1),
            None => None,
        };

        if let Some(width) = step {
            p += width;
            t += 1;
        } else if let Some((star_p, star_t)) = star {
            p = star_p;
            t = star_t + 1;
            star = Some((star_p, star_t + 1));
        } else {
            return false;
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}

/// Matches a `[...]` class at the start of `pattern` against `c`.
///
/// Returns the width of the class in the pattern on a match.
fn match_class(pattern: &[char], c: char) -> Option<usize> {
    let end = pattern.iter().skip(1).position(|x| *x == ']')? + 1;
    let mut class = &pattern[1..end];
    let negate = class.first() == Some(&'^');
    if negate {
        class = &class[1..];
    }

    let mut matched = false;
    let mut i = 0;
    while i < class.len() {
        if i + 2 < class.len() && class[i + 1] == '-' {
            if class[i] <= c && c <= class[i + 2] {
                matched = true;
            }
            i += 3;
        } else {
            if class[i] == c {
                matched = true;
            }
            i += 1;
        }
    }

    (matched != negate).then_some(end + 1)
}
