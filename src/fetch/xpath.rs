use std::sync::OnceLock;

use regex::Regex;

use crate::error::ExecutionError;

struct PredicatePatterns {
    has_attr: Regex,
    attr_equals: Regex,
    attr_contains: Regex,
    position: Regex,
}

fn patterns() -> &'static PredicatePatterns {
    static PATTERNS: OnceLock<PredicatePatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| PredicatePatterns {
        has_attr: Regex::new(r"^@([\w:-]+)$").expect("static regex"),
        attr_equals: Regex::new(r#"^@([\w:-]+)\s*=\s*(?:'([^']*)'|"([^"]*)")$"#).expect("static regex"),
        attr_contains: Regex::new(
            r#"^contains\(\s*@([\w:-]+)\s*,\s*(?:'([^']*)'|"([^"]*)")\s*\)$"#,
        )
        .expect("static regex"),
        position: Regex::new(r"^[1-9]\d*$").expect("static regex"),
    })
}

fn invalid(xpath: &str, reason: impl Into<String>) -> ExecutionError {
    ExecutionError::InvalidSelector {
        selector: xpath.to_string(),
        reason: reason.into(),
    }
}

#[derive(Debug, PartialEq)]
enum Axis {
    Child,
    Descendant,
}

/// Split a location path into `(axis, step)` pairs, ignoring `/` inside predicates
fn split_steps(xpath: &str) -> Result<Vec<(Axis, String)>, ExecutionError> {
    let mut steps = Vec::new();
    let mut current = String::new();
    let mut axis = None;
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut chars = xpath.chars().peekable();

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            current.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => {
                quote = Some(c);
                current.push(c);
            }
            '[' => {
                depth += 1;
                current.push(c);
            }
            ']' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| invalid(xpath, "unbalanced ']'"))?;
                current.push(c);
            }
            '/' if depth == 0 => {
                if let Some(axis) = axis.take() {
                    if current.trim().is_empty() {
                        return Err(invalid(xpath, "empty location step"));
                    }
                    steps.push((axis, std::mem::take(&mut current).trim().to_string()));
                } else if !current.trim().is_empty() {
                    return Err(invalid(xpath, "relative paths are not supported"));
                }
                if chars.peek() == Some(&'/') {
                    chars.next();
                    axis = Some(Axis::Descendant);
                } else {
                    axis = Some(Axis::Child);
                }
            }
            _ => current.push(c),
        }
    }

    if quote.is_some() || depth != 0 {
        return Err(invalid(xpath, "unterminated predicate"));
    }
    match axis {
        Some(axis) if !current.trim().is_empty() => {
            steps.push((axis, current.trim().to_string()))
        }
        Some(_) => return Err(invalid(xpath, "path ends with '/'")),
        None => return Err(invalid(xpath, "path must start with '/' or '//'")),
    }
    Ok(steps)
}

fn css_string(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Translate one step such as `div[@class='x'][2]` into a compound CSS selector
fn translate_step(xpath: &str, step: &str) -> Result<String, ExecutionError> {
    let (name, predicates) = match step.find('[') {
        Some(pos) => (&step[..pos], &step[pos..]),
        None => (step, ""),
    };

    let name = name.trim();
    let valid_name = name == "*"
        || (!name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    if !valid_name {
        return Err(invalid(xpath, format!("unsupported step {:?}", step)));
    }

    let mut css = name.to_string();
    let patterns = patterns();
    let mut rest = predicates;

    while !rest.is_empty() {
        let end = find_predicate_end(rest).ok_or_else(|| invalid(xpath, "unterminated predicate"))?;
        let predicate = rest[1..end].trim();
        rest = rest[end + 1..].trim_start();

        if let Some(caps) = patterns.attr_equals.captures(predicate) {
            let value = caps.get(2).or_else(|| caps.get(3)).map_or("", |m| m.as_str());
            css.push_str(&format!("[{}={}]", &caps[1], css_string(value)));
        } else if let Some(caps) = patterns.attr_contains.captures(predicate) {
            let value = caps.get(2).or_else(|| caps.get(3)).map_or("", |m| m.as_str());
            css.push_str(&format!("[{}*={}]", &caps[1], css_string(value)));
        } else if let Some(caps) = patterns.has_attr.captures(predicate) {
            css.push_str(&format!("[{}]", &caps[1]));
        } else if patterns.position.is_match(predicate) {
            if name == "*" {
                css.push_str(&format!(":nth-child({})", predicate));
            } else {
                css.push_str(&format!(":nth-of-type({})", predicate));
            }
        } else {
            return Err(invalid(xpath, format!("unsupported predicate [{}]", predicate)));
        }

        if !rest.is_empty() && !rest.starts_with('[') {
            return Err(invalid(xpath, format!("unexpected text after predicate in {:?}", step)));
        }
    }

    Ok(css)
}

fn find_predicate_end(s: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (i, c) in s.char_indices().skip(1) {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, ']') => return Some(i),
            _ => {}
        }
    }
    None
}

/// Translate an XPath location path into an equivalent CSS selector.
///
/// Supported: absolute (`/`) and descendant (`//`) steps, element names or
/// `*`, and the predicates `[@a]`, `[@a='v']`, `[contains(@a,'v')]` and
/// `[n]`. A trailing `/text()` or `/@attr` step is accepted and dropped,
/// since extraction always reads text and links.
pub fn to_css(xpath: &str) -> Result<String, ExecutionError> {
    let mut steps = split_steps(xpath.trim())?;

    if let Some((_, last)) = steps.last() {
        if last == "text()" || last.starts_with('@') {
            steps.pop();
        }
    }
    if steps.is_empty() {
        return Err(invalid(xpath, "no element steps"));
    }

    let mut css = String::new();
    for (index, (axis, step)) in steps.iter().enumerate() {
        let compound = translate_step(xpath, step)?;
        match (index, axis) {
            (0, Axis::Descendant) => css.push_str(&compound),
            (0, Axis::Child) => {
                css.push_str(&compound);
                css.push_str(":root");
            }
            (_, Axis::Descendant) => {
                css.push(' ');
                css.push_str(&compound);
            }
            (_, Axis::Child) => {
                css.push_str(" > ");
                css.push_str(&compound);
            }
        }
    }
    Ok(css)
}
