//! Shell-style wildcard filtering of upstream tag lists.

use regex::Regex;

use super::errors::Result;

/// Compiled include/exclude patterns. Includes are applied first (an empty
/// include list admits everything), then excludes remove matches.
#[derive(Debug, Default)]
pub struct TagFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

/// Translate a shell-style wildcard (`*`, `?`) into an anchored regex.
fn compile_wildcard(pattern: &str) -> Result<Regex> {
    let mut regex = String::with_capacity(pattern.len() + 2);
    regex.push('^');
    for c in pattern.chars() {
        match c {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            c if c.is_ascii_alphanumeric() => regex.push(c),
            c => {
                regex.push('\\');
                regex.push(c);
            }
        }
    }
    regex.push('$');
    Ok(Regex::new(&regex)?)
}

impl TagFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        Ok(Self {
            include: include
                .iter()
                .map(|p| compile_wildcard(p))
                .collect::<Result<Vec<_>>>()?,
            exclude: exclude
                .iter()
                .map(|p| compile_wildcard(p))
                .collect::<Result<Vec<_>>>()?,
        })
    }

    pub fn matches(&self, tag: &str) -> bool {
        if !self.include.is_empty() && !self.include.iter().any(|re| re.is_match(tag)) {
            return false;
        }
        !self.exclude.iter().any(|re| re.is_match(tag))
    }

    pub fn apply(&self, tags: impl IntoIterator<Item = String>) -> Vec<String> {
        tags.into_iter().filter(|t| self.matches(t)).collect()
    }
}

#[cfg(test)]
mod test {
    use rstest::*;

    use super::*;

    #[rstest]
    fn include_then_exclude() {
        let filter = TagFilter::new(
            &["8.*".to_string()],
            &["*-rc*".to_string()],
        )
        .unwrap();
        let upstream = vec![
            "8.5".to_string(),
            "8.6".to_string(),
            "8.6-rc1".to_string(),
            "9.0".to_string(),
        ];
        assert_eq!(
            filter.apply(upstream),
            vec!["8.5".to_string(), "8.6".to_string()]
        );
    }

    #[rstest]
    fn empty_include_admits_everything() {
        let filter = TagFilter::new(&[], &["latest".to_string()]).unwrap();
        assert!(filter.matches("v1.0"));
        assert!(!filter.matches("latest"));
    }

    #[rstest]
    #[case::question_mark("8.?", "8.5", true)]
    #[case::question_mark_miss("8.?", "8.55", false)]
    #[case::dot_is_literal("8.5", "8x5", false)]
    #[case::anchored("8.*", "v8.5", false)]
    fn wildcard_semantics(#[case] pattern: &str, #[case] tag: &str, #[case] matched: bool) {
        let filter = TagFilter::new(&[pattern.to_string()], &[]).unwrap();
        assert_eq!(filter.matches(tag), matched, "{pattern} vs {tag}");
    }
}
